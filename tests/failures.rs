// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use tokio_util::sync::CancellationToken;

    use gpupgrade_lib::{
        error::Error,
        hub::Run,
        state::Status,
        step::Substep,
        test_env::*,
    };

    const TWO_HOSTS: &[Layout<'static>] =
        &[(1, -1, "h1", 5432), (2, 0, "h1", 6000), (3, 1, "h2", 6000)];

    #[test]
    fn agent_that_cannot_start_fails_initialize() {
        let env = TestEnvironment::new("failures_agent_start", TWO_HOSTS);
        env.system.on("ssh h2", |_cmd, _out, err| {
            writeln!(err, "bash: gpupgrade_agent: No such file or directory")?;
            Ok(127)
        });

        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));

        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("start-agents"), "{message}");
        assert!(message.contains("host h2"), "{message}");
        assert!(message.contains("No such file or directory"), "{message}");
        assert!(!message.contains("host h1"), "{message}");

        assert_eq!(
            sender.statuses(),
            vec![
                (Substep::Config, Status::Running),
                (Substep::Config, Status::Complete),
                (Substep::StartAgents, Status::Running),
                (Substep::StartAgents, Status::Failed),
            ]
        );
        assert_eq!(step_sentinels(&env.state(), Substep::StartAgents), vec!["failed"]);
        assert!(step_sentinels(&env.state(), Substep::GenerateTargetConfig).is_empty());
    }

    #[test]
    fn unreachable_agent_is_named() {
        let env = TestEnvironment::new("failures_unreachable_agent", TWO_HOSTS);
        let agents = env.agents().unreachable("h2");
        let dials = agents.dial_counter();
        let hub = env.hub(agents);

        let (result, _) = block_on(run_recorded(&hub, Run::Initialize));
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "substep \"start-agents\": could not connect to the agents on the following hosts: h2"
        );
        assert_eq!(dials.get(), 2);
    }

    #[test]
    fn check_warnings_do_not_stop_initialize() {
        let env = TestEnvironment::new("failures_check_warnings", TWO_HOSTS);
        env.system.on("pg_upgrade", |cmd, _out, err| {
            if cmd.args_lossy().iter().any(|a| a == "--check") {
                writeln!(err, "Checking for reg* data types in user tables    warning")?;
                return Ok(1);
            }
            Ok(0)
        });

        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));
        result.unwrap();

        assert_eq!(
            sender.statuses().last(),
            Some(&(Substep::UpgradeCheck, Status::Complete))
        );

        let log = fs::read_to_string(env.state().log("initialize")).unwrap();
        assert!(log.contains("Checking for reg* data types"), "{log}");

        let captured = fs::read_to_string(
            LocalAgents::state(&env.agent_state, "h2")
                .segment_upgrade_dir(1)
                .join("check.stderr"),
        )
        .unwrap();
        assert!(captured.contains("Checking for reg* data types"));
    }

    #[test]
    fn failed_segment_check_names_host_and_content() {
        let env = TestEnvironment::new("failures_segment_check", TWO_HOSTS);
        env.system.on("pg_upgrade", |cmd, _out, err| {
            let args = cmd.args_lossy();
            if args.iter().any(|a| a == "--mode=segment") && args.iter().any(|a| a == "--new-gp-dbid")
            {
                let dbid_at = args.iter().position(|a| a == "--new-gp-dbid").unwrap() + 1;
                if args[dbid_at] == "3" {
                    writeln!(err, "old cluster uses tablespaces that cannot be upgraded")?;
                    return Ok(2);
                }
            }
            Ok(0)
        });

        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));

        let message = result.unwrap_err().to_string();
        assert!(message.contains("upgrade-check"), "{message}");
        assert!(
            message.contains("failed to check primary on host h2 with content 1"),
            "{message}"
        );
        assert!(message.contains("tablespaces"), "{message}");
        assert!(!message.contains("content 0"), "{message}");
        assert_eq!(
            sender.statuses().last(),
            Some(&(Substep::UpgradeCheck, Status::Failed))
        );
    }

    #[test]
    fn full_disk_on_one_host_stops_before_shutdown() {
        let env = TestEnvironment::new("failures_full_disk", TWO_HOSTS);
        let upgrade_parent = env.target_datadir("h2", 1).parent().unwrap().to_path_buf();
        env.system
            .fail_mkdir(&upgrade_parent, "ENOSPC: no space left on device");

        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));

        let message = result.unwrap_err().to_string();
        assert!(message.contains("create-target-datadirs"), "{message}");
        assert!(message.contains("h2"), "{message}");
        assert!(message.contains("no space left on device"), "{message}");

        assert_eq!(
            sender.statuses().last(),
            Some(&(Substep::CreateTargetDatadirs, Status::Failed))
        );
        assert!(step_sentinels(&env.state(), Substep::ShutdownSource).is_empty());
        assert!(env.source_datadir("h1", -1).join("postmaster.pid").exists());
        assert!(env.target_datadir("h1", 0).parent().unwrap().exists());
    }

    #[test]
    fn each_failing_host_reports_its_own_disk_error() {
        const THREE_HOSTS: &[Layout<'static>] =
            &[(1, -1, "h1", 5432), (2, 0, "h2", 6000), (3, 1, "h3", 6000)];
        let env = TestEnvironment::new("failures_two_full_disks", THREE_HOSTS);
        for (host, content, message) in [
            ("h2", 0, "ENOSPC: no space left on device"),
            ("h3", 1, "EIO: input/output error"),
        ] {
            let parent = env.target_datadir(host, content).parent().unwrap().to_path_buf();
            env.system.fail_mkdir(&parent, message);
        }

        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));

        let message = result.unwrap_err().to_string();
        assert!(message.contains("create-target-datadirs"), "{message}");

        let entries: Vec<&str> = message.split("\n\t* ").skip(1).collect();
        assert_eq!(entries.len(), 2, "{message}");
        let entry = |host: &str| {
            let prefix = format!("host {host}: ");
            entries
                .iter()
                .find(|e| e.starts_with(&prefix))
                .copied()
                .unwrap_or_else(|| panic!("no entry for {host} in {message}"))
        };
        assert!(entry("h2").contains("no space left on device"));
        assert!(!entry("h2").contains("input/output error"));
        assert!(entry("h3").contains("input/output error"));
        assert!(!entry("h3").contains("no space left on device"));

        assert_eq!(
            sender.statuses().last(),
            Some(&(Substep::CreateTargetDatadirs, Status::Failed))
        );
        assert!(step_sentinels(&env.state(), Substep::ShutdownSource).is_empty());
    }

    #[test]
    fn cancelled_execute_finishes_the_running_step() {
        let env = TestEnvironment::new("failures_cancelled_execute", TWO_HOSTS);
        let hub = env.hub(env.agents());
        let (result, _) = block_on(run_recorded(&hub, Run::Initialize));
        result.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        env.system.on("pg_upgrade", move |cmd, out, _err| {
            let args = cmd.args_lossy();
            if args.iter().any(|a| a == "--mode=dispatcher") && !args.iter().any(|a| a == "--check")
            {
                trigger.cancel();
                writeln!(out, "Upgrade Complete")?;
            }
            Ok(0)
        });

        let sender = RecordingSender::new();
        let stream = hub
            .open_stream(Run::Execute, Some(Box::new(sender.clone())))
            .unwrap();
        let err = block_on(hub.run(Run::Execute, &stream, &cancel)).unwrap_err();

        assert!(matches!(err, Error::Cancelled("copy-coordinator-datadir")), "{err}");
        assert_eq!(
            sender.statuses(),
            vec![
                (Substep::UpgradeCoordinator, Status::Running),
                (Substep::UpgradeCoordinator, Status::Complete),
            ]
        );
        assert_eq!(
            step_sentinels(&env.state(), Substep::UpgradeCoordinator),
            vec!["completed"]
        );
        assert!(!env.state().step("upgrade-primaries").path().exists());
        assert!(env.system.calls_labelled("rsync").is_empty());
    }
}
