// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::fs;

    use gpupgrade_lib::{
        agent::upgrade::segment_record,
        cluster::Cluster,
        hub::{reconfigure, Hub, Run},
        state::Status,
        step::Substep,
        test_env::*,
    };

    const LAYOUT: &[Layout<'static>] = &[(1, -1, "h", 5432), (2, 0, "h", 5433), (3, 1, "h", 5434)];

    fn ports(cluster: &Cluster) -> Vec<(i32, u16)> {
        let mut ports: Vec<(i32, u16)> = cluster.segments.iter().map(|s| (s.content, s.port)).collect();
        ports.sort();
        ports
    }

    fn assert_all_completed(env: &TestEnvironment, run: Run) {
        for step in run.steps() {
            assert_eq!(
                step_sentinels(&env.state(), step.substep),
                vec!["completed"],
                "{}",
                step.substep
            );
        }
    }

    /// Each step reports running, then complete, in order.
    fn assert_statuses(sender: &RecordingSender, run: Run) {
        let expected: Vec<(Substep, Status)> = run
            .steps()
            .iter()
            .flat_map(|s| [(s.substep, Status::Running), (s.substep, Status::Complete)])
            .collect();
        assert_eq!(sender.statuses(), expected);
    }

    fn initialize(env: &TestEnvironment) -> Hub {
        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Initialize));
        result.unwrap();
        assert_statuses(&sender, Run::Initialize);
        hub
    }

    #[test]
    fn initialize_creates_the_target_beside_the_source() {
        let env = TestEnvironment::new("simple_initialize", LAYOUT);
        let hub = initialize(&env);
        assert_all_completed(&env, Run::Initialize);

        let source = Cluster::load(&env.state().source_cluster()).unwrap();
        assert_eq!(ports(&source), vec![(-1, 5432), (0, 5433), (1, 5434)]);
        assert_eq!(source.bin_dir, env.source_bin_dir);

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(ports(&target), vec![(-1, 5433), (0, 7433), (1, 7434)]);
        assert_eq!(target.bin_dir, env.target_bin_dir);
        assert_eq!(target.major_version(), Some(7));
        assert_eq!(*hub.target(), target);

        for content in [-1, 0, 1] {
            assert_eq!(
                target.datadir_for(content),
                Some(env.target_datadir("h", content).as_path())
            );
            assert!(env.target_datadir("h", content).join("PG_VERSION").exists());
        }

        // Both clusters are left stopped.
        assert!(!env.source_datadir("h", -1).join("postmaster.pid").exists());
        assert!(!env.target_datadir("h", -1).join("postmaster.pid").exists());

        let config = fs::read_to_string(env.state().gpinitsystem_config()).unwrap();
        assert!(config.contains(&format!(
            "QD_PRIMARY_ARRAY=h~5433~{}~1~-1",
            env.target_datadir("h", -1).display()
        )));

        // The check leaves no conversion record behind.
        let agent_state = LocalAgents::state(&env.agent_state, "h");
        assert_eq!(segment_record(&agent_state, 0).status(), Status::Pending);
        assert!(agent_state.segment_upgrade_dir(0).join("check.stdout").exists());
        assert_eq!(env.system.calls_labelled("pg_upgrade").len(), 3);
    }

    #[test]
    fn full_upgrade_moves_the_target_onto_the_source_ports() {
        let env = TestEnvironment::new("simple_full_upgrade", LAYOUT);
        drop(initialize(&env));

        // A new hub picks up where the last one stopped.
        let hub = env.hub(env.agents());
        let (result, sender) = block_on(run_recorded(&hub, Run::Execute));
        result.unwrap();
        assert_statuses(&sender, Run::Execute);
        assert_all_completed(&env, Run::Execute);

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(ports(&target), vec![(-1, 5432), (0, 5433), (1, 5434)]);

        let coordinator = env.target_datadir("h", -1);
        assert_eq!(reconfigure::configured_port(&coordinator).unwrap(), Some(5432));
        let backup = fs::read_to_string(reconfigure::backup_path(&coordinator)).unwrap();
        assert_eq!(reconfigure::parse_port(&backup), Some(5433));
        assert!(coordinator.join("postmaster.pid").exists());

        // Primaries carry the coordinator catalog and keep their own configuration.
        let primary = env.target_datadir("h", 0);
        let catalog = fs::read_to_string(primary.join("PG_VERSION")).unwrap();
        assert!(catalog.contains(&coordinator.display().to_string()), "{catalog}");
        assert_eq!(reconfigure::configured_port(&primary).unwrap(), Some(7433));
        assert!(!env.agent_state.join("coordinator-copy").exists());

        let agent_state = LocalAgents::state(&env.agent_state, "h");
        for content in [0, 1] {
            assert_eq!(segment_record(&agent_state, content).status(), Status::Complete);
        }

        let database = env.connector.database(&coordinator).unwrap();
        let mut catalog_ports: Vec<(i32, u16)> = database
            .borrow()
            .segments
            .iter()
            .map(|s| (s.content, s.port))
            .collect();
        catalog_ports.sort();
        assert_eq!(catalog_ports, vec![(-1, 5432), (0, 5433), (1, 5434)]);

        let (result, sender) = block_on(run_recorded(&hub, Run::Finalize));
        result.unwrap();
        assert_statuses(&sender, Run::Finalize);
        assert_all_completed(&env, Run::Finalize);

        // The source was never touched.
        assert_eq!(
            reconfigure::configured_port(&env.source_datadir("h", 0)).unwrap(),
            Some(5433)
        );
    }

    #[test]
    fn revert_removes_the_target_and_restarts_the_source() {
        let env = TestEnvironment::new("simple_revert", LAYOUT);
        let hub = initialize(&env);

        let (result, sender) = block_on(run_recorded(&hub, Run::Revert));
        result.unwrap();
        assert_statuses(&sender, Run::Revert);
        assert_all_completed(&env, Run::Revert);

        for content in [-1, 0, 1] {
            assert!(!env.target_datadir("h", content).exists());
            assert!(env.source_datadir("h", content).join("PG_VERSION").exists());
        }
        assert!(env.source_datadir("h", -1).join("postmaster.pid").exists());

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert!(target.is_empty());
        assert_eq!(target.bin_dir, env.target_bin_dir);

        // Reverting again has nothing left to do.
        let (result, _) = block_on(run_recorded(&hub, Run::Revert));
        result.unwrap();
    }

    #[test]
    fn rerunning_initialize_is_harmless_until_the_target_exists() {
        let env = TestEnvironment::new("simple_rerun_config", LAYOUT);
        let hub = env.hub(env.agents());

        for _ in 0..2 {
            let stream = hub.open_stream(Run::Initialize, None).unwrap();
            block_on(gpupgrade_lib::step::run_steps(
                &hub,
                hub.state(),
                &stream,
                &Run::Initialize.steps()[..3],
                &tokio_util::sync::CancellationToken::new(),
            ))
            .unwrap();
        }

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(ports(&target), vec![(-1, 5433), (0, 7433), (1, 7434)]);
        assert_eq!(env.system.calls_labelled("ssh h").len(), 2);
    }
}
