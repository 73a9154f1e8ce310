// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::fs;

    use tokio_util::sync::CancellationToken;

    use gpupgrade_lib::{
        cluster::Cluster,
        hub::{
            reconfigure::{self, backup_path, configured_port, parse_port, updated_path, CONF},
            Hub, Run,
        },
        state::Status,
        step::{run_steps, Step, Substep},
        test_env::*,
    };

    const LAYOUT: &[Layout<'static>] = &[(1, -1, "h", 5432), (2, 0, "h", 6000), (3, 1, "h", 6001)];

    fn reconfigure_only(hub: &Hub) -> gpupgrade_lib::error::Result<()> {
        let steps = [Step {
            substep: Substep::ReconfigurePorts,
            run: reconfigure::reconfigure_ports,
        }];
        let stream = hub.open_stream(Run::Execute, None).unwrap();
        block_on(run_steps(hub, hub.state(), &stream, &steps, &CancellationToken::new()))
    }

    fn catalog_ports(env: &TestEnvironment) -> Vec<(i32, u16)> {
        let database = env.connector.database(&env.target_datadir("h", -1)).unwrap();
        let mut ports: Vec<(i32, u16)> = database
            .borrow()
            .segments
            .iter()
            .map(|s| (s.content, s.port))
            .collect();
        ports.sort();
        ports
    }

    #[test]
    fn interrupted_conf_swap_is_finished_on_rerun() {
        let env = TestEnvironment::new("reconfigure_interrupted_swap", LAYOUT);
        let hub = env.hub(env.agents());
        let (result, _) = block_on(run_recorded(&hub, Run::Initialize));
        result.unwrap();

        let coordinator = env.target_datadir("h", -1);
        env.system.fail_next_rename(updated_path(&coordinator));

        let message = reconfigure_only(&hub).unwrap_err().to_string();
        assert!(message.contains("injected failure renaming"), "{message}");
        assert!(message.contains("postgresql.conf.bak"), "{message}");
        assert_eq!(hub.state().step("reconfigure-ports").status(), Status::Failed);

        // The catalog moved, the configuration file is half swapped.
        assert_eq!(catalog_ports(&env), vec![(-1, 5432), (0, 6000), (1, 6001)]);
        assert!(!coordinator.join(CONF).exists());
        let backup = fs::read_to_string(backup_path(&coordinator)).unwrap();
        assert_eq!(parse_port(&backup), Some(5433));
        assert!(!coordinator.join("postmaster.pid").exists());

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(target.port_for(-1), Some(5433));

        reconfigure_only(&hub).unwrap();
        assert_eq!(hub.state().step("reconfigure-ports").status(), Status::Complete);

        assert_eq!(configured_port(&coordinator).unwrap(), Some(5432));
        assert!(!updated_path(&coordinator).exists());
        let backup = fs::read_to_string(backup_path(&coordinator)).unwrap();
        assert_eq!(parse_port(&backup), Some(5433));

        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(target.port_for(-1), Some(5432));
        assert_eq!(target.port_for(1), Some(6001));
        assert_eq!(catalog_ports(&env), vec![(-1, 5432), (0, 6000), (1, 6001)]);

        // The coordinator was started in utility mode both times.
        let utility_starts = env
            .system
            .calls_labelled("gpstart")
            .iter()
            .filter(|c| c.args_lossy()[1].contains("gpstart -m"))
            .count();
        assert_eq!(utility_starts, 2);
    }

    #[test]
    fn missing_conf_without_update_needs_an_operator() {
        let dir = test_dir("reconfigure_missing_conf");
        fs::write(backup_path(&dir), "port=5433\n").unwrap();

        let err = reconfigure::recover_conf(&FakeSystem::new(), &dir).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("postgresql.conf.updated"), "{message}");
        assert!(message.contains("restore it from"), "{message}");
        assert!(!dir.join(CONF).exists());
    }

    #[test]
    fn rewrite_keeps_the_rest_of_the_file() {
        let dir = test_dir("reconfigure_rewrite");
        create_datadir(&dir, 5433).unwrap();
        let before = fs::read_to_string(dir.join(CONF)).unwrap();

        reconfigure::rewrite_conf_port(&FakeSystem::new(), &dir, 5433, 5432).unwrap();

        assert_eq!(
            fs::read_to_string(dir.join(CONF)).unwrap(),
            before.replace("port=5433", "port=5432")
        );
        assert_eq!(fs::read_to_string(backup_path(&dir)).unwrap(), before);
        assert!(!updated_path(&dir).exists());
    }

    #[test]
    fn spaced_port_setting_is_moved_to_the_source_port() {
        let env = TestEnvironment::new("reconfigure_spaced_port", LAYOUT);
        let hub = env.hub(env.agents());
        let (result, _) = block_on(run_recorded(&hub, Run::Initialize));
        result.unwrap();

        let coordinator = env.target_datadir("h", -1);
        fs::write(coordinator.join(CONF), "listen_addresses='*'\nport = 5433\n").unwrap();

        reconfigure_only(&hub).unwrap();

        assert_eq!(
            fs::read_to_string(coordinator.join(CONF)).unwrap(),
            "listen_addresses='*'\nport = 5432\n"
        );
        let target = Cluster::load(&env.state().target_cluster()).unwrap();
        assert_eq!(target.port_for(-1), Some(5432));
        assert_eq!(catalog_ports(&env), vec![(-1, 5432), (0, 6000), (1, 6001)]);
    }

    #[test]
    fn conf_without_the_old_port_is_not_swapped() {
        let dir = test_dir("reconfigure_port_not_found");
        fs::write(dir.join(CONF), "port = 6000\n").unwrap();

        let message = reconfigure::rewrite_conf_port(&FakeSystem::new(), &dir, 5433, 5432)
            .unwrap_err()
            .to_string();
        assert!(message.contains("does not set port 5433"), "{message}");

        assert_eq!(fs::read_to_string(dir.join(CONF)).unwrap(), "port = 6000\n");
        assert!(!backup_path(&dir).exists());
        assert!(!updated_path(&dir).exists());
    }
}
