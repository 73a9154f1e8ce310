// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The `Initialize` steps: discover the source cluster, start the agents, and create and check
//! the target cluster.

use std::{fs, io::Write, os::unix::fs::OpenOptionsExt, path::Path};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::info,
};

use crate::{
    agent::dirs,
    cluster::{
        catalog::{self, ConnectOptions},
        lifecycle::{self, shell_quote},
        Cluster,
    },
    error::{Error, MultiError, PathContext, Result},
    gpupgrade_capnp as wire,
    hub::{
        connections::for_hosts,
        execute::{upgrade_coordinator, upgrade_primaries},
        report,
        target::{self, SourceSettings},
        Hub,
    },
    step::{Step, Substep},
    stream::MultiplexedStream,
    system::{self, CommandSpec, ExitPolicy, System},
    version::GpVersion,
};

pub const STEPS: &[Step<Hub>] = &[
    Step {
        substep: Substep::Config,
        run: config,
    },
    Step {
        substep: Substep::StartAgents,
        run: start_agents,
    },
    Step {
        substep: Substep::GenerateTargetConfig,
        run: generate_target_config,
    },
    Step {
        substep: Substep::CreateTargetDatadirs,
        run: create_target_datadirs,
    },
    Step {
        substep: Substep::ShutdownSource,
        run: shutdown_source,
    },
    Step {
        substep: Substep::InitTarget,
        run: init_target,
    },
    Step {
        substep: Substep::ShutdownTarget,
        run: shutdown_target,
    },
    Step {
        substep: Substep::UpgradeCheck,
        run: upgrade_check,
    },
];

/// Asks the target installation for its version.
async fn target_version(system: &dyn System, bin_dir: &Path) -> Result<GpVersion> {
    let command = CommandSpec::new(bin_dir.join("postgres"))
        .arg("--gp-version")
        .label("postgres");
    let output = system::run_checked(system, &command, ExitPolicy::Strict).await?;

    GpVersion::parse_banner(&output.stdout_lossy()).map_err(|e| Error::Configuration(e.to_string()))
}

fn config<'a>(hub: &'a Hub, _stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let request = hub.request()?;

        let mut catalog = hub
            .connect(ConnectOptions::normal(request.source_port), "source")
            .await?;
        let source = catalog::from_database(&mut *catalog, &request.source_bin_dir).await?;
        let version = target_version(&*hub.system, &request.target_bin_dir).await?;

        info!(
            "source cluster has {} primaries on {} host(s); target version is {version}",
            source.primaries().len(),
            source.hosts().len()
        );

        let target = Cluster {
            segments: Vec::new(),
            bin_dir: request.target_bin_dir,
            version: Some(version),
        };
        hub.set_source(source)?;
        hub.set_target(target)
    }
    .boxed_local()
}

/// The agent executable installed next to the running hub.
fn agent_executable() -> Result<String> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Internal(format!("could not locate the hub executable: {e}")))?;
    Ok(exe
        .with_file_name("gpupgrade_agent")
        .to_string_lossy()
        .into_owned())
}

fn start_agents<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let source = hub.source();
        let command = format!(
            "{} --daemonize --state-directory {} --port {}",
            shell_quote(&agent_executable()?),
            shell_quote(&hub.config.agent_state_directory().to_string_lossy()),
            hub.config.agent_port()
        );

        let output = source
            .execute_on_all_hosts(&*hub.system, "start agent", |_| command.clone())
            .await?;
        for line in output.stdouts.values().filter(|s| !s.trim().is_empty()) {
            report(stream, line.trim_end())?;
        }
        MultiError::check(output.errors.into_values().map(Error::Remote).collect())?;

        let agents = hub.agents().await?;
        hub.agents
            .fan_out(for_hosts(&agents, |_| Some(())), |client, ()| {
                wire::ping_agent(client)
            })
            .await?;
        Ok(())
    }
    .boxed_local()
}

fn generate_target_config<'a>(
    hub: &'a Hub,
    _stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let source = hub.source();
        let coordinator_port = source
            .coordinator()
            .map(|c| c.port)
            .ok_or_else(|| Error::Configuration("the source cluster has no coordinator".into()))?;

        let mut catalog = hub
            .connect(ConnectOptions::normal(coordinator_port), "source")
            .await?;
        let settings = SourceSettings {
            checkpoint_segments: catalog.setting("checkpoint_segments").await?,
            encoding: catalog.setting("server_encoding").await?,
        };

        let current = hub.target();
        let mut planned = target::plan_target(&source, &current.bin_dir)?;
        planned.version = current.version;

        let contents = target::gpinitsystem_config(&source, &planned, &settings)?;
        let path = hub.state.gpinitsystem_config();
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .and_then(|mut file| file.write_all(contents.as_bytes()))
            .with_path(&path)?;

        hub.set_target(planned)
    }
    .boxed_local()
}

fn create_target_datadirs<'a>(
    hub: &'a Hub,
    _stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let target = hub.target();
        let coordinator_parent = target
            .coordinator()
            .and_then(|c| c.datadir.parent())
            .ok_or_else(|| Error::Internal("the target coordinator has no parent directory".into()))?;
        dirs::create_segment_data_directories(&*hub.system, &[coordinator_parent.to_path_buf()])?;

        let mut by_host = target::primary_parent_dirs(&target);
        let agents = hub.agents().await?;
        hub.agents
            .fan_out(for_hosts(&agents, |host| by_host.remove(host)), |client, dirs| async move {
                wire::create_segment_data_directories(client, &dirs).await
            })
            .await?;
        Ok(())
    }
    .boxed_local()
}

fn shutdown_source<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        lifecycle::stop_if_running(&*hub.system, stream, &hub.source(), "source").await?;
        Ok(())
    }
    .boxed_local()
}

fn init_target<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let planned = hub.target();
        let coordinator_port = planned
            .coordinator()
            .map(|c| c.port)
            .ok_or_else(|| Error::Internal("the target cluster has not been planned".into()))?;

        lifecycle::init_system(
            &*hub.system,
            stream,
            &planned.bin_dir,
            &hub.state.gpinitsystem_config(),
            planned.major_version(),
        )
        .await?;

        let mut catalog = hub
            .connect(ConnectOptions::normal(coordinator_port), "target")
            .await?;
        let initialized = catalog::from_database(&mut *catalog, &planned.bin_dir).await?;
        hub.set_target(initialized)
    }
    .boxed_local()
}

fn shutdown_target<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        lifecycle::stop_if_running(&*hub.system, stream, &hub.target(), "target").await?;
        Ok(())
    }
    .boxed_local()
}

/// Runs the coordinator and primary checks side by side and reports every failure.
fn upgrade_check<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let (coordinator, primaries) = futures::join!(
            upgrade_coordinator(hub, stream, true),
            upgrade_primaries(hub, true)
        );
        MultiError::check(
            [coordinator.err(), primaries.err()]
                .into_iter()
                .flatten()
                .collect(),
        )
    }
    .boxed_local()
}
