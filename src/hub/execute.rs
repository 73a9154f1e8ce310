// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The `Execute` steps: upgrade the coordinator, ship its catalog to the segment hosts, upgrade
//! the primaries, and bring the target up on the source ports.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use futures::future::{join_all, FutureExt, LocalBoxFuture};

use crate::{
    agent::upgrade::{self, DataDirPair, UpgradeMode, UpgradeRequest},
    cluster::{
        lifecycle::{self, Mode},
        Cluster, Segment,
    },
    error::{Error, MultiError, PathContext, Result, ResultExt},
    gpupgrade_capnp as wire,
    hub::{connections::for_hosts, reconfigure, Hub},
    state::StateDir,
    step::{Step, Substep},
    stream::MultiplexedStream,
    system::{CommandSpec, ExitPolicy},
};

pub const STEPS: &[Step<Hub>] = &[
    Step {
        substep: Substep::UpgradeCoordinator,
        run: upgrade_coordinator_step,
    },
    Step {
        substep: Substep::CopyCoordinatorDatadir,
        run: copy_coordinator_datadir,
    },
    Step {
        substep: Substep::UpgradePrimaries,
        run: upgrade_primaries_step,
    },
    Step {
        substep: Substep::ReconfigurePorts,
        run: reconfigure::reconfigure_ports,
    },
    Step {
        substep: Substep::StartTarget,
        run: start_target,
    },
];

fn pair(source: &Segment, target: &Segment) -> DataDirPair {
    DataDirPair {
        old_data_dir: source.datadir.clone(),
        new_data_dir: target.datadir.clone(),
        old_port: source.port,
        new_port: target.port,
        content: source.content,
        dbid: source.dbid,
    }
}

fn target_segment<'a>(target: &'a Cluster, content: i32) -> Result<&'a Segment> {
    target.segment(content).ok_or_else(|| {
        Error::Internal(format!(
            "content {content} exists in the source cluster but not in the target"
        ))
    })
}

/// Runs `pg_upgrade` in dispatcher mode on the local coordinator, streaming its output.
pub(crate) async fn upgrade_coordinator(
    hub: &Hub,
    stream: &MultiplexedStream,
    check_only: bool,
) -> Result<()> {
    let source = hub.source();
    let target = hub.target();
    let old = source
        .coordinator()
        .ok_or_else(|| Error::Configuration("the source cluster has not been configured".into()))?;
    let new = target_segment(&target, old.content)?;

    let work_dir = hub.state.coordinator_upgrade_dir();
    hub.system.mkdir_all(&work_dir, 0o700).with_path(&work_dir)?;

    let command = upgrade::pg_upgrade_command(
        &source.bin_dir,
        &target.bin_dir,
        &pair(old, new),
        UpgradeMode::Dispatcher,
        check_only,
        &work_dir,
    );
    stream
        .run_command(&*hub.system, &command, upgrade::exit_policy(check_only))
        .await
        .context(if check_only {
            "pg_upgrade check of the coordinator failed"
        } else {
            "pg_upgrade of the coordinator failed"
        })
}

/// Sends each agent the data directory pairs of the primaries on its host, all hosts at once.
pub(crate) async fn upgrade_primaries(hub: &Hub, check_only: bool) -> Result<()> {
    let source = hub.source();
    let target = hub.target();

    let mut by_host: BTreeMap<String, Vec<DataDirPair>> = BTreeMap::new();
    for old in source.primaries() {
        let new = target_segment(&target, old.content)?;
        by_host.entry(old.host.clone()).or_default().push(pair(old, new));
    }

    let agents = hub.agents().await?;
    let work = for_hosts(&agents, |host| {
        by_host.remove(host).map(|pairs| UpgradeRequest {
            source_bin_dir: source.bin_dir.clone(),
            target_bin_dir: target.bin_dir.clone(),
            pairs,
            check_only,
        })
    });

    hub.agents
        .fan_out(work, |client, request| async move {
            wire::upgrade_primaries(client, &request).await
        })
        .await?;
    Ok(())
}

fn upgrade_coordinator_step<'a>(
    hub: &'a Hub,
    stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    upgrade_coordinator(hub, stream, false).boxed_local()
}

fn upgrade_primaries_step<'a>(
    hub: &'a Hub,
    _stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    upgrade_primaries(hub, false).boxed_local()
}

fn rsync_command(coordinator_dir: &Path, host: &str, destination: &Path) -> CommandSpec {
    CommandSpec::new("rsync")
        .args(["--archive", "--compress", "--delete", "--stats"])
        .arg(format!("{}/", coordinator_dir.display()))
        .arg(format!("{host}:{}", destination.display()))
        .label("rsync")
}

fn copy_coordinator_datadir<'a>(
    hub: &'a Hub,
    stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let target = hub.target();
        let coordinator_dir = target
            .coordinator()
            .map(|c| c.datadir.clone())
            .ok_or_else(|| Error::Internal("the target cluster has not been initialized".into()))?;
        let destination = StateDir::new(hub.config.agent_state_directory()).coordinator_copy();

        let hosts = target.primary_hosts();
        let copies = hosts.iter().map(|host| {
            let command = rsync_command(&coordinator_dir, host, &destination);
            async move {
                stream
                    .run_command(&*hub.system, &command, ExitPolicy::Strict)
                    .await
                    .with_context(|| format!("could not copy the coordinator data directory to {host}"))
            }
        });
        MultiError::check(
            join_all(copies)
                .await
                .into_iter()
                .filter_map(Result::err)
                .collect(),
        )?;

        let agents = hub.agents().await?;
        let work = for_hosts(&agents, |host| {
            let dirs: Vec<PathBuf> = target
                .segments_on(host)
                .into_iter()
                .map(|s| s.datadir.clone())
                .collect();
            (!dirs.is_empty()).then_some(dirs)
        });

        let destination = &destination;
        hub.agents
            .fan_out(work, |client, dirs| async move {
                wire::copy_coordinator_data_directory(client, destination, &dirs).await
            })
            .await?;
        Ok(())
    }
    .boxed_local()
}

fn start_target<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        lifecycle::start(&*hub.system, stream, &hub.target(), "target", Mode::Cluster).await
    }
    .boxed_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsync_copies_directory_contents() {
        let cmd = rsync_command(
            Path::new("/data/qddir_upgrade/demoDataDir-1"),
            "sdw1",
            Path::new("/home/gpadmin/.gpupgrade/coordinator-copy"),
        );
        assert_eq!(cmd.get_label(), "rsync");
        assert_eq!(
            cmd.args_lossy(),
            vec![
                "--archive",
                "--compress",
                "--delete",
                "--stats",
                "/data/qddir_upgrade/demoDataDir-1/",
                "sdw1:/home/gpadmin/.gpupgrade/coordinator-copy",
            ]
        );
    }
}
