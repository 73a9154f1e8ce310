// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The `RevertToSource` steps. The source data directories are never modified, so reverting is
//! a matter of removing the target and bringing the source back up.

use std::{path::PathBuf, rc::Rc};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::info,
};

use crate::{
    cluster::{
        lifecycle::{self, Mode},
        Cluster,
    },
    error::{PathContext, Result},
    gpupgrade_capnp as wire,
    hub::{connections::for_hosts, target, Hub},
    step::{Step, Substep},
    stream::MultiplexedStream,
};

pub const STEPS: &[Step<Hub>] = &[
    Step {
        substep: Substep::StopTargetForRevert,
        run: stop_target,
    },
    Step {
        substep: Substep::DeleteTargetDatadirs,
        run: delete_target_datadirs,
    },
    Step {
        substep: Substep::StartSource,
        run: start_source,
    },
];

fn stop_target<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let target = hub.target();
        if target.is_empty() {
            info!("the target cluster was never created");
            return Ok(());
        }
        lifecycle::stop_if_running(&*hub.system, stream, &target, "target").await?;
        Ok(())
    }
    .boxed_local()
}

/// The target layout to remove: the recorded one, or the planned one when initialization did not
/// get far enough to record it.
fn target_layout(hub: &Hub) -> Result<Rc<Cluster>> {
    let target = hub.target();
    if !target.is_empty() {
        return Ok(target);
    }
    Ok(Rc::new(target::plan_target(&hub.source(), &target.bin_dir)?))
}

fn delete_target_datadirs<'a>(
    hub: &'a Hub,
    _stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let target = target_layout(hub)?;

        if let Some(coordinator) = target.coordinator() {
            info!("deleting {}", coordinator.datadir.display());
            hub.system
                .remove_all(&coordinator.datadir)
                .with_path(&coordinator.datadir)?;
        }

        let agents = hub.agents().await?;
        let work = for_hosts(&agents, |host| {
            let dirs: Vec<PathBuf> = target
                .segments_on(host)
                .into_iter()
                .map(|s| s.datadir.clone())
                .collect();
            (!dirs.is_empty()).then_some(dirs)
        });
        hub.agents
            .fan_out(work, |client, dirs| async move {
                wire::delete_data_directories(client, &dirs).await
            })
            .await?;

        let current = hub.target();
        hub.set_target(Cluster {
            segments: Vec::new(),
            bin_dir: current.bin_dir.clone(),
            version: current.version,
        })
    }
    .boxed_local()
}

fn start_source<'a>(hub: &'a Hub, stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let source = hub.source();
        if lifecycle::postmaster_running(&*hub.system, &source, "source")? {
            info!("source cluster is already running");
            return Ok(());
        }
        lifecycle::start(&*hub.system, stream, &source, "source", Mode::Cluster).await
    }
    .boxed_local()
}
