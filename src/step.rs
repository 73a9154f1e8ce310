// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! step.rs
//!
//! The step registry and the engine that runs a sequence of steps, recording each one's status
//! on disk and reporting it to the client.

use std::fmt;

use {
    futures::future::LocalBoxFuture,
    log::{error, info},
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::{Error, Result},
    state::{StateDir, Status, StepState},
    stream::MultiplexedStream,
};

/// Every unit of work the hub knows how to run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Substep {
    Config,
    StartAgents,
    GenerateTargetConfig,
    CreateTargetDatadirs,
    ShutdownSource,
    InitTarget,
    ShutdownTarget,
    UpgradeCheck,
    UpgradeCoordinator,
    CopyCoordinatorDatadir,
    UpgradePrimaries,
    ReconfigurePorts,
    StartTarget,
    ValidateTargetPorts,
    StopAgents,
    StopTargetForRevert,
    DeleteTargetDatadirs,
    StartSource,
}

impl Substep {
    pub const ALL: [Substep; 18] = [
        Substep::Config,
        Substep::StartAgents,
        Substep::GenerateTargetConfig,
        Substep::CreateTargetDatadirs,
        Substep::ShutdownSource,
        Substep::InitTarget,
        Substep::ShutdownTarget,
        Substep::UpgradeCheck,
        Substep::UpgradeCoordinator,
        Substep::CopyCoordinatorDatadir,
        Substep::UpgradePrimaries,
        Substep::ReconfigurePorts,
        Substep::StartTarget,
        Substep::ValidateTargetPorts,
        Substep::StopAgents,
        Substep::StopTargetForRevert,
        Substep::DeleteTargetDatadirs,
        Substep::StartSource,
    ];

    /// The stable short name, used as the step's state directory name.
    pub fn name(self) -> &'static str {
        match self {
            Substep::Config => "config",
            Substep::StartAgents => "start-agents",
            Substep::GenerateTargetConfig => "generate-target-config",
            Substep::CreateTargetDatadirs => "create-target-datadirs",
            Substep::ShutdownSource => "shutdown-source",
            Substep::InitTarget => "init-target",
            Substep::ShutdownTarget => "shutdown-target",
            Substep::UpgradeCheck => "upgrade-check",
            Substep::UpgradeCoordinator => "upgrade-coordinator",
            Substep::CopyCoordinatorDatadir => "copy-coordinator-datadir",
            Substep::UpgradePrimaries => "upgrade-primaries",
            Substep::ReconfigurePorts => "reconfigure-ports",
            Substep::StartTarget => "start-target",
            Substep::ValidateTargetPorts => "validate-target-ports",
            Substep::StopAgents => "stop-agents",
            Substep::StopTargetForRevert => "stop-target-for-revert",
            Substep::DeleteTargetDatadirs => "delete-target-datadirs",
            Substep::StartSource => "start-source",
        }
    }

    /// The numeric code used on the wire. Zero is reserved for "unknown".
    pub fn code(self) -> u16 {
        match self {
            Substep::Config => 1,
            Substep::StartAgents => 2,
            Substep::GenerateTargetConfig => 3,
            Substep::CreateTargetDatadirs => 4,
            Substep::ShutdownSource => 5,
            Substep::InitTarget => 6,
            Substep::ShutdownTarget => 7,
            Substep::UpgradeCheck => 8,
            Substep::UpgradeCoordinator => 9,
            Substep::CopyCoordinatorDatadir => 10,
            Substep::UpgradePrimaries => 11,
            Substep::ReconfigurePorts => 12,
            Substep::StartTarget => 13,
            Substep::ValidateTargetPorts => 14,
            Substep::StopAgents => 15,
            Substep::StopTargetForRevert => 16,
            Substep::DeleteTargetDatadirs => 17,
            Substep::StartSource => 18,
        }
    }

    pub fn from_code(code: u16) -> Option<Substep> {
        Substep::ALL.into_iter().find(|s| s.code() == code)
    }

    /// What the CLI prints while the step runs.
    pub fn description(self) -> &'static str {
        match self {
            Substep::Config => "Saving source cluster configuration...",
            Substep::StartAgents => "Starting gpupgrade agent processes...",
            Substep::GenerateTargetConfig => "Generating target cluster configuration...",
            Substep::CreateTargetDatadirs => "Creating target cluster data directories...",
            Substep::ShutdownSource => "Stopping source cluster...",
            Substep::InitTarget => "Creating target cluster...",
            Substep::ShutdownTarget => "Stopping target cluster...",
            Substep::UpgradeCheck => "Running pg_upgrade checks...",
            Substep::UpgradeCoordinator => "Upgrading coordinator...",
            Substep::CopyCoordinatorDatadir => "Copying coordinator catalog to primary segments...",
            Substep::UpgradePrimaries => "Upgrading primary segments...",
            Substep::ReconfigurePorts => "Updating target cluster ports...",
            Substep::StartTarget => "Starting target cluster...",
            Substep::ValidateTargetPorts => "Validating target cluster ports...",
            Substep::StopAgents => "Stopping agents...",
            Substep::StopTargetForRevert => "Stopping target cluster...",
            Substep::DeleteTargetDatadirs => "Deleting target cluster data directories...",
            Substep::StartSource => "Starting source cluster...",
        }
    }
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A step's executor. `C` is whatever owns the state the step needs (the hub).
pub type Executor<C> = for<'a> fn(&'a C, &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>>;

/// One entry of a step sequence.
pub struct Step<C> {
    pub substep: Substep,
    pub run: Executor<C>,
}

/// Status bookkeeping for one running step.
///
/// Creating the handle resets the step's state directory and marks it running; `finish` records
/// the outcome. Both transitions are reported on the stream.
pub struct ScopedStep<'a> {
    substep: Substep,
    state: StepState,
    stream: &'a MultiplexedStream,
}

impl<'a> ScopedStep<'a> {
    pub fn begin(
        state_dir: &StateDir,
        substep: Substep,
        stream: &'a MultiplexedStream,
    ) -> Result<Self> {
        let state = state_dir.step(substep.name());
        state.reset_state_dir()?;
        state.mark_in_progress()?;

        info!("starting substep {substep}");
        stream.send_status(substep, Status::Running);

        Ok(ScopedStep {
            substep,
            state,
            stream,
        })
    }

    /// Records the outcome of the step. A step whose completion cannot be recorded is failed.
    pub fn finish(self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            return self.fail(e);
        }

        if let Err(e) = self.state.mark_complete() {
            error!("could not record completion of {}: {e}", self.substep);
            return self.fail(e);
        }
        info!("substep {} completed", self.substep);
        self.stream.send_status(self.substep, Status::Complete);
        Ok(())
    }

    fn fail(self, e: Error) -> Result<()> {
        error!("substep {} failed: {e}", self.substep);
        if let Err(mark) = self.state.mark_failed() {
            error!("could not record failure of {}: {mark}", self.substep);
        }
        self.stream.send_status(self.substep, Status::Failed);
        Err(Error::Step {
            step: self.substep.name(),
            source: Box::new(e),
        })
    }
}

/// Runs `steps` in order, stopping at the first failure.
///
/// `cancel` is checked before each step starts; a step that is already running is always allowed
/// to finish so that its status is recorded.
pub async fn run_steps<C>(
    ctx: &C,
    state_dir: &StateDir,
    stream: &MultiplexedStream,
    steps: &[Step<C>],
    cancel: &CancellationToken,
) -> Result<()> {
    for step in steps {
        if cancel.is_cancelled() {
            info!("request cancelled, not starting {}", step.substep);
            return Err(Error::Cancelled(step.substep.name()));
        }

        let handle = ScopedStep::begin(state_dir, step.substep, stream)?;
        let result = (step.run)(ctx, stream).await;
        handle.finish(result)?;
    }
    Ok(())
}
