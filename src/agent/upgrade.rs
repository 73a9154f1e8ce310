// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Running `pg_upgrade` for every primary on this host.

use std::{
    fs,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    error::{Error, MultiError, PathContext, Result},
    state::{StateDir, StepState},
    stream::Capture,
    system::{CommandSpec, ExitPolicy, System},
};

/// The only variable a `pg_upgrade` child inherits. Everything else (`PGHOST`, `PGPORT`, ...)
/// would leak into the connections it makes to the old and new clusters.
pub const PRESERVED_ENV: [&str; 1] = ["LD_LIBRARY_PATH"];

/// One segment's source and target data directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirPair {
    pub old_data_dir: PathBuf,
    pub new_data_dir: PathBuf,
    pub old_port: u16,
    pub new_port: u16,
    pub content: i32,
    pub dbid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub source_bin_dir: PathBuf,
    pub target_bin_dir: PathBuf,
    pub pairs: Vec<DataDirPair>,
    pub check_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMode {
    /// The coordinator, upgraded first.
    Dispatcher,
    /// A primary, upgraded from a copy of the upgraded coordinator's catalog.
    Segment,
}

/// Builds the `pg_upgrade` invocation for one data directory pair.
pub fn pg_upgrade_command(
    source_bin_dir: &Path,
    target_bin_dir: &Path,
    pair: &DataDirPair,
    mode: UpgradeMode,
    check_only: bool,
    work_dir: &Path,
) -> CommandSpec {
    let mut cmd = CommandSpec::new(target_bin_dir.join("pg_upgrade"))
        .arg("--old-bindir")
        .arg(source_bin_dir)
        .arg("--old-datadir")
        .arg(&pair.old_data_dir)
        .arg("--old-port")
        .arg(pair.old_port.to_string())
        .arg("--new-bindir")
        .arg(target_bin_dir)
        .arg("--new-datadir")
        .arg(&pair.new_data_dir)
        .arg("--new-port")
        .arg(pair.new_port.to_string());

    cmd = match mode {
        UpgradeMode::Dispatcher => cmd.arg("--mode=dispatcher"),
        UpgradeMode::Segment => cmd
            .arg("--old-gp-dbid")
            .arg(pair.dbid.to_string())
            .arg("--new-gp-dbid")
            .arg(pair.dbid.to_string())
            .arg("--mode=segment"),
    };

    if check_only {
        cmd = cmd.arg("--check");
    }

    cmd.env_clear_except(&PRESERVED_ENV)
        .current_dir(work_dir)
        .label("pg_upgrade")
}

/// `pg_upgrade --check` exiting with 1 reports warnings, which do not block the upgrade.
pub fn exit_policy(check_only: bool) -> ExitPolicy {
    if check_only {
        ExitPolicy::WarnOnOne
    } else {
        ExitPolicy::Strict
    }
}

/// Upgrades (or checks) every pair in parallel and waits for all of them.
///
/// Each segment's progress is recorded under `<state>/pg_upgrade/seg-<content>`, along with the
/// captured output of its `pg_upgrade` run. Every failing segment contributes one error naming
/// `host` and its content id.
pub async fn upgrade_primaries(
    system: &dyn System,
    state: &StateDir,
    host: &str,
    request: &UpgradeRequest,
) -> Result<()> {
    let action = if request.check_only { "check" } else { "upgrade" };
    info!("starting {action} of {} primaries", request.pairs.len());

    let results = futures::future::join_all(
        request
            .pairs
            .iter()
            .map(|pair| upgrade_segment(system, state, request, pair)),
    )
    .await;

    let errors: Vec<Error> = request
        .pairs
        .iter()
        .zip(results)
        .filter_map(|(pair, result)| {
            result.err().map(|e| Error::Segment {
                action,
                host: host.to_string(),
                content: pair.content,
                source: Box::new(e),
            })
        })
        .collect();

    for e in &errors {
        warn!("{e}");
    }
    MultiError::check(errors)
}

async fn upgrade_segment(
    system: &dyn System,
    state: &StateDir,
    request: &UpgradeRequest,
    pair: &DataDirPair,
) -> Result<()> {
    let record = segment_record(state, pair.content);
    let work_dir = record.path().to_path_buf();
    system
        .mkdir_all(&work_dir, 0o700)
        .with_path(&work_dir)?;

    // Checks leave the conversion status alone.
    if !request.check_only {
        record.mark_in_progress()?;
    }

    let result = run_pg_upgrade(system, request, pair, &work_dir).await;

    if !request.check_only {
        match &result {
            Ok(()) => record.mark_complete()?,
            Err(_) => record.mark_failed()?,
        }
    }
    result
}

async fn run_pg_upgrade(
    system: &dyn System,
    request: &UpgradeRequest,
    pair: &DataDirPair,
    work_dir: &Path,
) -> Result<()> {
    let prefix = if request.check_only { "check" } else { "upgrade" };
    let mut stdout = open_capture(&work_dir.join(format!("{prefix}.stdout")))?;
    let mut stderr = Capture::new(open_capture(&work_dir.join(format!("{prefix}.stderr")))?);

    let cmd = pg_upgrade_command(
        &request.source_bin_dir,
        &request.target_bin_dir,
        pair,
        UpgradeMode::Segment,
        request.check_only,
        &pair.new_data_dir,
    );

    info!("running {cmd}");
    let status = system
        .run(&cmd, &mut stdout, &mut stderr)
        .await
        .map_err(|source| Error::Spawn {
            command: cmd.get_label().to_string(),
            source,
        })?;

    exit_policy(request.check_only).check(&cmd, status, &stderr.tail)
}

fn open_capture(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_path(path)
}

/// The record of one segment's upgrade on this host.
pub fn segment_record(state: &StateDir, content: i32) -> StepState {
    StepState::new(state.segment_upgrade_dir(content))
}
