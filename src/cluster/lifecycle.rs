// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! lifecycle.rs
//!
//! Starting, stopping, and creating clusters with the Greenplum management utilities
//! (`gpstart`, `gpstop`, `gpinitsystem`). Each utility runs through bash after sourcing
//! `greenplum_path.sh` from the cluster's installation, with output attached to a step's stream.

use std::{io::ErrorKind, path::Path};

use log::info;

use crate::{
    cluster::Cluster,
    error::{Error, PathContext, Result, ResultExt},
    stream::MultiplexedStream,
    system::{CommandSpec, ExitPolicy, System},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The whole cluster.
    Cluster,
    /// Only the coordinator, in utility mode.
    CoordinatorOnly,
}

/// Quotes `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Builds the command for a Greenplum utility from `bin_dir`.
pub fn greenplum_command(bin_dir: &Path, utility: &str, args: &[&str]) -> CommandSpec {
    let mut script = format!(
        "source {} && {}",
        shell_quote(&bin_dir.join("../greenplum_path.sh").to_string_lossy()),
        shell_quote(&bin_dir.join(utility).to_string_lossy())
    );
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }

    CommandSpec::new("bash").args(["-c", &script]).label(utility)
}

fn coordinator_datadir<'a>(cluster: &'a Cluster, which: &str) -> Result<&'a Path> {
    cluster
        .coordinator()
        .map(|c| c.datadir.as_path())
        .ok_or_else(|| Error::Configuration(format!("the {which} cluster has not been configured")))
}

/// Whether the coordinator's postmaster is alive, judged by its `postmaster.pid`.
pub fn postmaster_running(system: &dyn System, cluster: &Cluster, which: &str) -> Result<bool> {
    let pidfile = coordinator_datadir(cluster, which)?.join("postmaster.pid");
    postmaster_pid_alive(system, &pidfile)
}

fn postmaster_pid_alive(system: &dyn System, pidfile: &Path) -> Result<bool> {
    let contents = match system.read_to_string(pidfile) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_path(pidfile),
    };

    let Some(pid) = contents
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<i32>().ok())
    else {
        return Ok(false);
    };

    system.process_exists(pid).with_path(pidfile)
}

pub async fn start(
    system: &dyn System,
    stream: &MultiplexedStream,
    cluster: &Cluster,
    which: &str,
    mode: Mode,
) -> Result<()> {
    let datadir = coordinator_datadir(cluster, which)?.to_string_lossy().into_owned();
    let mut args = vec!["-a", "-d", datadir.as_str()];
    if mode == Mode::CoordinatorOnly {
        args.insert(0, "-m");
    }

    info!("starting {which} {}", describe(mode));
    stream
        .run_command(
            system,
            &greenplum_command(&cluster.bin_dir, "gpstart", &args),
            ExitPolicy::Strict,
        )
        .await
        .with_context(|| format!("failed to start {which} {}", describe(mode)))
}

pub async fn stop(
    system: &dyn System,
    stream: &MultiplexedStream,
    cluster: &Cluster,
    which: &str,
    mode: Mode,
) -> Result<()> {
    let datadir = coordinator_datadir(cluster, which)?.to_string_lossy().into_owned();
    let mut args = vec!["-a", "-d", datadir.as_str()];
    if mode == Mode::CoordinatorOnly {
        args.insert(0, "-m");
    }

    info!("stopping {which} {}", describe(mode));
    stream
        .run_command(
            system,
            &greenplum_command(&cluster.bin_dir, "gpstop", &args),
            ExitPolicy::Strict,
        )
        .await
        .with_context(|| format!("failed to stop {which} {}", describe(mode)))
}

/// Stops the cluster unless its coordinator is already down. Returns whether it was running.
pub async fn stop_if_running(
    system: &dyn System,
    stream: &MultiplexedStream,
    cluster: &Cluster,
    which: &str,
) -> Result<bool> {
    if !postmaster_running(system, cluster, which)? {
        info!("{which} cluster is not running");
        return Ok(false);
    }
    stop(system, stream, cluster, which, Mode::Cluster).await?;
    Ok(true)
}

/// Runs `gpinitsystem` with the generated configuration.
///
/// `--ignore-warnings` is only understood by releases before 7. Exit status 1 means the cluster
/// was created with warnings and is not an error.
pub async fn init_system(
    system: &dyn System,
    stream: &MultiplexedStream,
    bin_dir: &Path,
    config: &Path,
    target_major: Option<u32>,
) -> Result<()> {
    let config = config.to_string_lossy().into_owned();
    let mut args = vec!["-a", "-I", config.as_str()];
    if target_major.is_some_and(|major| major < 7) {
        args.push("--ignore-warnings");
    }

    stream
        .run_command(
            system,
            &greenplum_command(bin_dir, "gpinitsystem", &args),
            ExitPolicy::WarnOnOne,
        )
        .await
        .context("failed to initialize the target cluster")
}

fn describe(mode: Mode) -> &'static str {
    match mode {
        Mode::Cluster => "cluster",
        Mode::CoordinatorOnly => "coordinator",
    }
}
