// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The streaming commands: `initialize`, `execute`, `finalize` and `revert`.
//!
//! Each passes a `MessageSink` to the hub and prints step transitions as they arrive. With
//! `--verbose`, the output of every command the hub runs is relayed as well.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    capnp::capability::Promise,
    capnp_rpc::pry,
    clap::Args,
    log::{debug, info},
};

use crate::{
    commands::{hub_client, services, Cli, Handle, HandledError, HandledResult, EXIT_STEP_FAILED},
    gpupgrade_capnp::{cli_to_hub, message_sink, ChunkType},
    state::Status,
    step::Substep,
};

#[derive(Args, Debug, Clone, Default)]
pub struct StreamArgs {
    /// Print the output of every command the hub runs.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct InitializeArgs {
    /// The bin directory of the cluster being upgraded.
    #[arg(long)]
    pub source_bindir: PathBuf,

    /// The bin directory of the new Greenplum installation.
    #[arg(long)]
    pub target_bindir: PathBuf,

    /// The port of the running source coordinator.
    #[arg(long)]
    pub source_master_port: u16,

    #[command(flatten)]
    pub stream: StreamArgs,
}

/// Prints what the hub streams back.
pub struct Reporter {
    verbose: bool,
}

impl Reporter {
    pub fn new(verbose: bool) -> Self {
        Reporter { verbose }
    }
}

/// The line printed for a step transition.
pub fn status_line(step: Option<Substep>, code: u16, status: Status) -> String {
    let description = match step {
        Some(step) => step.description().to_string(),
        None => format!("Unknown step {code}..."),
    };
    format!("{description:<60}[{status}]")
}

impl message_sink::Server for Reporter {
    fn chunk(
        &mut self,
        params: message_sink::ChunkParams,
        _: message_sink::ChunkResults,
    ) -> Promise<(), capnp::Error> {
        if !self.verbose {
            return Promise::ok(());
        }

        let params = pry!(params.get());
        let buffer = pry!(params.get_buffer());
        let written = match pry!(params.get_kind()) {
            ChunkType::Stdout => std::io::stdout().write_all(buffer),
            ChunkType::Stderr => std::io::stderr().write_all(buffer),
        };
        if let Err(e) = written {
            debug!("could not relay output: {e}");
        }
        Promise::ok(())
    }

    fn status(
        &mut self,
        params: message_sink::StatusParams,
        _: message_sink::StatusResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let code = params.get_step();
        let status: Status = pry!(params.get_status()).into();

        println!("{}", status_line(Substep::from_code(code), code, status));
        Promise::ok(())
    }
}

fn sink(args: &StreamArgs) -> message_sink::Client {
    capnp_rpc::new_client(Reporter::new(args.verbose))
}

/// Turns the outcome of a streaming call into the CLI's exit status.
fn finish<T>(command: &str, result: Result<T, capnp::Error>, next: &str) -> HandledResult<()> {
    match result {
        Ok(_) => {
            println!();
            println!("{command} completed successfully.");
            if !next.is_empty() {
                println!();
                println!("{next}");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("Error: {command} failed: {e}");
            eprintln!("Fix the problem above and re-run \"gpupgrade {}\".", command.to_lowercase());
            Err(HandledError::new(EXIT_STEP_FAILED))
        }
    }
}

const HUB_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

async fn hub_answers(cli: &Cli) -> bool {
    let Ok(connection) =
        crate::gpupgrade_capnp::connect::<cli_to_hub::Client>(&cli.hub_address()).await
    else {
        return false;
    };
    let answered = tokio::time::timeout(
        HUB_STARTUP_TIMEOUT,
        connection.client.ping_request().send().promise,
    )
    .await;
    connection.task.abort();
    matches!(answered, Ok(Ok(_)))
}

/// `gpupgrade_hub` from the same directory as this executable.
fn hub_binary() -> std::io::Result<PathBuf> {
    Ok(std::env::current_exe()?.with_file_name("gpupgrade_hub"))
}

async fn ensure_hub(cli: &Cli) -> HandledResult<()> {
    if hub_answers(cli).await {
        return Ok(());
    }

    let hub = hub_binary().handle_err(|e| eprintln!("Could not locate gpupgrade_hub: {e}"))?;
    info!("starting {}", hub.display());
    start_daemon(&hub, cli.hub_port).await
}

async fn start_daemon(hub: &Path, port: Option<u16>) -> HandledResult<()> {
    let mut command = tokio::process::Command::new(hub);
    command.arg("--daemonize");
    if let Some(port) = port {
        command.arg("--port").arg(port.to_string());
    }

    let status = command
        .status()
        .await
        .handle_err(|e| eprintln!("Could not start {}: {e}", hub.display()))?;
    if !status.success() {
        eprintln!("The hub did not start ({status})");
        return Err(HandledError::new(super::EXIT_USAGE));
    }
    Ok(())
}

pub async fn initialize(cli: &Cli, args: &InitializeArgs) -> HandledResult<()> {
    ensure_hub(cli).await?;
    let client = hub_client(cli).await?;

    let mut request = client.initialize_request();
    {
        let mut params = request.get();
        params.set_source_bin_dir(&*args.source_bindir.to_string_lossy());
        params.set_target_bin_dir(&*args.target_bindir.to_string_lossy());
        params.set_source_port(args.source_master_port);
        params.set_sink(sink(&args.stream));
    }

    let result = request.send().promise.await;
    finish(
        "Initialize",
        result,
        "NEXT ACTIONS\nTo proceed with the upgrade, run \"gpupgrade execute\".\n\
         To return the cluster to its original state, run \"gpupgrade revert\".",
    )
}

pub async fn execute(cli: &Cli, args: &StreamArgs) -> HandledResult<()> {
    let client = hub_client(cli).await?;

    let mut request = client.execute_request();
    request.get().set_sink(sink(args));

    let result = request.send().promise.await;
    finish(
        "Execute",
        result,
        "NEXT ACTIONS\nTo complete the upgrade, run \"gpupgrade finalize\".\n\
         To return the cluster to its original state, run \"gpupgrade revert\".",
    )
}

pub async fn finalize(cli: &Cli, args: &StreamArgs) -> HandledResult<()> {
    let client = hub_client(cli).await?;

    let mut request = client.finalize_request();
    request.get().set_sink(sink(args));

    let result = request.send().promise.await;
    finish("Finalize", result, "")?;

    // The hub has nothing left to do once its agents are gone.
    services::stop_hub(&client).await
}

pub async fn revert(cli: &Cli, args: &StreamArgs) -> HandledResult<()> {
    let client = hub_client(cli).await?;

    let mut request = client.revert_to_source_request();
    request.get().set_sink(sink(args));

    let result = request.send().promise.await;
    finish("Revert", result, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_align() {
        assert_eq!(
            status_line(Some(Substep::StartAgents), 2, Status::Complete),
            format!("{:<60}[COMPLETE]", "Starting gpupgrade agent processes...")
        );
        assert!(status_line(None, 99, Status::Failed).starts_with("Unknown step 99..."));
    }

    #[test]
    fn failed_runs_exit_with_the_step_status() {
        let failed: Result<(), capnp::Error> =
            Err(capnp::Error::failed("substep \"start-agents\": boom".into()));
        assert_eq!(
            finish("Initialize", failed, ""),
            Err(HandledError::new(EXIT_STEP_FAILED))
        );
        assert_eq!(finish("Revert", Ok(()), ""), Ok(()));
    }
}
