// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod check;
pub mod config;
pub mod services;
pub mod status;
pub mod upgrade;

use std::{future::Future, path::PathBuf};

use {
    clap::{Args, Parser, Subcommand},
    log::debug,
};

use crate::gpupgrade_capnp::{self as wire, cli_to_hub};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must exit with the status carried by the `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally carries nothing but the exit status; the process of handling the
/// error "consumes" the rest, and it is no longer needed as the error was already appropriately
/// handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {
    code: i32,
}

/// Exit status for user errors such as bad flags or an unreachable hub.
pub const EXIT_USAGE: i32 = 1;

/// Exit status for a failed upgrade step.
pub const EXIT_STEP_FAILED: i32 = 2;

impl HandledError {
    pub fn new(code: i32) -> Self {
        HandledError { code }
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    Err(HandledError::new(EXIT_USAGE))
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError::new(EXIT_USAGE)
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Upgrade a Greenplum cluster in place", long_about = None)]
pub struct Cli {
    /// Port the hub listens on (defaults to $GPUPGRADE_HUB_PORT or 7527).
    #[arg(long, global = true)]
    pub hub_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the target cluster and run the pg_upgrade checks.
    Initialize(upgrade::InitializeArgs),
    /// Upgrade the coordinator and primaries and move the target onto the source ports.
    Execute(upgrade::StreamArgs),
    /// Verify the upgraded cluster and stop the agents.
    Finalize(upgrade::StreamArgs),
    /// Remove the target cluster and restart the source cluster.
    Revert(upgrade::StreamArgs),
    #[command(subcommand)]
    Config(config::ConfigCommand),
    #[command(subcommand)]
    Status(status::StatusCommand),
    #[command(subcommand)]
    Check(check::CheckCommand),
    /// Stop the agents and the hub.
    KillServices,
}

/// Flags shared by `config set` and `config show`.
#[derive(Args, Debug, Clone, Default)]
pub struct BinDirArgs {
    #[arg(long)]
    pub source_bindir: Option<PathBuf>,

    #[arg(long)]
    pub target_bindir: Option<PathBuf>,
}

impl Cli {
    pub fn hub_address(&self) -> String {
        format!("localhost:{}", self.hub_port.unwrap_or_else(crate::hub_port))
    }
}

/// Runs `f` to completion on a single-threaded runtime, the way the hub and agent run.
pub fn block_on<F: Future<Output = HandledResult<()>>>(f: F) -> HandledResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(tokio::task::LocalSet::new().run_until(f))
}

/// Connects to the hub. Must be called from within a `LocalSet`.
pub async fn hub_client(cli: &Cli) -> HandledResult<cli_to_hub::Client> {
    let address = cli.hub_address();
    debug!("connecting to hub at {address}");

    let connection = wire::connect::<cli_to_hub::Client>(&address)
        .await
        .handle_err(|e| {
            eprintln!("Could not connect to the hub at {address}: {e}");
            eprintln!("Is the hub running? Try \"gpupgrade initialize\".");
        })?;
    Ok(connection.client)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    block_on(async {
        match &cli.command {
            Commands::Initialize(args) => upgrade::initialize(cli, args).await,
            Commands::Execute(args) => upgrade::execute(cli, args).await,
            Commands::Finalize(args) => upgrade::finalize(cli, args).await,
            Commands::Revert(args) => upgrade::revert(cli, args).await,
            Commands::Config(command) => config::config(cli, command).await,
            Commands::Status(command) => status::status(cli, command).await,
            Commands::Check(command) => check::check(cli, command).await,
            Commands::KillServices => services::kill_services(cli).await,
        }
    })
}
