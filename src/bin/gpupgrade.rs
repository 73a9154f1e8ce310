// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use gpupgrade_lib::commands::{self, Cli};

/// The gpupgrade binary is the operator's interface: it sends each command to the hub and
/// reports the result.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("GPUPGRADE_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if let Err(e) = commands::main(&args) {
        std::process::exit(e.code());
    }
}
