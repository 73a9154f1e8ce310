// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use gpupgrade_lib::agent::{self, Cli};

fn main() {
    let args = Cli::parse();

    if let Err(e) = agent::agent_main(args) {
        std::process::exit(e.code());
    }
}
