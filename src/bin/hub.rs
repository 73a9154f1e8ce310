// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use gpupgrade_lib::hub::{self, Cli};

/// The gpupgrade_hub binary runs the upgrade steps on the coordinator host.
fn main() {
    let args = Cli::parse();

    if let Err(e) = hub::hub_main(args) {
        std::process::exit(e.code());
    }
}
