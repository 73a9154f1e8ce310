// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fs, os::unix::fs::OpenOptionsExt, path::Path, path::PathBuf};

pub mod agent;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gpupgrade_capnp;
pub mod hub;
pub mod state;
pub mod step;
pub mod stream;
pub mod system;
pub mod test_env;
pub mod version;

/// Gets the port that the hub should be listening on.
pub fn hub_port() -> u16 {
    port_from_env("GPUPGRADE_HUB_PORT", 7527)
}

/// Gets the port that the agents should be listening on.
pub fn agent_port() -> u16 {
    port_from_env("GPUPGRADE_AGENT_PORT", 6416)
}

fn port_from_env(var: &str, default: u16) -> u16 {
    match std::env::var(var) {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("{var} is not a valid port number, using {default}");
            default
        }),
        Err(_) => default,
    }
}

/// `$GPUPGRADE_HOME`, or `$HOME/.gpupgrade`.
pub fn default_state_directory() -> PathBuf {
    match std::env::var_os("GPUPGRADE_HOME") {
        Some(home) => PathBuf::from(home),
        None => {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".gpupgrade")
        }
    }
}

/// Sets up `env_logger` from `GPUPGRADE_LOG`, writing to `log_file` (appending) when given and to
/// stderr otherwise.
pub fn init_logging(default_level: &str, log_file: Option<&Path>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().filter_or("GPUPGRADE_LOG", default_level));

    if let Some(path) = log_file {
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("could not open log file {}: {e}", path.display()),
        }
    }

    // A second initialization (tests, or a hub started in-process) keeps the first logger.
    let _ = builder.try_init();
}
