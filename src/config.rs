// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The hub's configuration file. Every field is optional; anything missing falls back to the
/// environment defaults in the crate root.
///
/// Command-line flags take precedence over the file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    pub port: Option<u16>,
    pub agent_port: Option<u16>,
    pub state_directory: Option<PathBuf>,
    /// The state directory the agents are started with.
    pub agent_state_directory: Option<PathBuf>,
    pub dial_timeout_ms: Option<u64>,
    /// Deadline for a single call to an agent. No deadline when unset.
    pub agent_timeout_secs: Option<u64>,
}

pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 3000;

impl HubConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(crate::hub_port)
    }

    pub fn agent_port(&self) -> u16 {
        self.agent_port.unwrap_or_else(crate::agent_port)
    }

    pub fn state_directory(&self) -> PathBuf {
        self.state_directory
            .clone()
            .unwrap_or_else(crate::default_state_directory)
    }

    pub fn agent_state_directory(&self) -> PathBuf {
        self.agent_state_directory
            .clone()
            .unwrap_or_else(|| self.state_directory())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms.unwrap_or(DEFAULT_DIAL_TIMEOUT_MS))
    }

    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub port: Option<u16>,
    pub state_directory: Option<PathBuf>,
}

impl AgentConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(crate::agent_port)
    }

    pub fn state_directory(&self) -> PathBuf {
        self.state_directory
            .clone()
            .unwrap_or_else(crate::default_state_directory)
    }
}

/// Reads a TOML configuration file. No path means the built-in defaults.
pub fn load<T: Default + for<'de> Deserialize<'de>>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };

    let contents = fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!(
            "could not read config file {}: {e}",
            path.display()
        ))
    })?;

    toml::from_str(&contents).map_err(|e| {
        Error::Configuration(format!("invalid config file {}: {e}", path.display()))
    })
}
