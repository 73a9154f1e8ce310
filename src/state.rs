// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! state.rs
//!
//! Durable step status. Every step owns a directory under the state root, and its status is
//! whichever sentinel file is present there. Nothing about a step's status is kept in memory, so
//! a restarted hub reports exactly what the previous one recorded.

use std::{
    fmt, fs,
    io::{self, ErrorKind},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use log::{error, warn};

use crate::error::{PathContext, Result};

pub const IN_PROGRESS: &str = "in.progress";
pub const COMPLETED: &str = "completed";
pub const FAILED: &str = "failed";

const SENTINELS: [&str; 3] = [IN_PROGRESS, COMPLETED, FAILED];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Pending,
    Running,
    Complete,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Status::Unknown => "UNKNOWN",
                Status::Pending => "PENDING",
                Status::Running => "RUNNING",
                Status::Complete => "COMPLETE",
                Status::Failed => "FAILED",
            }
        )
    }
}

/// The on-disk status record of a single step (or, on an agent, of a single segment upgrade).
#[derive(Debug, Clone)]
pub struct StepState {
    dir: PathBuf,
}

impl StepState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StepState { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> Status {
        let present: Vec<&str> = SENTINELS
            .iter()
            .copied()
            .filter(|name| self.dir.join(name).exists())
            .collect();

        match present.as_slice() {
            [] => Status::Pending,
            [IN_PROGRESS] => Status::Running,
            [COMPLETED] => Status::Complete,
            [FAILED] => Status::Failed,
            _ => {
                error!(
                    "corrupt step state in {}: found {:?}, treating as pending",
                    self.dir.display(),
                    present
                );
                Status::Pending
            }
        }
    }

    /// Removes the step directory and everything in it, then recreates it empty.
    pub fn reset_state_dir(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_path(&self.dir),
        }
        self.create_dir()
    }

    pub fn mark_in_progress(&self) -> Result<()> {
        self.transition(IN_PROGRESS)
    }

    pub fn mark_complete(&self) -> Result<()> {
        self.transition(COMPLETED)
    }

    pub fn mark_failed(&self) -> Result<()> {
        self.transition(FAILED)
    }

    fn create_dir(&self) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .with_path(&self.dir)
    }

    /// Moves to the `target` sentinel. An existing sentinel is renamed onto the new name, so there
    /// is never a moment with two of them present.
    fn transition(&self, target: &str) -> Result<()> {
        let target_path = self.dir.join(target);
        self.create_dir()?;

        let mut moved = target_path.exists();
        for other in SENTINELS.iter().filter(|name| **name != target) {
            let other_path = self.dir.join(other);
            if !other_path.exists() {
                continue;
            }
            if moved {
                warn!("removing stray sentinel {}", other_path.display());
                remove_if_present(&other_path)?;
            } else {
                fs::rename(&other_path, &target_path).with_path(&other_path)?;
                moved = true;
            }
        }

        if !moved {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&target_path)
            {
                Ok(file) => file.sync_all().with_path(&target_path)?,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e).with_path(&target_path),
            }
        }

        sync_dir(&self.dir)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e).with_path(path),
        _ => Ok(()),
    }
}

/// Flushes directory entries (creations and renames) to disk.
pub fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_path(dir)
}

/// The hub's state root and the well-known paths inside it.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateDir { root: root.into() }
    }

    /// Creates the state root, readable only by its owner.
    pub fn create(&self) -> io::Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step(&self, name: &str) -> StepState {
        StepState::new(self.root.join(name))
    }

    pub fn source_cluster(&self) -> PathBuf {
        self.root.join("source_cluster.json")
    }

    pub fn target_cluster(&self) -> PathBuf {
        self.root.join("target_cluster.json")
    }

    pub fn gpinitsystem_config(&self) -> PathBuf {
        self.root.join("gpinitsystem_config")
    }

    pub fn log(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.log"))
    }

    pub fn pg_upgrade(&self) -> PathBuf {
        self.root.join("pg_upgrade")
    }

    pub fn coordinator_upgrade_dir(&self) -> PathBuf {
        self.pg_upgrade().join("coordinator")
    }

    pub fn segment_upgrade_dir(&self, content: i32) -> PathBuf {
        self.pg_upgrade().join(format!("seg-{content}"))
    }

    /// Where the hub ships the target coordinator datadir on each segment host. Agents share the
    /// state root layout, so this is also valid on the agent side.
    pub fn coordinator_copy(&self) -> PathBuf {
        self.root.join("coordinator-copy")
    }
}
