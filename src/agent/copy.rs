// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Replacing segment data directories with the upgraded coordinator's catalog.
//!
//! After the coordinator is upgraded, its data directory is shipped to every segment host and
//! copied over each target primary. The segment keeps its own configuration files; files that
//! only make sense on the coordinator are removed.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{error, info};

use crate::{
    error::Error,
    system::{self, CommandSpec, ExitPolicy, System},
};

/// Files that differ between coordinator and segment, where the segment's version wins.
pub const PRESERVED_FILES: [&str; 4] = [
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
];

/// Coordinator-only files and directories.
pub const COORDINATOR_ONLY_FILES: [&str; 3] = ["gp_dbid", "gpssh.conf", "gpperfmon"];

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("segment data directory {} does not exist: {source}", .path.display())]
    Missing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not back up segment data directory {} to {}: {source}", .path.display(), .backup.display())]
    BackupFailed {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not copy coordinator data directory to {}: {source}", .path.display())]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("could not restore {} from the segment backup: {source}", .path.display())]
    RestoreFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not remove {} from segment data directory: {source}", .path.display())]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `<dir>.old`
pub fn backup_path(dir: &Path) -> PathBuf {
    let mut backup = dir.as_os_str().to_os_string();
    backup.push(".old");
    PathBuf::from(backup)
}

/// Copies `coordinator_dir` over each of `segment_dirs` in turn, then removes `coordinator_dir`.
///
/// The first failing segment stops the iteration and leaves the local copy in place, so the hub
/// can retry without shipping it again.
pub async fn copy_coordinator_data_directory(
    system: &dyn System,
    coordinator_dir: &Path,
    segment_dirs: &[PathBuf],
) -> Result<(), CopyError> {
    info!(
        "copying coordinator data directory {} over {} segment(s)",
        coordinator_dir.display(),
        segment_dirs.len()
    );

    for dir in segment_dirs {
        if let Err(e) = copy_over_segment(system, coordinator_dir, dir).await {
            error!("{e}");
            return Err(e);
        }
    }

    system
        .remove_all(coordinator_dir)
        .map_err(|source| CopyError::CleanupFailed {
            path: coordinator_dir.to_path_buf(),
            source,
        })
}

async fn copy_over_segment(
    system: &dyn System,
    coordinator_dir: &Path,
    dir: &Path,
) -> Result<(), CopyError> {
    system.stat(dir).map_err(|source| CopyError::Missing {
        path: dir.to_path_buf(),
        source,
    })?;

    let backup = backup_path(dir);
    system
        .rename(dir, &backup)
        .map_err(|source| CopyError::BackupFailed {
            path: dir.to_path_buf(),
            backup: backup.clone(),
            source,
        })?;

    let cp = CommandSpec::new("cp").arg("-a").arg(coordinator_dir).arg(dir);
    system::run_checked(system, &cp, ExitPolicy::Strict)
        .await
        .map_err(|e| CopyError::CopyFailed {
            path: dir.to_path_buf(),
            source: Box::new(e),
        })?;

    for name in PRESERVED_FILES {
        let from = backup.join(name);
        system
            .rename(&from, &dir.join(name))
            .map_err(|source| CopyError::RestoreFailed { path: from, source })?;
    }

    for name in COORDINATOR_ONLY_FILES {
        let path = dir.join(name);
        system
            .remove_all(&path)
            .map_err(|source| CopyError::CleanupFailed { path, source })?;
    }

    info!("replaced {} with the coordinator catalog", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use super::*;
    use crate::test_env::{block_on, test_dir, FakeSystem};

    fn populate(dir: &Path, files: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in files {
            fs::write(dir.join(name), format!("{} in {}", name, dir.display())).unwrap();
        }
    }

    /// A fake `cp -a src dst` that really copies one level of files.
    fn fake_cp(system: &FakeSystem) {
        system.on("cp", |cmd, _out, _err| {
            let args = cmd.args_lossy();
            let (src, dst) = (Path::new(&args[1]), Path::new(&args[2]));
            fs::create_dir_all(dst)?;
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::create_dir_all(dst.join(entry.file_name()))?;
                } else {
                    fs::copy(entry.path(), dst.join(entry.file_name()))?;
                }
            }
            Ok(0)
        });
    }

    #[test]
    fn segment_keeps_its_config_and_loses_coordinator_files() {
        let dir = test_dir("agent_copy_merges_files");
        let coordinator = dir.join("coordinator-copy");
        let segment = dir.join("seg0");

        populate(
            &coordinator,
            &["PG_VERSION", "gp_dbid", "gpssh.conf", "postgresql.conf", "pg_hba.conf"],
        );
        fs::create_dir_all(coordinator.join("gpperfmon")).unwrap();
        populate(&segment, &PRESERVED_FILES);

        let system = FakeSystem::new();
        fake_cp(&system);

        block_on(copy_coordinator_data_directory(
            &system,
            &coordinator,
            &[segment.clone()],
        ))
        .unwrap();

        assert!(segment.join("PG_VERSION").exists());
        let conf = fs::read_to_string(segment.join("postgresql.conf")).unwrap();
        assert!(conf.contains("seg0.old"), "segment config was not restored: {conf}");
        for name in COORDINATOR_ONLY_FILES {
            assert!(!segment.join(name).exists(), "{name} should be removed");
        }
        assert!(backup_path(&segment).exists());
        assert!(!coordinator.exists(), "the consumed copy should be removed");
    }

    #[test]
    fn missing_segment_directory() {
        let dir = test_dir("agent_copy_missing_segment");
        let coordinator = dir.join("coordinator-copy");
        populate(&coordinator, &["PG_VERSION"]);

        let system = FakeSystem::new();
        let err = block_on(copy_coordinator_data_directory(
            &system,
            &coordinator,
            &[dir.join("absent")],
        ))
        .unwrap_err();

        assert!(matches!(err, CopyError::Missing { .. }));
        assert!(coordinator.exists());
        assert!(system.calls().is_empty());
    }

    #[test]
    fn failed_copy_keeps_the_backup_and_stops() {
        let dir = test_dir("agent_copy_cp_fails");
        let coordinator = dir.join("coordinator-copy");
        let seg0 = dir.join("seg0");
        let seg1 = dir.join("seg1");
        populate(&coordinator, &["PG_VERSION"]);
        populate(&seg0, &PRESERVED_FILES);
        populate(&seg1, &PRESERVED_FILES);

        let system = FakeSystem::new();
        system.on("cp", |_cmd, _out, err| {
            err.write_all(b"cp: No space left on device\n")?;
            Ok(1)
        });

        let err = block_on(copy_coordinator_data_directory(
            &system,
            &coordinator,
            &[seg0.clone(), seg1.clone()],
        ))
        .unwrap_err();

        match &err {
            CopyError::CopyFailed { path, source } => {
                assert_eq!(path, &seg0);
                assert!(source.to_string().contains("No space left on device"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(backup_path(&seg0).exists());
        assert!(seg1.exists(), "second segment must not be touched");
        assert_eq!(system.calls().len(), 1);
    }

    #[test]
    fn missing_preserved_file_fails_restore() {
        let dir = test_dir("agent_copy_restore_fails");
        let coordinator = dir.join("coordinator-copy");
        let segment = dir.join("seg0");
        populate(&coordinator, &["PG_VERSION"]);
        populate(&segment, &["postgresql.conf"]);

        let system = FakeSystem::new();
        fake_cp(&system);

        let err = block_on(copy_coordinator_data_directory(
            &system,
            &coordinator,
            &[segment],
        ))
        .unwrap_err();
        assert!(matches!(err, CopyError::RestoreFailed { .. }), "{err}");
    }
}
