// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{io::ErrorKind, path::PathBuf};

use log::info;

use crate::{
    error::{Error, PathContext, Result},
    system::System,
};

/// Creates each directory that does not exist yet, with mode 0755. Existing directories are left
/// alone.
pub fn create_segment_data_directories(system: &dyn System, dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs {
        match system.stat(dir) {
            Ok(_) => info!("directory {} already exists", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                system.mkdir_all(dir, 0o755).with_path(dir)?;
                info!("created directory {}", dir.display());
            }
            Err(e) => return Err(Error::filesystem(dir, e)),
        }
    }
    Ok(())
}

/// Removes each directory and everything below it. Missing directories are not an error.
pub fn delete_data_directories(system: &dyn System, dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs {
        system.remove_all(dir).with_path(dir)?;
        info!("removed directory {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::*;
    use crate::test_env::{test_dir, FakeSystem};

    #[test]
    fn creates_missing_and_keeps_existing() {
        let dir = test_dir("agent_create_dirs");
        let existing = dir.join("existing");
        fs::create_dir(&existing).unwrap();
        fs::write(existing.join("marker"), "keep").unwrap();
        let missing = dir.join("missing");

        create_segment_data_directories(&FakeSystem::new(), &[existing.clone(), missing.clone()])
            .unwrap();

        assert!(existing.join("marker").exists());
        let mode = fs::metadata(&missing).unwrap().permissions().mode();
        assert_eq!(mode & 0o777 & !0o022, 0o755 & !0o022);
    }

    #[test]
    fn deletes_recursively_and_tolerates_missing() {
        let dir = test_dir("agent_delete_dirs");
        let target = dir.join("data_upgrade/seg0");
        fs::create_dir_all(target.join("base")).unwrap();
        fs::write(target.join("PG_VERSION"), "7").unwrap();

        delete_data_directories(&FakeSystem::new(), &[target.clone(), dir.join("never-created")])
            .unwrap();
        assert!(!target.exists());
    }
}
