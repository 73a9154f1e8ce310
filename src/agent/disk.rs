// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::HashSet, fs, path::Path};

use {log::warn, nix::sys::statvfs::statvfs};

use crate::error::{PathContext, Result};

const MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Clone, PartialEq)]
pub struct FilesystemUsage {
    pub filesystem: String,
    pub usage_percent: f64,
}

/// Usage of every mounted filesystem on this host, in mount order.
///
/// Pseudo filesystems report no blocks and are left out.
pub fn check_disk_space() -> Result<Vec<FilesystemUsage>> {
    let mounts = fs::read_to_string(MOUNTS).with_path(MOUNTS)?;

    let mut usage = Vec::new();
    for mount_point in mount_points(&mounts) {
        let stat = match statvfs(Path::new(&mount_point)) {
            Ok(stat) => stat,
            Err(e) => {
                warn!("skipping {mount_point}: {e}");
                continue;
            }
        };

        let blocks = stat.blocks() as u64;
        if blocks == 0 {
            continue;
        }
        let used = blocks.saturating_sub(stat.blocks_free() as u64);
        let available = stat.blocks_available() as u64;

        usage.push(FilesystemUsage {
            filesystem: mount_point,
            usage_percent: usage_percent(used, available),
        });
    }
    Ok(usage)
}

/// The percentage `df` reports: space used out of the space available to unprivileged users.
pub fn usage_percent(used: u64, available: u64) -> f64 {
    let total = used + available;
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Mount points listed in the contents of `/proc/mounts`, without duplicates.
pub fn mount_points(mounts: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape)
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

/// Undoes the octal escaping of whitespace and backslashes in `/proc/mounts`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_points() {
        let mounts = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid 0 0
/dev/sdb1 /data/with\\040space xfs rw 0 0
/dev/sda1 / ext4 rw,relatime 0 0
";
        assert_eq!(mount_points(mounts), vec!["/", "/proc", "/data/with space"]);
    }

    #[test]
    fn percent_matches_df() {
        assert_eq!(usage_percent(0, 0), 0.0);
        assert_eq!(usage_percent(25, 75), 25.0);
        assert_eq!(usage_percent(100, 0), 100.0);
    }

    #[test]
    fn root_filesystem_is_reported() {
        let usage = check_disk_space().unwrap();
        let root = usage.iter().find(|u| u.filesystem == "/");
        if let Some(root) = root {
            assert!((0.0..=100.0).contains(&root.usage_percent));
        }
    }
}
