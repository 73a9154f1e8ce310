// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Planning the target cluster from the source layout, and the `gpinitsystem` configuration that
//! creates it.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    cluster::{Cluster, Segment},
    error::{Error, Result},
};

/// Offset from a source primary's port to its target port while both clusters exist.
pub const PRIMARY_PORT_OFFSET: u16 = 2000;

/// `<parent>_upgrade/<basename>` for a source datadir `<parent>/<basename>`.
pub fn target_datadir(source: &Path) -> Result<PathBuf> {
    let (Some(parent), Some(base)) = (source.parent(), source.file_name()) else {
        return Err(Error::Configuration(format!(
            "data directory {} has no parent directory",
            source.display()
        )));
    };

    let mut upgrade_parent = parent.as_os_str().to_os_string();
    upgrade_parent.push("_upgrade");
    Ok(PathBuf::from(upgrade_parent).join(base))
}

fn shifted_port(port: u16, by: u16) -> Result<u16> {
    port.checked_add(by).ok_or_else(|| {
        Error::Configuration(format!(
            "port {port} cannot be moved by {by} without overflowing"
        ))
    })
}

/// Derives the target layout: same hosts, dbids and content ids; the coordinator one port up and
/// every primary `PRIMARY_PORT_OFFSET` up; every datadir moved under a `_upgrade` sibling of its
/// parent. The result is deterministic for a given source.
pub fn plan_target(source: &Cluster, target_bin_dir: &Path) -> Result<Cluster> {
    if source.is_empty() {
        return Err(Error::Configuration(
            "the source cluster has not been configured".to_string(),
        ));
    }

    let segments = source
        .segments
        .iter()
        .filter(|s| s.is_coordinator() || s.is_primary())
        .map(|s| {
            let offset = if s.is_coordinator() { 1 } else { PRIMARY_PORT_OFFSET };
            Ok(Segment {
                port: shifted_port(s.port, offset)?,
                datadir: target_datadir(&s.datadir)?,
                ..s.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Cluster::new(segments, target_bin_dir)?)
}

/// The coordinator datadir's basename without its trailing `-1`.
pub fn seg_prefix(coordinator_datadir: &Path) -> Result<String> {
    let base = coordinator_datadir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();

    base.strip_suffix("-1").map(str::to_string).ok_or_else(|| {
        Error::Configuration(format!(
            "coordinator data directory {} does not end in -1",
            coordinator_datadir.display()
        ))
    })
}

/// Settings copied from the running source cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub checkpoint_segments: String,
    pub encoding: String,
}

fn declaration(s: &Segment) -> String {
    format!(
        "{}~{}~{}~{}~{}",
        s.host,
        s.port,
        s.datadir.display(),
        s.dbid,
        s.content
    )
}

/// Renders the `gpinitsystem` configuration for `target`.
pub fn gpinitsystem_config(
    source: &Cluster,
    target: &Cluster,
    settings: &SourceSettings,
) -> Result<String> {
    let (Some(source_coordinator), Some(coordinator)) = (source.coordinator(), target.coordinator())
    else {
        return Err(Error::Internal(
            "cannot configure a target cluster without a coordinator".to_string(),
        ));
    };

    let mut lines = vec![
        r#"ARRAY_NAME="gp_upgrade cluster""#.to_string(),
        format!("SEG_PREFIX={}", seg_prefix(&source_coordinator.datadir)?),
        "TRUSTED_SHELL=ssh".to_string(),
        "HBA_HOSTNAMES=0".to_string(),
        format!("CHECK_POINT_SEGMENTS={}", settings.checkpoint_segments),
        format!("ENCODING={}", settings.encoding),
        format!("QD_PRIMARY_ARRAY={}", declaration(coordinator)),
        "declare -a PRIMARY_ARRAY=(".to_string(),
    ];
    lines.extend(
        target
            .primaries()
            .into_iter()
            .map(|s| format!("\t{}", declaration(s))),
    );
    lines.push(")".to_string());

    Ok(lines.join("\n") + "\n")
}

/// The parent directories the target primaries need, grouped by host. `gpinitsystem` creates the
/// datadirs themselves and refuses to reuse existing ones.
pub fn primary_parent_dirs(target: &Cluster) -> BTreeMap<String, Vec<PathBuf>> {
    let mut by_host: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for segment in target.primaries() {
        let Some(parent) = segment.datadir.parent() else {
            continue;
        };
        let dirs = by_host.entry(segment.host.clone()).or_default();
        if !dirs.iter().any(|d| d == parent) {
            dirs.push(parent.to_path_buf());
        }
    }
    by_host
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Role;

    fn seg(dbid: i32, content: i32, host: &str, port: u16, datadir: &str) -> Segment {
        Segment {
            dbid,
            content,
            role: Role::Primary,
            port,
            host: host.to_string(),
            datadir: PathBuf::from(datadir),
        }
    }

    fn source() -> Cluster {
        Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/data/qddir/demoDataDir-1"),
                seg(2, 0, "sdw1", 25432, "/data/dbfast1/demoDataDir0"),
                seg(3, 1, "sdw2", 25433, "/data/dbfast2/demoDataDir1"),
            ],
            "/usr/local/gpdb6/bin",
        )
        .unwrap()
    }

    #[test]
    fn target_layout() {
        let target = plan_target(&source(), Path::new("/usr/local/gpdb7/bin")).unwrap();

        let coordinator = target.coordinator().unwrap();
        assert_eq!(coordinator.port, 5433);
        assert_eq!(
            coordinator.datadir,
            PathBuf::from("/data/qddir_upgrade/demoDataDir-1")
        );
        assert_eq!(target.port_for(0), Some(27432));
        assert_eq!(
            target.datadir_for(1),
            Some(Path::new("/data/dbfast2_upgrade/demoDataDir1"))
        );
        assert_eq!(target.segment(1).unwrap().host, "sdw2");
        assert_eq!(target.segment(1).unwrap().dbid, 3);
        assert_eq!(target.bin_dir, PathBuf::from("/usr/local/gpdb7/bin"));

        // Planning is deterministic.
        assert_eq!(
            target,
            plan_target(&source(), Path::new("/usr/local/gpdb7/bin")).unwrap()
        );
    }

    #[test]
    fn prefix_comes_from_the_coordinator_datadir() {
        assert_eq!(
            seg_prefix(Path::new("/data/qddir/demoDataDir-1")).unwrap(),
            "demoDataDir"
        );
        assert_eq!(seg_prefix(Path::new("/d/-1")).unwrap(), "");
        assert!(seg_prefix(Path::new("/data/qddir/coordinator")).is_err());
    }

    #[test]
    fn config_file_contents() {
        let source = source();
        let target = plan_target(&source, Path::new("/usr/local/gpdb7/bin")).unwrap();
        let settings = SourceSettings {
            checkpoint_segments: "8".to_string(),
            encoding: "UTF8".to_string(),
        };

        let config = gpinitsystem_config(&source, &target, &settings).unwrap();
        assert_eq!(
            config,
            "ARRAY_NAME=\"gp_upgrade cluster\"\n\
             SEG_PREFIX=demoDataDir\n\
             TRUSTED_SHELL=ssh\n\
             HBA_HOSTNAMES=0\n\
             CHECK_POINT_SEGMENTS=8\n\
             ENCODING=UTF8\n\
             QD_PRIMARY_ARRAY=mdw~5433~/data/qddir_upgrade/demoDataDir-1~1~-1\n\
             declare -a PRIMARY_ARRAY=(\n\
             \tsdw1~27432~/data/dbfast1_upgrade/demoDataDir0~2~0\n\
             \tsdw2~27433~/data/dbfast2_upgrade/demoDataDir1~3~1\n\
             )\n"
        );
    }

    #[test]
    fn parents_grouped_by_host() {
        let source = Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/d/-1"),
                seg(2, 0, "sdw1", 25432, "/data/p/seg0"),
                seg(3, 1, "sdw1", 25433, "/data/p/seg1"),
                seg(4, 2, "sdw2", 25432, "/data/q/seg2"),
            ],
            "/bin",
        )
        .unwrap();
        let target = plan_target(&source, Path::new("/bin7")).unwrap();

        let dirs = primary_parent_dirs(&target);
        assert_eq!(dirs["sdw1"], vec![PathBuf::from("/data/p_upgrade")]);
        assert_eq!(dirs["sdw2"], vec![PathBuf::from("/data/q_upgrade")]);
        assert!(!dirs.contains_key("mdw"));
    }

    #[test]
    fn port_overflow_is_a_configuration_error() {
        let source = Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/d/-1"),
                seg(2, 0, "sdw1", 65000, "/d/0"),
            ],
            "/bin",
        )
        .unwrap();
        assert!(matches!(
            plan_target(&source, Path::new("/bin7")),
            Err(Error::Configuration(_))
        ));
    }
}
