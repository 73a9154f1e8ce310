// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The model of a Greenplum cluster: its segments, where they live, and the binaries that run
//! them. The hub keeps two of these, one for the source cluster and one for the target, each
//! persisted to its own JSON file under the state root.

pub mod broadcast;
pub mod catalog;
pub mod lifecycle;

use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::version::GpVersion;

/// The content id of the coordinator segment.
pub const COORDINATOR_CONTENT: i32 = -1;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Mirror,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub dbid: i32,
    pub content: i32,
    pub role: Role,
    pub port: u16,
    pub host: String,
    pub datadir: PathBuf,
}

impl Segment {
    pub fn is_coordinator(&self) -> bool {
        self.content == COORDINATOR_CONTENT
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary && !self.is_coordinator()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster configuration {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("cluster configuration {} is malformed: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid cluster configuration: {0}")]
    InvariantViolation(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A cluster with no segments has not been discovered or initialized yet. Every query on it
/// returns nothing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Cluster {
    pub segments: Vec<Segment>,

    #[serde(rename = "binDir")]
    pub bin_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<GpVersion>,
}

impl Cluster {
    pub fn new(segments: Vec<Segment>, bin_dir: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let cluster = Cluster {
            segments,
            bin_dir: bin_dir.into(),
            version: None,
        };
        cluster.validate()?;
        Ok(cluster)
    }

    /// Reads and validates a cluster configuration file.
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let contents = match fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClusterError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ClusterError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let cluster: Cluster =
            serde_json::from_slice(&contents).map_err(|source| ClusterError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        cluster.validate()?;
        Ok(cluster)
    }

    /// Atomically replaces the file at `path` with this cluster.
    ///
    /// The new contents go to a sibling temp file which is synced, along with its directory,
    /// before being renamed over `path`. Readers see either the old file or the new one.
    pub fn commit(&self, path: &Path) -> Result<(), ClusterError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = dir.join(tmp_name);

        let mut contents = serde_json::to_vec_pretty(self).map_err(|e| io_error(path, e.into()))?;
        contents.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(&contents)
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error(&tmp, e))?;
        drop(file);

        sync_dir(&dir)?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
        sync_dir(&dir)
    }

    /// Checks the invariants every cluster must satisfy. An empty cluster is valid.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.segments.is_empty() {
            return Ok(());
        }

        let violation = |msg: String| Err(ClusterError::InvariantViolation(msg));

        let coordinators = self.segments.iter().filter(|s| s.is_coordinator()).count();
        if coordinators != 1 {
            return violation(format!(
                "expected exactly one coordinator (content {COORDINATOR_CONTENT}), found {coordinators}"
            ));
        }

        let mut dbids = HashSet::new();
        let mut contents = HashSet::new();
        let mut addresses = HashSet::new();
        let mut datadirs = HashSet::new();

        for seg in &self.segments {
            if seg.dbid <= 0 {
                return violation(format!("dbid {} is not a positive integer", seg.dbid));
            }
            if !dbids.insert(seg.dbid) {
                return violation(format!("duplicate dbid {}", seg.dbid));
            }
            if seg.content < COORDINATOR_CONTENT {
                return violation(format!("invalid content id {}", seg.content));
            }
            if seg.role == Role::Primary && !contents.insert(seg.content) {
                return violation(format!("duplicate content id {}", seg.content));
            }
            if !addresses.insert((seg.host.as_str(), seg.port)) {
                return violation(format!(
                    "more than one segment uses port {} on host {}",
                    seg.port, seg.host
                ));
            }
            if !datadirs.insert((seg.host.as_str(), seg.datadir.as_path())) {
                return violation(format!(
                    "more than one segment uses data directory {} on host {}",
                    seg.datadir.display(),
                    seg.host
                ));
            }
            if !seg.datadir.is_absolute() {
                return violation(format!(
                    "data directory {} is not an absolute path",
                    seg.datadir.display()
                ));
            }
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn coordinator(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| s.is_coordinator())
    }

    /// Primary segments, excluding the coordinator, in content order.
    pub fn primaries(&self) -> Vec<&Segment> {
        let mut primaries: Vec<&Segment> = self.segments.iter().filter(|s| s.is_primary()).collect();
        primaries.sort_by_key(|s| s.content);
        primaries
    }

    /// The primary segments (not the coordinator) that live on `host`.
    pub fn segments_on(&self, host: &str) -> Vec<&Segment> {
        self.primaries()
            .into_iter()
            .filter(|s| s.host == host)
            .collect()
    }

    /// Every host with a coordinator or primary, each once, in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.segments
            .iter()
            .filter(|s| s.role == Role::Primary)
            .filter(|s| seen.insert(s.host.as_str()))
            .map(|s| s.host.clone())
            .collect()
    }

    /// Hosts with at least one primary segment, each once, in content order.
    pub fn primary_hosts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.primaries()
            .into_iter()
            .filter(|s| seen.insert(s.host.as_str()))
            .map(|s| s.host.clone())
            .collect()
    }

    pub fn segment(&self, content: i32) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.content == content && s.role == Role::Primary)
    }

    pub fn port_for(&self, content: i32) -> Option<u16> {
        self.segment(content).map(|s| s.port)
    }

    pub fn datadir_for(&self, content: i32) -> Option<&Path> {
        self.segment(content).map(|s| s.datadir.as_path())
    }

    pub fn content_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .segments
            .iter()
            .filter(|s| s.role == Role::Primary)
            .map(|s| s.content)
            .collect();
        ids.sort();
        ids
    }

    /// The major version, if known.
    pub fn major_version(&self) -> Option<u32> {
        self.version.map(|v| v.major)
    }
}

fn io_error(path: &Path, source: io::Error) -> ClusterError {
    ClusterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sync_dir(dir: &Path) -> Result<(), ClusterError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error(dir, e))
}

/// Checks the invariants that relate a source cluster to its target: the same content ids, and
/// each content id on the same host in both. A target that has not been initialized yet passes.
pub fn check_pair(source: &Cluster, target: &Cluster) -> Result<(), ClusterError> {
    if target.is_empty() {
        return Ok(());
    }

    let source_ids = source.content_ids();
    let target_ids = target.content_ids();
    if source_ids != target_ids {
        return Err(ClusterError::InvariantViolation(format!(
            "source content ids {source_ids:?} do not match target content ids {target_ids:?}"
        )));
    }

    for content in source_ids {
        let (Some(s), Some(t)) = (source.segment(content), target.segment(content)) else {
            continue;
        };
        if s.host != t.host {
            return Err(ClusterError::InvariantViolation(format!(
                "content {content} is on host {} in the source cluster but on host {} in the target",
                s.host, t.host
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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
                seg(3, 1, "sdw2", 25432, "/data/dbfast2/demoDataDir1"),
                seg(4, 2, "sdw1", 25433, "/data/dbfast3/demoDataDir2"),
            ],
            "/usr/local/gpdb6/bin",
        )
        .unwrap()
    }

    #[test]
    fn queries() {
        let c = source();
        assert_eq!(c.coordinator().unwrap().dbid, 1);
        assert_eq!(c.hosts(), vec!["mdw", "sdw1", "sdw2"]);
        assert_eq!(c.primary_hosts(), vec!["sdw1", "sdw2"]);
        assert_eq!(
            c.segments_on("sdw1")
                .iter()
                .map(|s| s.content)
                .collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(c.segments_on("mdw").is_empty());
        assert_eq!(c.port_for(1), Some(25432));
        assert_eq!(
            c.datadir_for(-1),
            Some(Path::new("/data/qddir/demoDataDir-1"))
        );
        assert_eq!(c.port_for(7), None);
        assert_eq!(c.content_ids(), vec![-1, 0, 1, 2]);
    }

    #[test]
    fn rejects_missing_coordinator() {
        let err = Cluster::new(vec![seg(2, 0, "sdw1", 25432, "/d/0")], "/bin").unwrap_err();
        assert!(matches!(err, ClusterError::InvariantViolation(_)));
    }

    #[test]
    fn rejects_duplicate_port_on_a_host() {
        let err = Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/d/-1"),
                seg(2, 0, "mdw", 5432, "/d/0"),
            ],
            "/bin",
        )
        .unwrap_err();
        assert!(err.to_string().contains("port 5432 on host mdw"));
    }

    #[test]
    fn same_port_on_different_hosts_is_fine() {
        assert!(source().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_datadir_on_a_host() {
        let err = Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/d/-1"),
                seg(2, 0, "mdw", 5433, "/d/-1"),
            ],
            "/bin",
        )
        .unwrap_err();
        assert!(err.to_string().contains("data directory /d/-1"));
    }

    #[test]
    fn rejects_duplicate_content() {
        let err = Cluster::new(
            vec![
                seg(1, -1, "mdw", 5432, "/d/-1"),
                seg(2, 0, "sdw1", 5433, "/d/0"),
                seg(3, 0, "sdw1", 5434, "/d/1"),
            ],
            "/bin",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate content id 0"));
    }

    #[test]
    fn pair_requires_colocation() {
        let source = source();
        let mut target = source.clone();
        assert!(check_pair(&source, &target).is_ok());
        assert!(check_pair(&source, &Cluster::default()).is_ok());

        target.segments[1].host = "sdw9".to_string();
        let err = check_pair(&source, &target).unwrap_err();
        assert!(err.to_string().contains("content 0"));

        target.segments.remove(1);
        assert!(check_pair(&source, &target).is_err());
    }

    #[test]
    fn serialized_field_names() {
        let mut c = source();
        c.version = Some(GpVersion::new(6, 20, 3));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["binDir"], "/usr/local/gpdb6/bin");
        assert_eq!(json["version"], "6.20.3");
        assert_eq!(json["segments"][0]["role"], "primary");
        assert_eq!(json["segments"][0]["content"], -1);
    }
}
