// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! broadcast.rs
//!
//! Running a shell command once on every host of a cluster over ssh. This is only used to start
//! the agents; everything after that goes through the agents' RPC interface.

use std::collections::{BTreeMap, HashSet};

use log::{info, warn};

use crate::{
    cluster::Cluster,
    error::Result,
    system::{self, CommandSpec, System},
};

/// The combined results of a broadcast, keyed by the content id that was chosen to represent
/// each host.
#[derive(Debug, Default)]
pub struct RemoteOutput {
    pub num_errors: usize,
    pub errors: BTreeMap<i32, String>,
    pub stdouts: BTreeMap<i32, String>,
    pub stderrs: BTreeMap<i32, String>,
    pub commands: BTreeMap<i32, String>,
}

impl RemoteOutput {
    /// Hosts whose command failed, looked up through `cluster`.
    pub fn failed_hosts(&self, cluster: &Cluster) -> Vec<String> {
        self.errors
            .keys()
            .filter_map(|content| cluster.segment(*content))
            .map(|s| s.host.clone())
            .collect()
    }
}

/// Picks one content id per host: the first segment seen on each host, coordinator included.
fn contents_by_host(cluster: &Cluster) -> Vec<(i32, String)> {
    let mut seen = HashSet::new();
    let mut hosts: Vec<(i32, String)> = cluster
        .primaries()
        .into_iter()
        .chain(cluster.coordinator())
        .filter(|s| seen.insert(s.host.clone()))
        .map(|s| (s.content, s.host.clone()))
        .collect();
    hosts.sort_by_key(|(content, _)| *content);
    hosts
}

fn ssh_command(host: &str, command: &str) -> CommandSpec {
    CommandSpec::new("ssh")
        .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", host, command])
        .label(format!("ssh {host}"))
}

impl Cluster {
    /// Runs the command produced by `build_command` on every host in parallel, waiting for all of
    /// them to finish.
    ///
    /// A failing host does not stop the others; failures are counted and described in the
    /// returned `RemoteOutput`. Only a failure to launch ssh at all is returned as an error.
    pub async fn execute_on_all_hosts<F>(
        &self,
        system: &dyn System,
        label: &str,
        build_command: F,
    ) -> Result<RemoteOutput>
    where
        F: Fn(i32) -> String,
    {
        let targets: Vec<(i32, String, CommandSpec)> = contents_by_host(self)
            .into_iter()
            .map(|(content, host)| {
                let command = build_command(content);
                let spec = ssh_command(&host, &command);
                (content, host, spec)
            })
            .collect();

        let results = futures::future::join_all(
            targets
                .iter()
                .map(|(_, _, spec)| system::output(system, spec)),
        )
        .await;

        let mut output = RemoteOutput::default();
        for ((content, host, spec), result) in targets.iter().zip(results) {
            let content = *content;
            output.commands.insert(content, spec.to_string());

            let out = match result {
                Ok(out) => out,
                Err(e) => {
                    warn!("{label} on host {host}: {e}");
                    output.num_errors += 1;
                    output.errors.insert(content, e.to_string());
                    continue;
                }
            };

            output
                .stdouts
                .insert(content, String::from_utf8_lossy(&out.stdout).into_owned());
            output
                .stderrs
                .insert(content, String::from_utf8_lossy(&out.stderr).into_owned());

            if out.status.success() {
                info!("{label} on host {host} succeeded");
            } else {
                let code = out
                    .status
                    .code()
                    .map_or_else(|| "a signal".to_string(), |c| format!("exit status {c}"));
                let message = format!(
                    "{label} on host {host} failed with {code}: {}",
                    String::from_utf8_lossy(&out.stderr).trim_end()
                );
                warn!("{message}");
                output.num_errors += 1;
                output.errors.insert(content, message);
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cluster::{Role, Segment};

    fn seg(dbid: i32, content: i32, host: &str) -> Segment {
        Segment {
            dbid,
            content,
            role: Role::Primary,
            port: 5432 + dbid as u16,
            host: host.to_string(),
            datadir: PathBuf::from(format!("/data/seg{content}")),
        }
    }

    #[test]
    fn one_content_per_host() {
        let cluster = Cluster::new(
            vec![
                seg(1, -1, "mdw"),
                seg(2, 0, "sdw1"),
                seg(3, 1, "sdw1"),
                seg(4, 2, "sdw2"),
            ],
            "/bin",
        )
        .unwrap();

        assert_eq!(
            contents_by_host(&cluster),
            vec![
                (-1, "mdw".to_string()),
                (0, "sdw1".to_string()),
                (2, "sdw2".to_string())
            ]
        );
    }

    #[test]
    fn coordinator_host_shared_with_primaries_appears_once() {
        let cluster = Cluster::new(vec![seg(1, -1, "h"), seg(2, 0, "h"), seg(3, 1, "h")], "/bin")
            .unwrap();
        assert_eq!(contents_by_host(&cluster), vec![(0, "h".to_string())]);
    }
}
