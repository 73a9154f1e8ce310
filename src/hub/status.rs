// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Answers to the CLI's status and disk-space queries.

use std::fmt;

use crate::{
    cluster::COORDINATOR_CONTENT,
    error::{Error, Result},
    gpupgrade_capnp as wire,
    hub::{connections::for_hosts, Hub},
    state::Status,
    step::Substep,
};

/// Where one segment is in its upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionStatus {
    pub status: Status,
    pub dbid: i32,
    pub content: i32,
    pub host: String,
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.content == COORDINATOR_CONTENT {
            "COORDINATOR"
        } else {
            "PRIMARY"
        };
        write!(
            f,
            "{} - DBID {} - CONTENT ID {} - {role} - {}",
            self.status, self.dbid, self.content, self.host
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostFilesystemUsage {
    pub host: String,
    pub filesystem: String,
    pub usage_percent: f64,
}

impl Hub {
    /// The recorded status of every step, in execution order.
    pub fn step_statuses(&self) -> Vec<(Substep, Status)> {
        Substep::ALL
            .iter()
            .map(|substep| (*substep, self.state.step(substep.name()).status()))
            .collect()
    }

    /// The coordinator's upgrade status followed by every primary's, as reported by its agent.
    pub async fn conversion_status(&self) -> Result<Vec<ConversionStatus>> {
        let source = self.source();
        let coordinator = source
            .coordinator()
            .ok_or_else(|| Error::Configuration("the source cluster has not been configured".into()))?;

        let mut rows = vec![ConversionStatus {
            status: self
                .state
                .step(Substep::UpgradeCoordinator.name())
                .status(),
            dbid: coordinator.dbid,
            content: coordinator.content,
            host: coordinator.host.clone(),
        }];

        let agents = self.agents().await?;
        let work = for_hosts(&agents, |host| {
            let segments: Vec<(i32, i32)> = source
                .segments_on(host)
                .into_iter()
                .map(|s| (s.content, s.dbid))
                .collect();
            (!segments.is_empty()).then(|| (host.to_string(), segments))
        });

        let replies = self
            .agents
            .fan_out(work, |client, (host, segments)| async move {
                let statuses = wire::check_conversion_status(client, &segments).await?;
                Ok::<_, Error>(statuses
                    .into_iter()
                    .map(|s| ConversionStatus {
                        status: s.status,
                        dbid: s.dbid,
                        content: s.content,
                        host: host.clone(),
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut primaries: Vec<ConversionStatus> = replies.into_iter().flatten().collect();
        primaries.sort_by_key(|row| row.content);
        rows.extend(primaries);
        Ok(rows)
    }

    /// Filesystem usage on every agent host, in host order.
    pub async fn disk_usage(&self) -> Result<Vec<HostFilesystemUsage>> {
        let agents = self.agents().await?;
        let work = for_hosts(&agents, |host| Some(host.to_string()));

        let replies = self
            .agents
            .fan_out(work, |client, host| async move {
                let usage = wire::check_disk_space(client).await?;
                Ok::<_, Error>(usage
                    .into_iter()
                    .map(|u| HostFilesystemUsage {
                        host: host.clone(),
                        filesystem: u.filesystem,
                        usage_percent: u.usage_percent,
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(replies.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_rows_name_the_role() {
        let coordinator = ConversionStatus {
            status: Status::Complete,
            dbid: 1,
            content: -1,
            host: "mdw".to_string(),
        };
        assert_eq!(
            coordinator.to_string(),
            "COMPLETE - DBID 1 - CONTENT ID -1 - COORDINATOR - mdw"
        );

        let primary = ConversionStatus {
            status: Status::Running,
            dbid: 3,
            content: 1,
            host: "sdw2".to_string(),
        };
        assert_eq!(
            primary.to_string(),
            "RUNNING - DBID 3 - CONTENT ID 1 - PRIMARY - sdw2"
        );
    }
}
