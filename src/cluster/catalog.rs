// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! catalog.rs
//!
//! Access to the `gp_segment_configuration` catalog of a running cluster.

use std::{collections::BTreeSet, path::PathBuf};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::{debug, error},
    tokio_postgres::NoTls,
};

use crate::{
    cluster::{Cluster, Role, Segment},
    error::{Error, Result},
    version::GpVersion,
};

/// Reads every primary (and the coordinator) from the catalog.
pub const SEGMENT_CONFIGURATION_QUERY: &str = "SELECT dbid::int4, content::int4, role::text, \
     port::int4, hostname::text, datadir::text \
     FROM gp_segment_configuration WHERE role = 'p' ORDER BY content";

const CONTENTS_QUERY: &str = "SELECT content::int4 FROM gp_segment_configuration";

const UPDATE_PORT: &str = "UPDATE gp_segment_configuration SET port = $1::int4 \
     WHERE content = $2::int4 AND role = 'p'";

/// How to reach a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub port: u16,
    /// Connect to a coordinator started in utility mode, with system table modifications
    /// allowed.
    pub utility: bool,
}

impl ConnectOptions {
    pub fn normal(port: u16) -> Self {
        ConnectOptions {
            port,
            utility: false,
        }
    }

    pub fn utility(port: u16) -> Self {
        ConnectOptions {
            port,
            utility: true,
        }
    }
}

/// An open connection to a coordinator.
pub trait Catalog {
    /// Rows of `gp_segment_configuration` for the coordinator and every primary.
    fn segments(&mut self) -> LocalBoxFuture<'_, Result<Vec<Segment>>>;

    /// The value of `current_setting(name)`.
    fn setting<'a>(&'a mut self, name: &'a str) -> LocalBoxFuture<'a, Result<String>>;

    /// The output of `SELECT version()`.
    fn version(&mut self) -> LocalBoxFuture<'_, Result<String>>;

    /// Sets the port of each `(content, port)` primary in one transaction.
    ///
    /// The set of content ids in the catalog must be exactly the set given, and every update must
    /// touch exactly one row; otherwise nothing is changed.
    fn set_segment_ports<'a>(
        &'a mut self,
        ports: &'a [(i32, u16)],
    ) -> LocalBoxFuture<'a, Result<()>>;
}

/// Opens catalog connections.
pub trait Connector {
    fn connect(&self, options: ConnectOptions) -> LocalBoxFuture<'_, Result<Box<dyn Catalog>>>;
}

/// Builds a cluster from the catalog of a running coordinator.
pub async fn from_database(catalog: &mut dyn Catalog, bin_dir: impl Into<PathBuf>) -> Result<Cluster> {
    let segments = catalog.segments().await?;
    let banner = catalog.version().await?;

    let mut cluster = Cluster::new(segments, bin_dir)?;
    cluster.version = Some(
        GpVersion::parse_banner(&banner).map_err(|e| Error::Configuration(e.to_string()))?,
    );

    Ok(cluster)
}

/// Connects over TCP to a coordinator on this host with `tokio-postgres`.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    pub host: String,
    pub user: Option<String>,
    pub dbname: String,
}

impl Default for PostgresConnector {
    fn default() -> Self {
        PostgresConnector {
            host: "localhost".to_string(),
            user: std::env::var("USER").ok(),
            dbname: "template1".to_string(),
        }
    }
}

impl Connector for PostgresConnector {
    fn connect(&self, options: ConnectOptions) -> LocalBoxFuture<'_, Result<Box<dyn Catalog>>> {
        async move {
            let mut config = tokio_postgres::Config::new();
            config
                .host(&self.host)
                .port(options.port)
                .dbname(&self.dbname);
            if let Some(user) = &self.user {
                config.user(user);
            }
            if options.utility {
                config.options("-c gp_session_role=utility -c allow_system_table_mods=true");
            }

            debug!("connecting to {}:{} (utility={})", self.host, options.port, options.utility);
            let (client, connection) = config.connect(NoTls).await?;

            tokio::task::spawn_local(async move {
                if let Err(e) = connection.await {
                    error!("database connection error: {e}");
                }
            });

            Ok(Box::new(PostgresCatalog { client }) as Box<dyn Catalog>)
        }
        .boxed_local()
    }
}

struct PostgresCatalog {
    client: tokio_postgres::Client,
}

impl Catalog for PostgresCatalog {
    fn segments(&mut self) -> LocalBoxFuture<'_, Result<Vec<Segment>>> {
        async move {
            let rows = self.client.query(SEGMENT_CONFIGURATION_QUERY, &[]).await?;

            rows.iter()
                .map(|row| -> Result<Segment> {
                    let role: String = row.try_get(2)?;
                    let port: i32 = row.try_get(3)?;
                    let datadir: String = row.try_get(5)?;
                    Ok(Segment {
                        dbid: row.try_get(0)?,
                        content: row.try_get(1)?,
                        role: if role == "m" { Role::Mirror } else { Role::Primary },
                        port: u16::try_from(port).map_err(|_| {
                            Error::Internal(format!("catalog port {port} is out of range"))
                        })?,
                        host: row.try_get(4)?,
                        datadir: PathBuf::from(datadir),
                    })
                })
                .collect()
        }
        .boxed_local()
    }

    fn setting<'a>(&'a mut self, name: &'a str) -> LocalBoxFuture<'a, Result<String>> {
        async move {
            let row = self
                .client
                .query_one("SELECT current_setting($1)", &[&name])
                .await?;
            Ok(row.try_get(0)?)
        }
        .boxed_local()
    }

    fn version(&mut self) -> LocalBoxFuture<'_, Result<String>> {
        async move {
            let row = self.client.query_one("SELECT version()", &[]).await?;
            Ok(row.try_get(0)?)
        }
        .boxed_local()
    }

    fn set_segment_ports<'a>(
        &'a mut self,
        ports: &'a [(i32, u16)],
    ) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            // Dropping the transaction without committing rolls it back.
            let tx = self.client.transaction().await?;

            let rows = tx.query(CONTENTS_QUERY, &[]).await?;
            let in_catalog = rows
                .iter()
                .map(|row| row.try_get::<_, i32>(0))
                .collect::<std::result::Result<BTreeSet<i32>, _>>()?;
            check_contents(&in_catalog, ports)?;

            for (content, port) in ports {
                let updated = tx
                    .execute(UPDATE_PORT, &[&i32::from(*port), content])
                    .await?;
                if updated != 1 {
                    return Err(Error::Internal(format!(
                        "updating port for content {content} touched {updated} rows, expected 1"
                    )));
                }
            }

            tx.commit().await?;
            Ok(())
        }
        .boxed_local()
    }
}

/// Sanity check that the catalog describes the cluster we think it does.
pub fn check_contents(in_catalog: &BTreeSet<i32>, ports: &[(i32, u16)]) -> Result<()> {
    let expected: BTreeSet<i32> = ports.iter().map(|(content, _)| *content).collect();
    if *in_catalog != expected {
        return Err(Error::Internal(format!(
            "catalog content ids {in_catalog:?} do not match the source cluster's {expected:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_mismatch_is_rejected() {
        let catalog = BTreeSet::from([-1, 0, 1]);
        assert!(check_contents(&catalog, &[(-1, 5432), (0, 5433), (1, 5434)]).is_ok());

        let err = check_contents(&catalog, &[(-1, 5432), (0, 5433)]).unwrap_err();
        assert!(err.to_string().contains("do not match"));
    }
}
