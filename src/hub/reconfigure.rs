// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! reconfigure.rs
//!
//! Moving the upgraded target cluster onto the source cluster's ports.
//!
//! The target was created on its own ports so it could coexist with the source. Once the
//! upgrade is done, the catalog is rewritten from a utility-mode coordinator, then the
//! coordinator's `postgresql.conf` is switched over. The next step starts the target normally on
//! the source ports.
//!
//! The configuration file is replaced with two renames: the original becomes
//! `postgresql.conf.bak` and the fully written `postgresql.conf.updated` takes its place. If the
//! hub dies between the two, the next run finishes the swap.

use std::{
    fs,
    io::{ErrorKind, Write},
    ops::Range,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::{info, warn},
};

use crate::{
    cluster::{
        catalog::ConnectOptions,
        lifecycle::{self, Mode},
        Cluster,
    },
    error::{Error, PathContext, Result, ResultExt},
    hub::Hub,
    state,
    stream::MultiplexedStream,
    system::System,
};

pub const CONF: &str = "postgresql.conf";

fn sibling(conf: &Path, suffix: &str) -> PathBuf {
    let mut name = conf.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn backup_path(datadir: &Path) -> PathBuf {
    sibling(&datadir.join(CONF), ".bak")
}

pub fn updated_path(datadir: &Path) -> PathBuf {
    sibling(&datadir.join(CONF), ".updated")
}

/// Locates the value of a `port` setting on one line of `postgresql.conf`.
///
/// Accepts `port=5432`, `port = 5432`, `port 5432` and `port = '5432'`, with an optional trailing
/// comment. Returns the byte range of the digits within `line` and the port.
fn port_setting(line: &str) -> Option<(Range<usize>, u16)> {
    let setting = line.split('#').next()?;
    let rest = setting.trim_start().strip_prefix("port")?;

    let after_key = rest.trim_start();
    let value = match after_key.strip_prefix('=') {
        Some(value) => value,
        // `port` must be the whole name.
        None if after_key.len() < rest.len() => after_key,
        None => return None,
    };
    let value = value.trim_start();
    let value = value.strip_prefix('\'').unwrap_or(value);

    let digits = value.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || !value[digits..].trim_start_matches('\'').trim().is_empty() {
        return None;
    }

    let start = setting.len() - value.len();
    let port = value[..digits].parse().ok()?;
    Some((start..start + digits, port))
}

/// The port a `postgresql.conf` sets, if any. Later settings override earlier ones.
pub fn parse_port(contents: &str) -> Option<u16> {
    contents
        .lines()
        .filter_map(|line| port_setting(line).map(|(_, port)| port))
        .last()
}

/// Changes every `port` setting of `from` to `to`, leaving the rest of each line alone.
///
/// Returns `None` when no setting of `from` was found.
pub fn replace_port(contents: &str, from: u16, to: u16) -> Option<String> {
    let mut replaced = false;
    let mut out = String::with_capacity(contents.len());

    for line in contents.split_inclusive('\n') {
        match port_setting(line) {
            Some((digits, port)) if port == from => {
                out.push_str(&line[..digits.start]);
                out.push_str(&to.to_string());
                out.push_str(&line[digits.end..]);
                replaced = true;
            }
            _ => out.push_str(line),
        }
    }

    replaced.then_some(out)
}

/// Finishes a swap that was interrupted after the original file was moved aside.
pub fn recover_conf(system: &dyn System, datadir: &Path) -> Result<()> {
    let conf = datadir.join(CONF);
    match system.stat(&conf) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_path(&conf),
    }

    let updated = updated_path(datadir);
    if system.stat(&updated).is_err() {
        return Err(Error::Configuration(format!(
            "{} is missing and there is no {} to finish the port change with; restore it from {}",
            conf.display(),
            updated.display(),
            backup_path(datadir).display()
        )));
    }

    warn!("finishing interrupted rewrite of {}", conf.display());
    system.rename(&updated, &conf).with_path(&updated)?;
    state::sync_dir(datadir)
}

/// The port the coordinator in `datadir` is configured to listen on.
pub fn configured_port(datadir: &Path) -> Result<Option<u16>> {
    let conf = datadir.join(CONF);
    let contents = fs::read_to_string(&conf).with_path(&conf)?;
    Ok(parse_port(&contents))
}

/// Rewrites the `port` setting from `from` to `to` in the coordinator's `postgresql.conf`, keeping
/// the original as `postgresql.conf.bak`. Nothing is renamed unless the rewrite takes effect.
pub fn rewrite_conf_port(system: &dyn System, datadir: &Path, from: u16, to: u16) -> Result<()> {
    if from == to {
        info!("{} already uses port {to}", datadir.join(CONF).display());
        return Ok(());
    }

    let conf = datadir.join(CONF);
    let updated = updated_path(datadir);
    let backup = backup_path(datadir);

    let contents = fs::read_to_string(&conf).with_path(&conf)?;
    let rewritten = replace_port(&contents, from, to)
        .filter(|rewritten| parse_port(rewritten) == Some(to))
        .ok_or_else(|| {
            Error::Configuration(format!(
                "{} does not set port {from}; set the port to {to} by hand",
                conf.display()
            ))
        })?;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&updated)
        .and_then(|mut file| {
            file.write_all(rewritten.as_bytes())?;
            file.sync_all()
        })
        .with_path(&updated)?;

    system.rename(&conf, &backup).with_path(&conf)?;
    system.rename(&updated, &conf).with_path(&updated)?;
    state::sync_dir(datadir)
}

/// Reassigns the target's ports from the source cluster, by content id.
fn with_source_ports(source: &Cluster, target: &Cluster) -> Result<Cluster> {
    let mut reconfigured = target.clone();
    for segment in &mut reconfigured.segments {
        if let Some(port) = source.port_for(segment.content) {
            segment.port = port;
        }
    }

    reconfigured.validate().map_err(|e| {
        Error::Internal(format!("target cluster is invalid on the source ports: {e}"))
    })?;
    Ok(reconfigured)
}

const RECOVERY: &str = "the target cluster's ports were left partially updated and must be \
     repaired by hand: compare gp_segment_configuration with source_cluster.json and restore \
     postgresql.conf from postgresql.conf.bak in the target coordinator data directory if needed";

pub fn reconfigure_ports<'a>(
    hub: &'a Hub,
    stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move { reconfigure(hub, stream).await.context(RECOVERY) }.boxed_local()
}

async fn reconfigure(hub: &Hub, stream: &MultiplexedStream) -> Result<()> {
    let source = hub.source();
    let target = hub.target();
    let (Some(source_coordinator), Some(target_coordinator)) =
        (source.coordinator(), target.coordinator())
    else {
        return Err(Error::Internal(
            "both clusters must be configured before their ports can be swapped".into(),
        ));
    };
    let datadir = target_coordinator.datadir.clone();
    let system = &*hub.system;

    lifecycle::stop_if_running(system, stream, &target, "target").await?;

    recover_conf(system, &datadir)?;
    let listening = configured_port(&datadir)?.unwrap_or(target_coordinator.port);

    lifecycle::start(system, stream, &target, "target", Mode::CoordinatorOnly).await?;

    let ports: Vec<(i32, u16)> = source
        .content_ids()
        .into_iter()
        .filter_map(|content| source.port_for(content).map(|port| (content, port)))
        .collect();

    let updated = async {
        let mut catalog = hub.connect(ConnectOptions::utility(listening), "target").await?;
        catalog.set_segment_ports(&ports).await
    }
    .await;

    // The coordinator comes down whether or not the catalog was updated.
    let stopped = lifecycle::stop(system, stream, &target, "target", Mode::CoordinatorOnly).await;
    updated.context("could not update the ports in the target catalog")?;
    stopped?;

    rewrite_conf_port(system, &datadir, listening, source_coordinator.port)?;

    hub.set_target(with_source_ports(&source, &target)?)
}
