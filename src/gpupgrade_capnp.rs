// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The generated Cap'n Proto bindings, plus the client-side plumbing shared by the CLI, the hub,
//! and the agent: connecting, serving, and converting between wire and domain types.

use std::{
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use {
    capnp::capability::FromClientHook,
    capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem},
    futures::AsyncReadExt,
    log::{debug, info, warn},
    tokio::{net::TcpListener, sync::Notify, task::JoinHandle},
};

use crate::{
    agent::{
        disk::FilesystemUsage,
        status::SegmentStatus,
        upgrade::{DataDirPair, UpgradeRequest},
    },
    error::Result,
    state::Status,
    stream::ChunkKind,
};

include!(concat!(env!("OUT_DIR"), "/gpupgrade_capnp.rs"));

impl From<Status> for StepStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Unknown => StepStatus::UnknownStatus,
            Status::Pending => StepStatus::Pending,
            Status::Running => StepStatus::Running,
            Status::Complete => StepStatus::Complete,
            Status::Failed => StepStatus::Failed,
        }
    }
}

impl From<StepStatus> for Status {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::UnknownStatus => Status::Unknown,
            StepStatus::Pending => Status::Pending,
            StepStatus::Running => Status::Running,
            StepStatus::Complete => Status::Complete,
            StepStatus::Failed => Status::Failed,
        }
    }
}

impl From<ChunkKind> for ChunkType {
    fn from(kind: ChunkKind) -> Self {
        match kind {
            ChunkKind::Stdout => ChunkType::Stdout,
            ChunkKind::Stderr => ChunkType::Stderr,
        }
    }
}

impl From<ChunkType> for ChunkKind {
    fn from(kind: ChunkType) -> Self {
        match kind {
            ChunkType::Stdout => ChunkKind::Stdout,
            ChunkType::Stderr => ChunkKind::Stderr,
        }
    }
}

/// A live RPC connection. The client stays usable until the connection task ends or is aborted.
pub struct Connection<C> {
    pub client: C,
    pub task: JoinHandle<std::result::Result<(), capnp::Error>>,
}

/// Connects to the RPC server at `address` and bootstraps its main interface.
///
/// Must be called from within a `LocalSet`; the connection is driven by a local task.
pub async fn connect<C: FromClientHook>(address: &str) -> io::Result<Connection<C>> {
    let stream = tokio::net::TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();

    let rpc_network = Box::new(twoparty::VatNetwork::new(
        futures::io::BufReader::new(reader),
        futures::io::BufWriter::new(writer),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    ));
    let mut rpc_system = RpcSystem::new(rpc_network, None);
    let client: C = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

    let task = tokio::task::spawn_local(rpc_system);

    Ok(Connection { client, task })
}

/// Serves `bootstrap` to every connection accepted on `listener` until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    bootstrap: capnp::capability::Client,
    shutdown: Rc<Notify>,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.notified() => {
                info!("shutting down RPC server");
                return Ok(());
            }
        };
        debug!("accepted connection from {peer}");

        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set nodelay for {peer}: {e}");
        }

        let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
        let network = twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Server,
            Default::default(),
        );

        let rpc_system = RpcSystem::new(Box::new(network), Some(capnp::capability::Client::new(bootstrap.hook.add_ref())));
        tokio::task::spawn_local(async move {
            if let Err(e) = rpc_system.await {
                debug!("connection from {peer} ended: {e}");
            }
        });
    }
}

pub(crate) fn set_dirs(
    mut list: capnp::struct_list::Builder<'_, data_directory::Owned>,
    dirs: &[PathBuf],
) {
    for (i, dir) in dirs.iter().enumerate() {
        list.reborrow()
            .get(i as u32)
            .set_path(&*dir.to_string_lossy());
    }
}

pub(crate) fn read_dirs(
    list: capnp::struct_list::Reader<'_, data_directory::Owned>,
) -> capnp::Result<Vec<PathBuf>> {
    list.iter()
        .map(|dir| Ok(PathBuf::from(dir.get_path()?.to_str()?)))
        .collect()
}

/// Settles a synchronous request.
pub(crate) fn promise(result: Result<()>) -> capnp::capability::Promise<(), capnp::Error> {
    match result {
        Ok(()) => capnp::capability::Promise::ok(()),
        Err(e) => capnp::capability::Promise::err(crate::error::to_rpc(e)),
    }
}

pub(crate) fn read_path(text: capnp::text::Reader<'_>) -> capnp::Result<PathBuf> {
    Ok(PathBuf::from(text.to_str()?))
}

// Client side of the agent interface, used by the hub.

pub async fn ping_agent(client: &agent::Client) -> Result<()> {
    client.ping_request().send().promise.await?;
    Ok(())
}

pub async fn create_segment_data_directories(
    client: &agent::Client,
    dirs: &[PathBuf],
) -> Result<()> {
    let mut request = client.create_segment_data_directories_request();
    set_dirs(request.get().init_datadirs(dirs.len() as u32), dirs);
    request.send().promise.await?;
    Ok(())
}

pub async fn copy_coordinator_data_directory(
    client: &agent::Client,
    coordinator_dir: &Path,
    segment_dirs: &[PathBuf],
) -> Result<()> {
    let mut request = client.copy_coordinator_data_directory_request();
    request
        .get()
        .set_coordinator_dir(&*coordinator_dir.to_string_lossy());
    set_dirs(
        request.get().init_segment_dirs(segment_dirs.len() as u32),
        segment_dirs,
    );
    request.send().promise.await?;
    Ok(())
}

pub async fn upgrade_primaries(client: &agent::Client, upgrade: &UpgradeRequest) -> Result<()> {
    let mut request = client.upgrade_primaries_request();
    {
        let mut params = request.get();
        params.set_source_bin_dir(&*upgrade.source_bin_dir.to_string_lossy());
        params.set_target_bin_dir(&*upgrade.target_bin_dir.to_string_lossy());
        params.set_check_only(upgrade.check_only);

        let mut pairs = params.init_pairs(upgrade.pairs.len() as u32);
        for (i, pair) in upgrade.pairs.iter().enumerate() {
            let mut entry = pairs.reborrow().get(i as u32);
            entry.set_old_data_dir(&*pair.old_data_dir.to_string_lossy());
            entry.set_new_data_dir(&*pair.new_data_dir.to_string_lossy());
            entry.set_old_port(pair.old_port);
            entry.set_new_port(pair.new_port);
            entry.set_content(pair.content);
            entry.set_dbid(pair.dbid);
        }
    }
    request.send().promise.await?;
    Ok(())
}

pub(crate) fn read_upgrade_request(
    params: agent::upgrade_primaries_params::Reader<'_>,
) -> capnp::Result<UpgradeRequest> {
    let pairs = params
        .get_pairs()?
        .iter()
        .map(|pair| {
            Ok(DataDirPair {
                old_data_dir: read_path(pair.get_old_data_dir()?)?,
                new_data_dir: read_path(pair.get_new_data_dir()?)?,
                old_port: pair.get_old_port(),
                new_port: pair.get_new_port(),
                content: pair.get_content(),
                dbid: pair.get_dbid(),
            })
        })
        .collect::<capnp::Result<Vec<_>>>()?;

    Ok(UpgradeRequest {
        source_bin_dir: read_path(params.get_source_bin_dir()?)?,
        target_bin_dir: read_path(params.get_target_bin_dir()?)?,
        pairs,
        check_only: params.get_check_only(),
    })
}

pub async fn check_disk_space(client: &agent::Client) -> Result<Vec<FilesystemUsage>> {
    let reply = client.check_disk_space_request().send().promise.await?;
    let usage = reply
        .get()?
        .get_usage()?
        .iter()
        .map(|u| {
            Ok(FilesystemUsage {
                filesystem: u.get_filesystem()?.to_string()?,
                usage_percent: u.get_usage_percent(),
            })
        })
        .collect::<capnp::Result<Vec<_>>>()?;
    Ok(usage)
}

/// Asks the agent for the upgrade status of each `(content, dbid)`.
pub async fn check_conversion_status(
    client: &agent::Client,
    segments: &[(i32, i32)],
) -> Result<Vec<SegmentStatus>> {
    let mut request = client.check_conversion_status_request();
    {
        let mut list = request.get().init_segments(segments.len() as u32);
        for (i, (content, dbid)) in segments.iter().enumerate() {
            let mut entry = list.reborrow().get(i as u32);
            entry.set_content(*content);
            entry.set_dbid(*dbid);
        }
    }

    let reply = request.send().promise.await?;
    let statuses = reply
        .get()?
        .get_statuses()?
        .iter()
        .map(|s| {
            Ok(SegmentStatus {
                content: s.get_content(),
                dbid: s.get_dbid(),
                status: s.get_status()?.into(),
            })
        })
        .collect::<capnp::Result<Vec<_>>>()?;
    Ok(statuses)
}

pub async fn delete_data_directories(client: &agent::Client, dirs: &[PathBuf]) -> Result<()> {
    let mut request = client.delete_data_directories_request();
    set_dirs(request.get().init_datadirs(dirs.len() as u32), dirs);
    request.send().promise.await?;
    Ok(())
}

pub async fn stop_agent(client: &agent::Client) -> Result<()> {
    client.stop_agent_request().send().promise.await?;
    Ok(())
}
