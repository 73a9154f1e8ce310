// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The per-host agent. It owns nothing but its own state directory and does exactly what the hub
//! asks, one RPC at a time per request.

pub mod copy;
pub mod dirs;
pub mod disk;
pub mod status;
pub mod upgrade;

use std::{path::PathBuf, rc::Rc, time::Duration};

use {
    capnp::capability::Promise,
    capnp_rpc::pry,
    clap::Parser,
    log::{error, info},
    tokio::sync::Notify,
};

use crate::{
    commands::{Handle, HandledError, HandledResult},
    config::{self, AgentConfig},
    daemon,
    error::to_rpc,
    gpupgrade_capnp::{self as wire, agent},
    state::StateDir,
    system::{LocalSystem, System},
};

#[derive(Parser, Debug, Default)]
#[command(version, about = "gpupgrade agent: runs upgrade work on one segment host")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub state_directory: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Start in the background and return once the agent is listening.
    #[arg(long)]
    pub daemonize: bool,

    #[arg(long, hide = true)]
    pub daemon_child: bool,
}

/// How long `stopAgent` waits before shutting down, so its reply reaches the hub.
const STOP_DELAY: Duration = Duration::from_millis(100);

pub struct AgentServer {
    system: Rc<dyn System>,
    state: StateDir,
    host: String,
    shutdown: Rc<Notify>,
}

impl AgentServer {
    pub fn new(system: Rc<dyn System>, state: StateDir, host: String, shutdown: Rc<Notify>) -> Self {
        AgentServer {
            system,
            state,
            host,
            shutdown,
        }
    }
}

/// An agent served in-process, for the hub's tests and for `agent_main`.
pub fn new_client(server: AgentServer) -> agent::Client {
    capnp_rpc::new_client(server)
}

impl agent::Server for AgentServer {
    fn ping(&mut self, _: agent::PingParams, _: agent::PingResults) -> Promise<(), capnp::Error> {
        Promise::ok(())
    }

    fn create_segment_data_directories(
        &mut self,
        params: agent::CreateSegmentDataDirectoriesParams,
        _: agent::CreateSegmentDataDirectoriesResults,
    ) -> Promise<(), capnp::Error> {
        let dirs = pry!(wire::read_dirs(pry!(pry!(params.get()).get_datadirs())));
        info!("creating {} segment data directories", dirs.len());

        wire::promise(dirs::create_segment_data_directories(&*self.system, &dirs))
    }

    fn copy_coordinator_data_directory(
        &mut self,
        params: agent::CopyCoordinatorDataDirectoryParams,
        _: agent::CopyCoordinatorDataDirectoryResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let coordinator_dir = pry!(wire::read_path(pry!(params.get_coordinator_dir())));
        let segment_dirs = pry!(wire::read_dirs(pry!(params.get_segment_dirs())));
        let system = Rc::clone(&self.system);

        Promise::from_future(async move {
            copy::copy_coordinator_data_directory(&*system, &coordinator_dir, &segment_dirs)
                .await
                .map_err(|e| to_rpc(e.into()))
        })
    }

    fn upgrade_primaries(
        &mut self,
        params: agent::UpgradePrimariesParams,
        _: agent::UpgradePrimariesResults,
    ) -> Promise<(), capnp::Error> {
        let request = pry!(wire::read_upgrade_request(pry!(params.get())));
        let system = Rc::clone(&self.system);
        let state = self.state.clone();
        let host = self.host.clone();

        Promise::from_future(async move {
            upgrade::upgrade_primaries(&*system, &state, &host, &request)
                .await
                .map_err(to_rpc)
        })
    }

    fn check_disk_space(
        &mut self,
        _: agent::CheckDiskSpaceParams,
        mut results: agent::CheckDiskSpaceResults,
    ) -> Promise<(), capnp::Error> {
        let usage = pry!(disk::check_disk_space().map_err(to_rpc));

        let mut list = results.get().init_usage(usage.len() as u32);
        for (i, u) in usage.iter().enumerate() {
            let mut entry = list.reborrow().get(i as u32);
            entry.set_filesystem(&*u.filesystem);
            entry.set_usage_percent(u.usage_percent);
        }
        Promise::ok(())
    }

    fn check_conversion_status(
        &mut self,
        params: agent::CheckConversionStatusParams,
        mut results: agent::CheckConversionStatusResults,
    ) -> Promise<(), capnp::Error> {
        let segments: Vec<(i32, i32)> = pry!(pry!(params.get()).get_segments())
            .iter()
            .map(|s| (s.get_content(), s.get_dbid()))
            .collect();

        let statuses = status::check_conversion_status(&self.state, &segments);

        let mut list = results.get().init_statuses(statuses.len() as u32);
        for (i, s) in statuses.iter().enumerate() {
            let mut entry = list.reborrow().get(i as u32);
            entry.set_content(s.content);
            entry.set_dbid(s.dbid);
            entry.set_status(s.status.into());
        }
        Promise::ok(())
    }

    fn delete_data_directories(
        &mut self,
        params: agent::DeleteDataDirectoriesParams,
        _: agent::DeleteDataDirectoriesResults,
    ) -> Promise<(), capnp::Error> {
        let dirs = pry!(wire::read_dirs(pry!(pry!(params.get()).get_datadirs())));
        info!("deleting {} data directories", dirs.len());

        wire::promise(dirs::delete_data_directories(&*self.system, &dirs))
    }

    fn stop_agent(
        &mut self,
        _: agent::StopAgentParams,
        _: agent::StopAgentResults,
    ) -> Promise<(), capnp::Error> {
        info!("received stop request");
        let shutdown = Rc::clone(&self.shutdown);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(STOP_DELAY).await;
            shutdown.notify_one();
        });
        Promise::ok(())
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Main entrypoint for the agent process.
pub fn agent_main(args: Cli) -> HandledResult<()> {
    if args.daemonize {
        let code = daemon::daemonize()
            .handle_err(|e| eprintln!("Could not start agent in the background: {e}"))?;
        return match code {
            0 => Ok(()),
            code => Err(HandledError::new(code)),
        };
    }

    let config: AgentConfig = config::load(args.config.as_deref())
        .handle_err(|e| eprintln!("{e}"))?;
    let port = args.port.unwrap_or_else(|| config.port());
    let state = StateDir::new(
        args.state_directory
            .clone()
            .unwrap_or_else(|| config.state_directory()),
    );
    state.create().handle_err(|e| {
        eprintln!(
            "Could not create state directory {}: {e}",
            state.root().display()
        )
    })?;

    let log_file = args
        .daemon_child
        .then(|| state.root().join("gpupgrade_agent.log"));
    crate::init_logging("info", log_file.as_deref());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch agent runtime: {e}"))?;

    rt.block_on(tokio::task::LocalSet::new().run_until(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .handle_err(|e| eprintln!("Could not listen on port {port}: {e}"))?;

        info!("agent listening on port {port}");
        if args.daemon_child {
            daemon::announce_and_detach("Agent", port)
                .handle_err(|e| error!("could not detach from parent: {e}"))?;
        }

        let shutdown = Rc::new(Notify::new());
        let server = AgentServer::new(
            Rc::new(LocalSystem),
            state,
            hostname(),
            Rc::clone(&shutdown),
        );

        wire::serve(listener, new_client(server).client, shutdown)
            .await
            .handle_err(|e| error!("agent server failed: {e}"))
    }))
}
