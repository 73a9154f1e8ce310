// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The hub: owns the source and target cluster models and the agent connections, and runs the
//! upgrade steps on behalf of the CLI.

pub mod connections;
pub mod execute;
pub mod finalize;
pub mod initialize;
pub mod reconfigure;
pub mod revert;
pub mod server;
pub mod status;
pub mod target;

use std::{
    cell::RefCell,
    fmt,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use {
    clap::Parser,
    futures::future::join_all,
    log::{error, info, warn},
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
};

use crate::{
    cluster::{
        catalog::{Catalog, ConnectOptions, Connector, PostgresConnector},
        check_pair, Cluster, ClusterError,
    },
    commands::{Handle, HandledError, HandledResult},
    config::{self, HubConfig},
    daemon,
    error::{Error, Result, ResultExt},
    gpupgrade_capnp::{self as wire, cli_to_hub},
    state::StateDir,
    step::{self, Step},
    stream::{MessageSender, MultiplexedStream},
    system::{LocalSystem, System},
};

use connections::{AgentConnection, AgentDialer, AgentPool, TcpDialer};

#[derive(Parser, Debug, Default)]
#[command(version, about = "gpupgrade hub: runs upgrade steps on behalf of the CLI")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub state_directory: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Start in the background and return once the hub is listening.
    #[arg(long)]
    pub daemonize: bool,

    #[arg(long, hide = true)]
    pub daemon_child: bool,
}

/// What `Initialize` was asked to upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRequest {
    pub source_bin_dir: PathBuf,
    pub target_bin_dir: PathBuf,
    pub source_port: u16,
}

/// The streaming requests, each with its own step sequence and run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl Run {
    pub fn log_name(self) -> &'static str {
        match self {
            Run::Initialize => "initialize",
            Run::Execute => "execute",
            Run::Finalize => "finalize",
            Run::Revert => "revert",
        }
    }

    pub fn steps(self) -> &'static [Step<Hub>] {
        match self {
            Run::Initialize => initialize::STEPS,
            Run::Execute => execute::STEPS,
            Run::Finalize => finalize::STEPS,
            Run::Revert => revert::STEPS,
        }
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = match self {
            Run::Initialize => "Initialize",
            Run::Execute => "Execute",
            Run::Finalize => "Finalize",
            Run::Revert => "Revert",
        };
        write!(f, "{title}")
    }
}

/// The hub's collaborators. Production uses the real host, database and network; tests substitute
/// each of them.
pub struct Services {
    pub system: Rc<dyn System>,
    pub connector: Rc<dyn Connector>,
    pub dialer: Box<dyn AgentDialer>,
}

pub struct Hub {
    config: HubConfig,
    state: StateDir,
    system: Rc<dyn System>,
    connector: Rc<dyn Connector>,
    agents: AgentPool,
    source: RefCell<Rc<Cluster>>,
    target: RefCell<Rc<Cluster>>,
    request: RefCell<Option<InitializeRequest>>,
    shutdown: Rc<Notify>,
}

/// A missing cluster file means that cluster has not been configured yet.
fn load_or_empty(path: &Path) -> Result<Cluster> {
    match Cluster::load(path) {
        Ok(cluster) => Ok(cluster),
        Err(ClusterError::NotFound(_)) => Ok(Cluster::default()),
        Err(e) => Err(e.into()),
    }
}

impl Hub {
    /// Creates a hub over `state`, picking up whatever cluster configuration a previous hub left
    /// there.
    pub fn new(config: HubConfig, state: StateDir, services: Services) -> Result<Self> {
        let source = load_or_empty(&state.source_cluster())?;
        let target = load_or_empty(&state.target_cluster())?;
        check_pair(&source, &target)?;

        Ok(Hub {
            agents: AgentPool::new(services.dialer, config.agent_timeout()),
            config,
            state,
            system: services.system,
            connector: services.connector,
            source: RefCell::new(Rc::new(source)),
            target: RefCell::new(Rc::new(target)),
            request: RefCell::new(None),
            shutdown: Rc::new(Notify::new()),
        })
    }

    pub fn state(&self) -> &StateDir {
        &self.state
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn source(&self) -> Rc<Cluster> {
        Rc::clone(&self.source.borrow())
    }

    pub fn target(&self) -> Rc<Cluster> {
        Rc::clone(&self.target.borrow())
    }

    /// Persists `source`, then makes it the hub's source cluster.
    pub fn set_source(&self, source: Cluster) -> Result<()> {
        source.commit(&self.state.source_cluster())?;
        *self.source.borrow_mut() = Rc::new(source);
        Ok(())
    }

    /// Persists `target`, then makes it the hub's target cluster. The target must still pair up
    /// with the source.
    pub fn set_target(&self, target: Cluster) -> Result<()> {
        check_pair(&self.source(), &target)?;
        target.commit(&self.state.target_cluster())?;
        *self.target.borrow_mut() = Rc::new(target);
        Ok(())
    }

    pub fn set_request(&self, request: InitializeRequest) {
        *self.request.borrow_mut() = Some(request);
    }

    pub(crate) fn request(&self) -> Result<InitializeRequest> {
        self.request.borrow().clone().ok_or_else(|| {
            Error::Configuration(
                "initialize must be given the source and target installations".to_string(),
            )
        })
    }

    pub fn shutdown_signal(&self) -> Rc<Notify> {
        Rc::clone(&self.shutdown)
    }

    /// A ready connection to the agent on every source host.
    pub async fn agents(&self) -> Result<Rc<Vec<AgentConnection>>> {
        self.agents.connections(&self.source().hosts()).await
    }

    pub(crate) async fn connect(&self, options: ConnectOptions, which: &str) -> Result<Box<dyn Catalog>> {
        self.connector
            .connect(options)
            .await
            .with_context(|| format!("could not connect to the {which} cluster on port {}", options.port))
    }

    /// Opens the run log for `run`, streaming to `sender` as well when there is one.
    pub fn open_stream(
        &self,
        run: Run,
        sender: Option<Box<dyn MessageSender>>,
    ) -> Result<MultiplexedStream> {
        MultiplexedStream::open(&self.state.log(run.log_name()), &run.to_string(), sender)
    }

    /// Runs every step of `run` in order, stopping at the first failure or once `cancel` fires.
    pub async fn run(&self, run: Run, stream: &MultiplexedStream, cancel: &CancellationToken) -> Result<()> {
        info!("{run} started");
        let result = step::run_steps(self, &self.state, stream, run.steps(), cancel).await;
        match &result {
            Ok(()) => info!("{run} completed"),
            Err(e) => error!("{run} failed: {e}"),
        }
        result
    }

    /// Sends `StopAgent` to every agent, then forgets the connections. Failures are only logged:
    /// an agent that cannot be reached is not running.
    pub async fn stop_agents(&self) {
        match self.agents().await {
            Ok(agents) => {
                let stops = agents.iter().map(|agent| async move {
                    if let Err(e) = wire::stop_agent(&agent.client).await {
                        warn!("could not stop agent on {}: {e}", agent.host);
                    }
                });
                join_all(stops).await;
            }
            Err(e) => warn!("not stopping agents: {e}"),
        }
        self.agents.close().await;
    }

    pub fn set_config(&self, name: &str, value: &str) -> Result<()> {
        match name {
            "source-bindir" => {
                let mut source = (*self.source()).clone();
                source.bin_dir = PathBuf::from(value);
                self.set_source(source)
            }
            "target-bindir" => {
                let mut target = (*self.target()).clone();
                target.bin_dir = PathBuf::from(value);
                self.set_target(target)
            }
            _ => Err(unknown_key(name)),
        }
    }

    pub fn get_config(&self, name: &str) -> Result<String> {
        let bin_dir = match name {
            "source-bindir" => self.source().bin_dir.clone(),
            "target-bindir" => self.target().bin_dir.clone(),
            _ => return Err(unknown_key(name)),
        };
        Ok(bin_dir.to_string_lossy().into_owned())
    }
}

fn unknown_key(name: &str) -> Error {
    Error::Configuration(format!(
        "unknown configuration key '{name}' (expected source-bindir or target-bindir)"
    ))
}

/// Writes a line of hub commentary into the run log.
pub(crate) fn report(stream: &MultiplexedStream, line: &str) -> Result<()> {
    writeln!(stream.stdout(), "{line}")
        .map_err(|e| Error::Internal(format!("could not write to the run log: {e}")))
}

/// Main entrypoint for the hub process.
pub fn hub_main(args: Cli) -> HandledResult<()> {
    if args.daemonize {
        let code = daemon::daemonize()
            .handle_err(|e| eprintln!("Could not start hub in the background: {e}"))?;
        return match code {
            0 => Ok(()),
            code => Err(HandledError::new(code)),
        };
    }

    let config: HubConfig = config::load(args.config.as_deref()).handle_err(|e| eprintln!("{e}"))?;
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
        .then(|| state.root().join("gpupgrade_hub.log"));
    crate::init_logging("info", log_file.as_deref());

    let services = Services {
        system: Rc::new(LocalSystem),
        connector: Rc::new(PostgresConnector::default()),
        dialer: Box::new(TcpDialer {
            port: config.agent_port(),
            timeout: config.dial_timeout(),
        }),
    };
    let hub = Hub::new(config, state, services).handle_err(|e| eprintln!("{e}"))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch hub runtime: {e}"))?;

    rt.block_on(tokio::task::LocalSet::new().run_until(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .handle_err(|e| eprintln!("Could not listen on port {port}: {e}"))?;

        info!("hub listening on port {port}");
        if args.daemon_child {
            daemon::announce_and_detach("Hub", port)
                .handle_err(|e| error!("could not detach from parent: {e}"))?;
        }

        let hub = Rc::new(hub);
        let shutdown = hub.shutdown_signal();
        let client: cli_to_hub::Client = capnp_rpc::new_client(server::HubServer::new(Rc::clone(&hub)));

        let served = wire::serve(listener, client.client, shutdown)
            .await
            .handle_err(|e| error!("hub server failed: {e}"));
        hub.agents.close().await;
        served
    }))
}
