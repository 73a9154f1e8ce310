// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Support for the unit and integration tests: a private directory per test, a fake host whose
//! external commands are table-driven, a fake Greenplum catalog, agents served in-process, and a
//! client that records everything the hub streams to it.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    future::Future,
    io::{self, Write},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    rc::Rc,
};

use {
    futures::future::{self, FutureExt, LocalBoxFuture},
    tokio::sync::Notify,
};

use crate::{
    agent::{self, AgentServer},
    cluster::{
        catalog::{check_contents, Catalog, ConnectOptions, Connector},
        Role, Segment,
    },
    config::HubConfig,
    error::{Error, Result},
    hub::{
        connections::{AgentConnection, AgentDialer},
        reconfigure, Hub, InitializeRequest, Run, Services,
    },
    state::{StateDir, Status},
    step::Substep,
    stream::{Message, MessageSender, MultiplexedStream, SendError},
    system::{CommandSpec, ExitStatus, LocalSystem, System},
};

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join(path)
}

/// The private working directory of the test named `test_id`, emptied of anything a previous run
/// left behind.
pub fn test_dir(test_id: &str) -> PathBuf {
    let dir = test_path(&format!("test_output/{test_id}"));
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => panic!("Could not clean up test directory: {e}"),
    };
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Runs `f` on a current-thread runtime inside a `LocalSet`, the way the binaries run.
pub fn block_on<F: Future>(f: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(tokio::task::LocalSet::new().run_until(f))
}

/// Copies the tree at `from` to `to`, creating `to` and any missing parents.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

/// Stands in for one external program: given the command and its output pipes, returns the exit
/// status.
pub type Handler = dyn Fn(&CommandSpec, &mut dyn Write, &mut dyn Write) -> io::Result<i32>;

/// A host whose filesystem is real but whose external commands are not.
///
/// Commands are dispatched by label to the registered handler; a command with no handler
/// succeeds without output. Every command is recorded.
#[derive(Default)]
pub struct FakeSystem {
    handlers: RefCell<HashMap<String, Rc<Handler>>>,
    calls: RefCell<Vec<CommandSpec>>,
    failing_renames: RefCell<HashSet<PathBuf>>,
    failing_mkdirs: RefCell<HashMap<PathBuf, String>>,
    processes: RefCell<HashMap<i32, bool>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, label: &str, handler: F)
    where
        F: Fn(&CommandSpec, &mut dyn Write, &mut dyn Write) -> io::Result<i32> + 'static,
    {
        self.handlers
            .borrow_mut()
            .insert(label.to_string(), Rc::new(handler));
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn calls_labelled(&self, label: &str) -> Vec<CommandSpec> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.get_label() == label)
            .cloned()
            .collect()
    }

    /// Makes the next rename of `from` fail, as if the host died before it happened.
    pub fn fail_next_rename(&self, from: impl Into<PathBuf>) {
        self.failing_renames.borrow_mut().insert(from.into());
    }

    /// Overrides whether `pid` is reported as a live process.
    pub fn set_process_exists(&self, pid: i32, exists: bool) {
        self.processes.borrow_mut().insert(pid, exists);
    }

    /// Makes creating `path` fail with `message`.
    pub fn fail_mkdir(&self, path: impl Into<PathBuf>, message: &str) {
        self.failing_mkdirs
            .borrow_mut()
            .insert(path.into(), message.to_string());
    }
}

impl System for FakeSystem {
    fn process_exists(&self, pid: i32) -> io::Result<bool> {
        match self.processes.borrow().get(&pid) {
            Some(exists) => Ok(*exists),
            None => LocalSystem.process_exists(pid),
        }
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        if let Some(message) = self.failing_mkdirs.borrow().get(path) {
            return Err(io::Error::other(message.clone()));
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.failing_renames.borrow_mut().remove(from) {
            return Err(io::Error::other(format!(
                "injected failure renaming {}",
                from.display()
            )));
        }
        fs::rename(from, to)
    }

    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> LocalBoxFuture<'a, io::Result<ExitStatus>> {
        self.calls.borrow_mut().push(command.clone());
        let handler = self.handlers.borrow().get(command.get_label()).cloned();

        let result = match handler {
            Some(handler) => handler(command, stdout, stderr).map(ExitStatus::from_code),
            None => Ok(ExitStatus::from_code(0)),
        };
        future::ready(result).boxed_local()
    }
}

/// The shell script of a command built by `lifecycle::greenplum_command`, split into words.
fn script_words(command: &CommandSpec) -> Vec<String> {
    command
        .args_lossy()
        .get(1)
        .map(|script| script.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn flag_value(words: &[String], flag: &str) -> Option<PathBuf> {
    words
        .iter()
        .position(|w| w == flag)
        .and_then(|i| words.get(i + 1))
        .map(PathBuf::from)
}

/// Marks the postmaster in `datadir` as running.
pub fn write_pidfile(datadir: &Path) -> io::Result<()> {
    fs::write(
        datadir.join("postmaster.pid"),
        format!("{}\n{}\n", std::process::id(), datadir.display()),
    )
}

/// Creates a data directory as `gpinitsystem` would, listening on `port`.
pub fn create_datadir(datadir: &Path, port: u16) -> io::Result<()> {
    fs::create_dir_all(datadir)?;
    fs::write(
        datadir.join(reconfigure::CONF),
        format!("listen_addresses='*'\nport={port}\t\t\t\t# sets the database listener port\n"),
    )?;
    for name in ["internal.auto.conf", "pg_hba.conf", "postmaster.opts", "PG_VERSION"] {
        fs::write(datadir.join(name), format!("{name} of {}\n", datadir.display()))?;
    }
    Ok(())
}

/// Reads the segments out of a generated `gpinitsystem` configuration.
pub fn parse_gpinitsystem_config(contents: &str, version: &str) -> io::Result<FakeDatabase> {
    let bad = |line: &str| io::Error::new(io::ErrorKind::InvalidData, format!("bad line {line}"));

    let mut segments = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        let declaration = line.strip_prefix("QD_PRIMARY_ARRAY=").unwrap_or(line);
        if !declaration.contains('~') {
            continue;
        }

        let fields: Vec<&str> = declaration.split('~').collect();
        let [host, port, datadir, dbid, content] = fields[..] else {
            return Err(bad(line));
        };
        segments.push(Segment {
            dbid: dbid.parse().map_err(|_| bad(line))?,
            content: content.parse().map_err(|_| bad(line))?,
            role: Role::Primary,
            port: port.parse().map_err(|_| bad(line))?,
            host: host.to_string(),
            datadir: PathBuf::from(datadir),
        });
    }

    let coordinator = segments
        .iter()
        .find(|s| s.is_coordinator())
        .map(|s| s.datadir.clone())
        .ok_or_else(|| bad("QD_PRIMARY_ARRAY"))?;
    Ok(FakeDatabase::new(coordinator, segments, version))
}

impl FakeSystem {
    /// Registers `gpstart`, `gpstop` and `gpinitsystem` handlers that maintain real data
    /// directories and pidfiles, and register created clusters with `connector`.
    pub fn install_greenplum(&self, connector: &Rc<FakeConnector>, target_version: &str) {
        self.on("gpstart", |cmd, out, _err| {
            let words = script_words(cmd);
            let datadir = flag_value(&words, "-d").ok_or_else(|| io::Error::other("no -d"))?;
            write_pidfile(&datadir)?;
            writeln!(out, "gpstart:-Database successfully started")?;
            Ok(0)
        });

        self.on("gpstop", |cmd, out, _err| {
            let words = script_words(cmd);
            let datadir = flag_value(&words, "-d").ok_or_else(|| io::Error::other("no -d"))?;
            fs::remove_file(datadir.join("postmaster.pid"))?;
            writeln!(out, "gpstop:-Database successfully shutdown")?;
            Ok(0)
        });

        let connector = Rc::clone(connector);
        let version = target_version.to_string();
        self.on("gpinitsystem", move |cmd, out, err| {
            let words = script_words(cmd);
            let config = flag_value(&words, "-I").ok_or_else(|| io::Error::other("no -I"))?;
            let database = parse_gpinitsystem_config(&fs::read_to_string(config)?, &version)?;

            for segment in &database.segments {
                if segment.datadir.exists() {
                    writeln!(err, "gpinitsystem:-{} already exists", segment.datadir.display())?;
                    return Ok(2);
                }
                create_datadir(&segment.datadir, segment.port)?;
            }
            write_pidfile(&database.coordinator_datadir)?;

            connector.add(database);
            writeln!(out, "gpinitsystem:-Greenplum Database instance successfully created")?;
            Ok(0)
        });

        self.on("rsync", |cmd, out, _err| {
            let args = cmd.args_lossy();
            let (Some(from), Some(to)) = (args.iter().rev().nth(1), args.last()) else {
                return Ok(1);
            };
            let to = to.split_once(':').map_or(to.as_str(), |(_, path)| path);
            let _ = fs::remove_dir_all(to);
            copy_tree(Path::new(from.trim_end_matches('/')), Path::new(to))?;
            writeln!(out, "Number of files transferred: 1")?;
            Ok(0)
        });

        self.on("cp", |cmd, _out, _err| {
            let args = cmd.args_lossy();
            copy_tree(Path::new(&args[1]), Path::new(&args[2]))?;
            Ok(0)
        });
    }
}

/// An in-memory cluster catalog. It accepts connections on the port its coordinator's
/// `postgresql.conf` names, while its `postmaster.pid` exists.
#[derive(Debug, Clone)]
pub struct FakeDatabase {
    pub coordinator_datadir: PathBuf,
    pub segments: Vec<Segment>,
    pub settings: HashMap<String, String>,
    pub version: String,
}

impl FakeDatabase {
    pub fn new(coordinator_datadir: PathBuf, segments: Vec<Segment>, version: &str) -> Self {
        let settings = HashMap::from([
            ("checkpoint_segments".to_string(), "8".to_string()),
            ("server_encoding".to_string(), "UTF8".to_string()),
        ]);
        FakeDatabase {
            coordinator_datadir,
            segments,
            settings,
            version: version.to_string(),
        }
    }

    fn listening_port(&self) -> Option<u16> {
        if !self.coordinator_datadir.join("postmaster.pid").exists() {
            return None;
        }
        reconfigure::configured_port(&self.coordinator_datadir)
            .ok()
            .flatten()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    databases: RefCell<Vec<Rc<RefCell<FakeDatabase>>>>,
    connections: RefCell<Vec<ConnectOptions>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, database: FakeDatabase) -> Rc<RefCell<FakeDatabase>> {
        let database = Rc::new(RefCell::new(database));
        self.databases.borrow_mut().push(Rc::clone(&database));
        database
    }

    /// The database whose coordinator lives in `datadir`.
    pub fn database(&self, datadir: &Path) -> Option<Rc<RefCell<FakeDatabase>>> {
        self.databases
            .borrow()
            .iter()
            .find(|db| db.borrow().coordinator_datadir == datadir)
            .cloned()
    }

    pub fn connections(&self) -> Vec<ConnectOptions> {
        self.connections.borrow().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, options: ConnectOptions) -> LocalBoxFuture<'_, Result<Box<dyn Catalog>>> {
        self.connections.borrow_mut().push(options);

        let found = self
            .databases
            .borrow()
            .iter()
            .find(|db| db.borrow().listening_port() == Some(options.port))
            .cloned();

        let result = match found {
            Some(database) => Ok(Box::new(FakeCatalog {
                database,
                utility: options.utility,
            }) as Box<dyn Catalog>),
            None => Err(Error::Internal(format!(
                "connection to port {} refused",
                options.port
            ))),
        };
        future::ready(result).boxed_local()
    }
}

struct FakeCatalog {
    database: Rc<RefCell<FakeDatabase>>,
    utility: bool,
}

impl Catalog for FakeCatalog {
    fn segments(&mut self) -> LocalBoxFuture<'_, Result<Vec<Segment>>> {
        let mut segments = self.database.borrow().segments.clone();
        segments.sort_by_key(|s| s.content);
        future::ready(Ok(segments)).boxed_local()
    }

    fn setting<'a>(&'a mut self, name: &'a str) -> LocalBoxFuture<'a, Result<String>> {
        let value = self
            .database
            .borrow()
            .settings
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unrecognized configuration parameter {name}")));
        future::ready(value).boxed_local()
    }

    fn version(&mut self) -> LocalBoxFuture<'_, Result<String>> {
        future::ready(Ok(self.database.borrow().version.clone())).boxed_local()
    }

    fn set_segment_ports<'a>(
        &'a mut self,
        ports: &'a [(i32, u16)],
    ) -> LocalBoxFuture<'a, Result<()>> {
        let result = (|| {
            if !self.utility {
                return Err(Error::Internal(
                    "permission denied: system catalog modifications are not allowed".to_string(),
                ));
            }

            let mut database = self.database.borrow_mut();
            let contents: BTreeSet<i32> = database.segments.iter().map(|s| s.content).collect();
            check_contents(&contents, ports)?;

            for (content, port) in ports {
                if let Some(segment) = database.segments.iter_mut().find(|s| s.content == *content) {
                    segment.port = *port;
                }
            }
            Ok(())
        })();
        future::ready(result).boxed_local()
    }
}

pub const SOURCE_BANNER: &str =
    "PostgreSQL 9.4.26 (Greenplum Database 6.20.3 build commit:8f2a5bfc) on x86_64-unknown-linux-gnu";

pub const TARGET_GP_VERSION: &str = "postgres (Greenplum Database) 7.1.0 build commit:e7c2b1f4";

/// Agents served in-process, one per host, all sharing one fake system unless a host is given
/// its own.
pub struct LocalAgents {
    system: Rc<dyn System>,
    host_systems: HashMap<String, Rc<dyn System>>,
    state_root: PathBuf,
    unreachable: HashSet<String>,
    dials: Rc<Cell<usize>>,
}

impl LocalAgents {
    pub fn new(system: Rc<dyn System>, state_root: impl Into<PathBuf>) -> Self {
        LocalAgents {
            system,
            host_systems: HashMap::new(),
            state_root: state_root.into(),
            unreachable: HashSet::new(),
            dials: Rc::new(Cell::new(0)),
        }
    }

    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    pub fn with_system(mut self, host: &str, system: Rc<dyn System>) -> Self {
        self.host_systems.insert(host.to_string(), system);
        self
    }

    /// Counts dial attempts.
    pub fn dial_counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.dials)
    }

    /// Where the agent on `host` keeps its state.
    pub fn state(state_root: &Path, host: &str) -> StateDir {
        StateDir::new(state_root.join(host))
    }
}

impl AgentDialer for LocalAgents {
    fn dial<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<AgentConnection>> {
        self.dials.set(self.dials.get() + 1);

        let result = if self.unreachable.contains(host) {
            Err(Error::Rpc(capnp::Error::disconnected(format!(
                "{host}: connection refused"
            ))))
        } else {
            let system = self
                .host_systems
                .get(host)
                .unwrap_or(&self.system)
                .clone();
            let server = AgentServer::new(
                system,
                Self::state(&self.state_root, host),
                host.to_string(),
                Rc::new(Notify::new()),
            );
            Ok(AgentConnection {
                host: host.to_string(),
                client: agent::new_client(server),
                task: None,
            })
        };
        future::ready(result).boxed_local()
    }
}

/// A client that records every message and can be told to stop listening.
#[derive(Clone, Default)]
pub struct RecordingSender {
    messages: Rc<RefCell<Vec<Message>>>,
    closed: Rc<Cell<bool>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    /// Every status message, in order.
    pub fn statuses(&self) -> Vec<(Substep, Status)> {
        self.messages
            .borrow()
            .iter()
            .filter_map(|m| match m {
                Message::Status { step, status } => Some((*step, *status)),
                Message::Chunk { .. } => None,
            })
            .collect()
    }

    pub fn close(&self) {
        self.closed.set(true);
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, message: Message) -> std::result::Result<(), SendError> {
        if self.closed.get() {
            return Err(SendError("the client stopped listening".to_string()));
        }
        self.messages.borrow_mut().push(message);
        Ok(())
    }
}

/// One segment of a fake source cluster: `(dbid, content, host, port)`.
pub type Layout<'a> = (i32, i32, &'a str, u16);

/// Everything an end-to-end hub test needs: a running fake source cluster, the fakes behind the
/// hub, and the hub itself.
pub struct TestEnvironment {
    pub root: PathBuf,
    pub system: Rc<FakeSystem>,
    pub connector: Rc<FakeConnector>,
    pub source_bin_dir: PathBuf,
    pub target_bin_dir: PathBuf,
    pub source_port: u16,
    pub agent_state: PathBuf,
}

impl TestEnvironment {
    /// Creates the source cluster described by `layout` with its data directories under
    /// `<root>/d-<host>/<content>`, starts it, and installs the Greenplum utilities.
    pub fn new(test_id: &str, layout: &[Layout<'_>]) -> Self {
        let root = test_dir(test_id);
        let system = Rc::new(FakeSystem::new());
        let connector = Rc::new(FakeConnector::new());

        let segments: Vec<Segment> = layout
            .iter()
            .map(|(dbid, content, host, port)| Segment {
                dbid: *dbid,
                content: *content,
                role: Role::Primary,
                port: *port,
                host: host.to_string(),
                datadir: root.join(format!("d-{host}")).join(content.to_string()),
            })
            .collect();

        for segment in &segments {
            create_datadir(&segment.datadir, segment.port).unwrap();
        }
        let coordinator = segments
            .iter()
            .find(|s| s.is_coordinator())
            .expect("the layout needs a coordinator");
        write_pidfile(&coordinator.datadir).unwrap();
        let source_port = coordinator.port;

        connector.add(FakeDatabase::new(
            coordinator.datadir.clone(),
            segments.clone(),
            SOURCE_BANNER,
        ));
        system.install_greenplum(&connector, TARGET_GP_VERSION);
        system.on("postgres", |_cmd, out, _err| {
            writeln!(out, "{TARGET_GP_VERSION}")?;
            Ok(0)
        });

        TestEnvironment {
            agent_state: root.join("agent-state"),
            source_bin_dir: root.join("gpdb6/bin"),
            target_bin_dir: root.join("gpdb7/bin"),
            source_port,
            system,
            connector,
            root,
        }
    }

    pub fn state(&self) -> StateDir {
        StateDir::new(self.root.join("state"))
    }

    pub fn config(&self) -> HubConfig {
        HubConfig {
            state_directory: Some(self.state().root().to_path_buf()),
            agent_state_directory: Some(self.agent_state.clone()),
            ..HubConfig::default()
        }
    }

    /// Agents for every host, all backed by this environment's fake system.
    pub fn agents(&self) -> LocalAgents {
        LocalAgents::new(self.system.clone(), self.agent_state.clone())
    }

    /// A hub over this environment's state directory, dialing `agents`.
    pub fn hub(&self, agents: LocalAgents) -> Hub {
        let state = self.state();
        state.create().unwrap();
        let services = Services {
            system: self.system.clone(),
            connector: self.connector.clone(),
            dialer: Box::new(agents),
        };
        let hub = Hub::new(self.config(), state, services).unwrap();
        hub.set_request(InitializeRequest {
            source_bin_dir: self.source_bin_dir.clone(),
            target_bin_dir: self.target_bin_dir.clone(),
            source_port: self.source_port,
        });
        hub
    }

    /// The data directory of source content `content` on `host`.
    pub fn source_datadir(&self, host: &str, content: i32) -> PathBuf {
        self.root.join(format!("d-{host}")).join(content.to_string())
    }

    /// The data directory the target gets for `content` on `host`.
    pub fn target_datadir(&self, host: &str, content: i32) -> PathBuf {
        self.root
            .join(format!("d-{host}_upgrade"))
            .join(content.to_string())
    }
}

/// Runs every step of `run` with a fresh token, returning the result and what the client saw.
pub async fn run_recorded(hub: &Hub, run: Run) -> (Result<()>, RecordingSender) {
    let sender = RecordingSender::new();
    let stream = hub
        .open_stream(run, Some(Box::new(sender.clone())))
        .unwrap();
    let result = hub
        .run(run, &stream, &tokio_util::sync::CancellationToken::new())
        .await;
    (result, sender)
}

/// A stream that only writes to `log`, for tests that call step functions directly.
pub fn log_stream(log: &Path) -> MultiplexedStream {
    MultiplexedStream::open(log, "Test", None).unwrap()
}

/// The sentinel files in the state directory of `step`, sorted.
pub fn step_sentinels(state: &StateDir, step: Substep) -> Vec<String> {
    let dir = state.step(step.name()).path().to_path_buf();
    let mut names: Vec<String> = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
