// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! system.rs
//!
//! The filesystem and subprocess operations the hub and agent perform, behind a single trait so
//! that tests can substitute them.

use std::{
    ffi::{OsStr, OsString},
    fmt, fs,
    io::{self, Write},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    process::Stdio,
};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::{debug, warn},
    nix::{errno::Errno, sys::signal::kill, unistd::Pid},
    tokio::io::{AsyncRead, AsyncReadExt},
};

use crate::error::{Error, Result};

/// How the environment of a child process is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Inherit,
    /// Start from an empty environment and set only these variables.
    Only(Vec<(OsString, OsString)>),
}

/// A description of one external command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
    env: Environment,
    current_dir: Option<PathBuf>,
    label: String,
}

impl CommandSpec {
    /// The label defaults to the file name of `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let label = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string_lossy().into_owned());

        CommandSpec {
            program,
            args: Vec::new(),
            env: Environment::Inherit,
            current_dir: None,
            label,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Clears the environment of the child except for the named variables, which keep the value
    /// they have in this process (if any).
    pub fn env_clear_except(mut self, keep: &[&str]) -> Self {
        let vars = keep
            .iter()
            .filter_map(|name| std::env::var_os(name).map(|value| (OsString::from(name), value)))
            .collect();
        self.env = Environment::Only(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Overrides the name this command is known by in logs, errors, and test fakes.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// The outcome of a finished child process. `code` is `None` when the child was killed by a
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        ExitStatus { code: Some(code) }
    }

    pub fn signaled() -> Self {
        ExitStatus { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        ExitStatus {
            code: status.code(),
        }
    }
}

/// How a nonzero exit status is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Anything other than 0 is an error.
    Strict,
    /// Exit status 1 means the tool finished with warnings; the caller continues.
    WarnOnOne,
}

impl ExitPolicy {
    pub fn check(self, command: &CommandSpec, status: ExitStatus, stderr: &[u8]) -> Result<()> {
        match (self, status.code()) {
            (_, Some(0)) => Ok(()),
            (ExitPolicy::WarnOnOne, Some(1)) => {
                warn!(
                    "{} exited with status 1, continuing with warnings",
                    command.get_label()
                );
                Ok(())
            }
            (_, code) => Err(Error::Subprocess {
                command: command.get_label().to_string(),
                code,
                stderr: String::from_utf8_lossy(stderr).into_owned(),
            }),
        }
    }
}

/// The operations the hub and agent perform on their host.
///
/// The filesystem methods default to the real thing, so a test implementation only needs to
/// provide `run` and can override individual operations to inject failures.
pub trait System {
    fn stat(&self, path: &Path) -> io::Result<fs::Metadata> {
        fs::metadata(path)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    /// Whether a process with `pid` exists. One owned by another user (`EPERM`) still exists.
    fn process_exists(&self, pid: i32) -> io::Result<bool> {
        if pid <= 0 {
            return Ok(false);
        }
        // Signal 0 only checks that the process exists.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a file or a whole directory tree. A missing path is not an error.
    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Runs `command` to completion, copying its stdout and stderr into the given writers as the
    /// bytes arrive.
    ///
    /// Dropping the returned future does not kill the child.
    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> LocalBoxFuture<'a, io::Result<ExitStatus>>;
}

/// The real host.
#[derive(Debug, Default)]
pub struct LocalSystem;

impl System for LocalSystem {
    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> LocalBoxFuture<'a, io::Result<ExitStatus>> {
        async move {
            let mut cmd = tokio::process::Command::new(command.program());
            cmd.args(command.get_args())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            if let Environment::Only(vars) = command.environment() {
                cmd.env_clear();
                cmd.envs(vars.iter().map(|(k, v)| (k, v)));
            }
            if let Some(dir) = command.get_current_dir() {
                cmd.current_dir(dir);
            }

            debug!("running {command}");
            let mut child = cmd.spawn()?;

            let (out, err) = futures::join!(
                pump(child.stdout.take(), stdout),
                pump(child.stderr.take(), stderr)
            );

            // Reap the child before reporting a failed copy.
            let status = child.wait().await?;
            out?;
            err?;

            Ok(status.into())
        }
        .boxed_local()
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: &mut dyn Write) -> io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return sink.flush();
        }
        sink.write_all(&buf[..n])?;
    }
}

/// A finished command with everything it printed.
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs `command`, buffering its output.
pub async fn output(system: &dyn System, command: &CommandSpec) -> Result<Output> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let status = system
        .run(command, &mut stdout, &mut stderr)
        .await
        .map_err(|source| Error::Spawn {
            command: command.get_label().to_string(),
            source,
        })?;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Runs `command`, buffering its output, and classifies the exit status with `policy`.
pub async fn run_checked(
    system: &dyn System,
    command: &CommandSpec,
    policy: ExitPolicy,
) -> Result<Output> {
    let out = output(system, command).await?;
    policy.check(command, out.status, &out.stderr)?;
    Ok(out)
}
