// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, io, path::PathBuf};

use crate::{agent::copy::CopyError, cluster::ClusterError};

pub type Result<T> = std::result::Result<T, Error>;

/// Every error the hub and agent can surface.
///
/// The variants group into the kinds operators care about: configuration mistakes, lost
/// connectivity to agents, failing external commands, partial failures of a fan-out, filesystem
/// errors, and broken runtime invariants. Errors bubble up to the step engine unchanged apart from
/// the `Step` wrapper it adds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("could not connect to the agents on the following hosts: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("the connections to the following hosts were not ready: {}", .0.join(","))]
    NotReady(Vec<String>),

    #[error("{0}")]
    Rpc(#[from] capnp::Error),

    #[error("{command} failed with {}{}", exit_description(.code), stderr_suffix(.stderr))]
    Subprocess {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A command run on another host over ssh failed.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Fanout(#[from] MultiError),

    #[error("host {host}: {source}")]
    Agent {
        host: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to {action} primary on host {host} with content {content}: {source}")]
    Segment {
        action: &'static str,
        host: String,
        content: i32,
        #[source]
        source: Box<Error>,
    },

    #[error("{}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error("database: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Internal(String),

    #[error("the request was cancelled before substep \"{0}\" started")]
    Cancelled(&'static str),

    #[error("substep \"{step}\": {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "termination by signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl Error {
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn agent(host: impl Into<String>, source: Error) -> Self {
        Error::Agent {
            host: host.into(),
            source: Box::new(source),
        }
    }

    /// Walks the error chain looking for any error of the given kind. Useful when an error has
    /// been wrapped by context and fan-out layers.
    pub fn any(&self, pred: &dyn Fn(&Error) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Error::Agent { source, .. }
            | Error::Segment { source, .. }
            | Error::Step { source, .. }
            | Error::Context { source, .. } => source.any(pred),
            Error::Fanout(multi) => multi.errors().iter().any(|e| e.any(pred)),
            _ => false,
        }
    }
}

/// A collection of errors from tasks that ran in parallel. Constructed only when at least one
/// task failed.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Returns `Ok(())` if `errors` is empty, otherwise an aggregate error.
    pub fn check(errors: Vec<Error>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Fanout(MultiError { errors }))
        }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => write!(f, "1 error occurred:")?,
            n => write!(f, "{n} errors occurred:")?,
        }
        for e in &self.errors {
            write!(f, "\n\t* {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Adds context to errors as they are propagated.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

/// Attaches the offending path to an `io::Error`.
pub trait PathContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> PathContext<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::filesystem(path, e))
    }
}

/// Flattens an error into the RPC error the remote side will see.
pub fn to_rpc(e: Error) -> capnp::Error {
    match e {
        Error::Rpc(e) => e,
        e => capnp::Error::failed(e.to_string()),
    }
}
