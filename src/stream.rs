// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! stream.rs
//!
//! The multiplexed output stream: every byte a step produces goes to the run's local log file
//! and, for as long as the client is listening, to the client as well.

use std::{
    fs,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
    sync::{Mutex, PoisonError},
};

use log::{info, warn};

use crate::{
    error::{Error, PathContext, Result},
    state::Status,
    step::Substep,
    system::{CommandSpec, ExitPolicy, System},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Stdout,
    Stderr,
}

/// What the hub sends back to a client during a streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Chunk { buffer: Vec<u8>, kind: ChunkKind },
    Status { step: Substep, status: Status },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SendError(pub String);

/// The outbound half of a streaming call.
pub trait MessageSender {
    fn send(&self, message: Message) -> std::result::Result<(), SendError>;
}

struct Inner {
    log: Box<dyn Write>,
    sender: Option<Box<dyn MessageSender>>,
}

/// Fans writes out to a local log and to a client.
///
/// All writes are serialized under one mutex. The local log is the source of truth: an error
/// writing it is returned to the writer. A failed send to the client is logged once, after which
/// the client is dropped and writes only go to the log.
pub struct MultiplexedStream {
    inner: Mutex<Inner>,
}

impl MultiplexedStream {
    pub fn new(log: impl Write + 'static, sender: Option<Box<dyn MessageSender>>) -> Self {
        MultiplexedStream {
            inner: Mutex::new(Inner {
                log: Box::new(log),
                sender,
            }),
        }
    }

    /// Opens (appending) the run log at `path` and writes a header line for this run.
    pub fn open(
        path: &Path,
        title: &str,
        sender: Option<Box<dyn MessageSender>>,
    ) -> Result<Self> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
            .with_path(path)?;

        writeln!(
            file,
            "\n{} {title} in progress.",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )
        .with_path(path)?;

        Ok(Self::new(file, sender))
    }

    pub fn stdout(&self) -> StreamWriter<'_> {
        StreamWriter {
            stream: self,
            kind: ChunkKind::Stdout,
        }
    }

    pub fn stderr(&self) -> StreamWriter<'_> {
        StreamWriter {
            stream: self,
            kind: ChunkKind::Stderr,
        }
    }

    /// Sends a status update to the client. Status updates are not written to the log.
    pub fn send_status(&self, step: Substep, status: Status) {
        let mut inner = self.lock();
        inner.send(Message::Status { step, status });
    }

    /// Whether the client is still receiving messages.
    pub fn is_connected(&self) -> bool {
        self.lock().sender.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_chunk(&self, kind: ChunkKind, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();
        inner.log.write_all(buf)?;
        inner.send(Message::Chunk {
            buffer: buf.to_vec(),
            kind,
        });
        Ok(())
    }

    /// Runs `command` with its stdout and stderr attached to this stream.
    ///
    /// The tail of stderr is kept so that a failing command's error carries its diagnostics.
    pub async fn run_command(
        &self,
        system: &dyn System,
        command: &CommandSpec,
        policy: ExitPolicy,
    ) -> Result<()> {
        info!("running {command}");

        let mut stdout = self.stdout();
        let mut stderr = Capture::new(self.stderr());

        let status = system
            .run(command, &mut stdout, &mut stderr)
            .await
            .map_err(|source| Error::Spawn {
                command: command.get_label().to_string(),
                source,
            })?;

        policy.check(command, status, &stderr.tail)
    }
}

impl Inner {
    fn send(&mut self, message: Message) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.send(message) {
            warn!("halting client stream: {e}");
            self.sender = None;
        }
    }
}

/// One tagged writer endpoint of a `MultiplexedStream`.
pub struct StreamWriter<'a> {
    stream: &'a MultiplexedStream,
    kind: ChunkKind,
}

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write_chunk(self.kind, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.lock().log.flush()
    }
}

const CAPTURE_LIMIT: usize = 16 * 1024;

/// Passes writes through while remembering the last few kilobytes.
pub(crate) struct Capture<W> {
    inner: W,
    pub(crate) tail: Vec<u8>,
}

impl<W: Write> Capture<W> {
    pub(crate) fn new(inner: W) -> Self {
        Capture {
            inner,
            tail: Vec::new(),
        }
    }
}

impl<W: Write> Write for Capture<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.tail.extend_from_slice(&buf[..n]);
        if self.tail.len() > CAPTURE_LIMIT {
            let excess = self.tail.len() - CAPTURE_LIMIT;
            self.tail.drain(..excess);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
