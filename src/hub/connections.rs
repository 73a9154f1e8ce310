// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The hub's pool of agent connections and the fan-out helper every agent step goes through.

use std::{future::Future, rc::Rc, time::Duration};

use {
    futures::future::{FutureExt, LocalBoxFuture},
    log::{debug, error, info, warn},
    tokio::{sync::Mutex, task::JoinHandle},
};

use crate::{
    error::{Error, MultiError, Result},
    gpupgrade_capnp::{self as wire, agent},
};

/// How many times a cached connection is pinged before it is declared not ready.
const READY_ATTEMPTS: usize = 3;
const READY_POLL: Duration = Duration::from_millis(500);

/// Opens a connection to the agent on one host.
pub trait AgentDialer {
    fn dial<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<AgentConnection>>;
}

/// Dials agents over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub port: u16,
    pub timeout: Duration,
}

impl AgentDialer for TcpDialer {
    fn dial<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<AgentConnection>> {
        async move {
            let address = format!("{host}:{}", self.port);
            let connection = tokio::time::timeout(self.timeout, wire::connect::<agent::Client>(&address))
                .await
                .map_err(|_| {
                    Error::Rpc(capnp::Error::disconnected(format!(
                        "timed out after {}ms dialing {address}",
                        self.timeout.as_millis()
                    )))
                })?
                .map_err(|e| Error::Rpc(capnp::Error::disconnected(format!("{address}: {e}"))))?;

            Ok(AgentConnection {
                host: host.to_string(),
                client: connection.client,
                task: Some(connection.task),
            })
        }
        .boxed_local()
    }
}

/// A connection to the agent on `host`.
pub struct AgentConnection {
    pub host: String,
    pub client: agent::Client,
    /// The task driving the connection, if it is a network connection.
    pub task: Option<JoinHandle<std::result::Result<(), capnp::Error>>>,
}

impl AgentConnection {
    /// Whether the connection task is still running. In-process connections are always alive.
    fn is_alive(&self) -> bool {
        self.task.as_ref().map_or(true, |task| !task.is_finished())
    }

    async fn ping(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        matches!(
            tokio::time::timeout(READY_POLL, wire::ping_agent(&self.client)).await,
            Ok(Ok(()))
        )
    }

    fn close(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Lazily dialed, cached connections to every agent.
pub struct AgentPool {
    dialer: Box<dyn AgentDialer>,
    call_timeout: Option<Duration>,
    connections: Mutex<Option<Rc<Vec<AgentConnection>>>>,
}

impl AgentPool {
    pub fn new(dialer: Box<dyn AgentDialer>, call_timeout: Option<Duration>) -> Self {
        AgentPool {
            dialer,
            call_timeout,
            connections: Mutex::new(None),
        }
    }

    /// Returns a ready connection to the agent on each of `hosts`.
    ///
    /// The first call dials every host; a host that cannot be reached fails the call with the
    /// list of every unreachable host. Later calls reuse the cached connections after checking
    /// that each one still answers.
    pub async fn connections(&self, hosts: &[String]) -> Result<Rc<Vec<AgentConnection>>> {
        let mut cached = self.connections.lock().await;

        if let Some(connections) = cached.as_ref() {
            ensure_ready(connections).await?;
            return Ok(Rc::clone(connections));
        }

        let results =
            futures::future::join_all(hosts.iter().map(|host| self.dialer.dial(host))).await;

        let mut connections = Vec::with_capacity(hosts.len());
        let mut unreachable = Vec::new();
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    error!("could not connect to agent on {host}: {e}");
                    unreachable.push(host.clone());
                }
            }
        }

        if !unreachable.is_empty() {
            for connection in &connections {
                connection.close();
            }
            return Err(Error::Unreachable(unreachable));
        }

        info!("connected to {} agent(s)", connections.len());
        let connections = Rc::new(connections);
        *cached = Some(Rc::clone(&connections));
        Ok(connections)
    }

    /// Closes and forgets every cached connection.
    pub async fn close(&self) {
        if let Some(connections) = self.connections.lock().await.take() {
            for connection in connections.iter() {
                debug!("closing connection to agent on {}", connection.host);
                connection.close();
            }
        }
    }

    /// Calls `call` once per `(connection, work)` item in parallel and waits for all of them.
    ///
    /// Results come back in the order of `work`. If any call fails, the error lists every failed
    /// call, each tagged with its host.
    pub async fn fan_out<'a, W, T, F, Fut>(
        &self,
        work: Vec<(&'a AgentConnection, W)>,
        call: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(&'a agent::Client, W) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let hosts: Vec<&str> = work.iter().map(|(c, _)| c.host.as_str()).collect();
        let calls = work.into_iter().map(|(connection, w)| {
            let call = call(&connection.client, w);
            with_deadline(self.call_timeout, call)
        });

        let results = futures::future::join_all(calls).await;

        let mut values = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (host, result) in hosts.into_iter().zip(results) {
            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!("agent call on {host} failed: {e}");
                    errors.push(Error::agent(host, e));
                }
            }
        }

        MultiError::check(errors)?;
        Ok(values)
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        None => call.await,
        Some(deadline) => tokio::time::timeout(deadline, call).await.unwrap_or_else(|_| {
            Err(Error::Rpc(capnp::Error::overloaded(format!(
                "no reply within {}s",
                deadline.as_secs()
            ))))
        }),
    }
}

/// Pings every connection up to three times, half a second apart at most.
async fn ensure_ready(connections: &[AgentConnection]) -> Result<()> {
    let checks = connections.iter().map(|connection| async move {
        for attempt in 1..=READY_ATTEMPTS {
            if connection.ping().await {
                return true;
            }
            debug!(
                "agent on {} not ready (attempt {attempt}/{READY_ATTEMPTS})",
                connection.host
            );
        }
        false
    });

    let ready = futures::future::join_all(checks).await;
    let not_ready: Vec<String> = connections
        .iter()
        .zip(ready)
        .filter(|(_, ready)| !ready)
        .map(|(connection, _)| connection.host.clone())
        .collect();

    if not_ready.is_empty() {
        Ok(())
    } else {
        Err(Error::NotReady(not_ready))
    }
}

/// Pairs each connection with the work for its host, skipping hosts that have none.
pub fn for_hosts<'a, W>(
    connections: &'a [AgentConnection],
    mut work_for: impl FnMut(&str) -> Option<W>,
) -> Vec<(&'a AgentConnection, W)> {
    connections
        .iter()
        .filter_map(|connection| work_for(&connection.host).map(|w| (connection, w)))
        .collect()
}
