// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! server.rs
//!
//! The CLI-facing RPC interface of the hub.
//!
//! A streaming request runs its steps in a local task that owns the run's multiplexed stream.
//! Messages from the stream go through an unbounded channel to a forwarder task, which calls the
//! CLI's `MessageSink` one message at a time so they arrive in order. The request's own promise
//! resolves once the steps and the forwarder are done. If the CLI goes away first, the promise
//! is dropped, which cancels the run before its next step starts.

use std::{rc::Rc, time::Duration};

use {
    capnp::capability::Promise,
    capnp_rpc::pry,
    log::{info, warn},
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::to_rpc,
    gpupgrade_capnp::{self as wire, cli_to_hub, message_sink},
    hub::{Hub, InitializeRequest, Run},
    stream::{Message, MessageSender, SendError},
};

/// How long `stopServices` waits before shutting the hub down, so its reply reaches the CLI.
const STOP_DELAY: Duration = Duration::from_millis(100);

/// Queues messages for the forwarder.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSender for ChannelSender {
    fn send(&self, message: Message) -> Result<(), SendError> {
        self.tx
            .send(message)
            .map_err(|_| SendError("the client is no longer receiving messages".to_string()))
    }
}

async fn deliver(sink: &message_sink::Client, message: Message) -> Result<(), capnp::Error> {
    match message {
        Message::Chunk { buffer, kind } => {
            let mut request = sink.chunk_request();
            request.get().set_buffer(&buffer);
            request.get().set_kind(kind.into());
            request.send().promise.await?;
        }
        Message::Status { step, status } => {
            let mut request = sink.status_request();
            request.get().set_step(step.code());
            request.get().set_status(status.into());
            request.send().promise.await?;
        }
    }
    Ok(())
}

/// Starts the forwarder for `sink`. The forwarder ends when every sender is gone, or at the first
/// failed delivery, after which sends fail.
pub fn forward_to(sink: message_sink::Client) -> (ChannelSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let forwarder = tokio::task::spawn_local(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = deliver(&sink, message).await {
                warn!("could not deliver message to the client: {e}");
                break;
            }
        }
    });

    (ChannelSender { tx }, forwarder)
}

pub struct HubServer {
    hub: Rc<Hub>,
}

impl HubServer {
    pub fn new(hub: Rc<Hub>) -> Self {
        HubServer { hub }
    }

    fn stream_run(&self, run: Run, sink: message_sink::Client) -> Promise<(), capnp::Error> {
        let hub = Rc::clone(&self.hub);
        let (sender, forwarder) = forward_to(sink);
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        let steps = tokio::task::spawn_local(async move {
            let stream = hub.open_stream(run, Some(Box::new(sender)))?;
            hub.run(run, &stream, &cancel).await
        });

        Promise::from_future(async move {
            let _guard = guard;
            let result = steps
                .await
                .map_err(|e| capnp::Error::failed(format!("{run} did not finish: {e}")))?;
            if let Err(e) = forwarder.await {
                warn!("message forwarder for {run} failed: {e}");
            }
            result.map_err(to_rpc)
        })
    }
}

impl cli_to_hub::Server for HubServer {
    fn ping(
        &mut self,
        _: cli_to_hub::PingParams,
        _: cli_to_hub::PingResults,
    ) -> Promise<(), capnp::Error> {
        Promise::ok(())
    }

    fn initialize(
        &mut self,
        params: cli_to_hub::InitializeParams,
        _: cli_to_hub::InitializeResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let request = InitializeRequest {
            source_bin_dir: pry!(wire::read_path(pry!(params.get_source_bin_dir()))),
            target_bin_dir: pry!(wire::read_path(pry!(params.get_target_bin_dir()))),
            source_port: params.get_source_port(),
        };
        let sink = pry!(params.get_sink());

        info!(
            "initialize requested: source {} on port {}, target {}",
            request.source_bin_dir.display(),
            request.source_port,
            request.target_bin_dir.display()
        );
        self.hub.set_request(request);
        self.stream_run(Run::Initialize, sink)
    }

    fn execute(
        &mut self,
        params: cli_to_hub::ExecuteParams,
        _: cli_to_hub::ExecuteResults,
    ) -> Promise<(), capnp::Error> {
        let sink = pry!(pry!(params.get()).get_sink());
        self.stream_run(Run::Execute, sink)
    }

    fn finalize(
        &mut self,
        params: cli_to_hub::FinalizeParams,
        _: cli_to_hub::FinalizeResults,
    ) -> Promise<(), capnp::Error> {
        let sink = pry!(pry!(params.get()).get_sink());
        self.stream_run(Run::Finalize, sink)
    }

    fn revert_to_source(
        &mut self,
        params: cli_to_hub::RevertToSourceParams,
        _: cli_to_hub::RevertToSourceResults,
    ) -> Promise<(), capnp::Error> {
        let sink = pry!(pry!(params.get()).get_sink());
        self.stream_run(Run::Revert, sink)
    }

    fn set_config(
        &mut self,
        params: cli_to_hub::SetConfigParams,
        _: cli_to_hub::SetConfigResults,
    ) -> Promise<(), capnp::Error> {
        let params = pry!(params.get());
        let name = pry!(pry!(params.get_name()).to_str());
        let value = pry!(pry!(params.get_value()).to_str());

        info!("setting {name} to {value}");
        wire::promise(self.hub.set_config(name, value))
    }

    fn get_config(
        &mut self,
        params: cli_to_hub::GetConfigParams,
        mut results: cli_to_hub::GetConfigResults,
    ) -> Promise<(), capnp::Error> {
        let name = pry!(pry!(pry!(params.get()).get_name()).to_str());
        let value = pry!(self.hub.get_config(name).map_err(to_rpc));

        results.get().set_value(value.as_str());
        Promise::ok(())
    }

    fn status_upgrade(
        &mut self,
        _: cli_to_hub::StatusUpgradeParams,
        mut results: cli_to_hub::StatusUpgradeResults,
    ) -> Promise<(), capnp::Error> {
        let statuses = self.hub.step_statuses();

        let mut list = results.get().init_steps(statuses.len() as u32);
        for (i, (substep, status)) in statuses.iter().enumerate() {
            let mut entry = list.reborrow().get(i as u32);
            entry.set_step(substep.code());
            entry.set_status((*status).into());
        }
        Promise::ok(())
    }

    fn status_conversion(
        &mut self,
        _: cli_to_hub::StatusConversionParams,
        mut results: cli_to_hub::StatusConversionResults,
    ) -> Promise<(), capnp::Error> {
        let hub = Rc::clone(&self.hub);

        Promise::from_future(async move {
            let rows = hub.conversion_status().await.map_err(to_rpc)?;

            let mut list = results.get().init_segments(rows.len() as u32);
            for (i, row) in rows.iter().enumerate() {
                let mut entry = list.reborrow().get(i as u32);
                entry.set_status(row.status.into());
                entry.set_dbid(row.dbid);
                entry.set_content(row.content);
                entry.set_host(row.host.as_str());
            }
            Ok(())
        })
    }

    fn check_disk_space(
        &mut self,
        _: cli_to_hub::CheckDiskSpaceParams,
        mut results: cli_to_hub::CheckDiskSpaceResults,
    ) -> Promise<(), capnp::Error> {
        let hub = Rc::clone(&self.hub);

        Promise::from_future(async move {
            let usage = hub.disk_usage().await.map_err(to_rpc)?;

            let mut list = results.get().init_usage(usage.len() as u32);
            for (i, u) in usage.iter().enumerate() {
                let mut entry = list.reborrow().get(i as u32);
                entry.set_host(u.host.as_str());
                entry.set_filesystem(u.filesystem.as_str());
                entry.set_usage_percent(u.usage_percent);
            }
            Ok(())
        })
    }

    fn stop_services(
        &mut self,
        _: cli_to_hub::StopServicesParams,
        _: cli_to_hub::StopServicesResults,
    ) -> Promise<(), capnp::Error> {
        let hub = Rc::clone(&self.hub);

        Promise::from_future(async move {
            info!("stopping agents and hub");
            hub.stop_agents().await;

            let shutdown = hub.shutdown_signal();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(STOP_DELAY).await;
                shutdown.notify_one();
            });
            Ok(())
        })
    }
}
