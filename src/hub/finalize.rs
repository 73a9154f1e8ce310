// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use futures::future::{FutureExt, LocalBoxFuture};

use crate::{
    cluster::{catalog::ConnectOptions, Cluster, Segment},
    error::{Error, Result},
    hub::Hub,
    step::{Step, Substep},
    stream::MultiplexedStream,
};

pub const STEPS: &[Step<Hub>] = &[
    Step {
        substep: Substep::ValidateTargetPorts,
        run: validate_target_ports,
    },
    Step {
        substep: Substep::StopAgents,
        run: stop_agents,
    },
];

/// Describes every primary whose catalog port differs from the source cluster's port for the
/// same content id, and every source content id missing from the catalog.
pub fn port_mismatches(source: &Cluster, catalog: &[Segment]) -> Vec<String> {
    let mut problems: Vec<String> = catalog
        .iter()
        .filter_map(|seg| match source.port_for(seg.content) {
            Some(port) if port == seg.port => None,
            Some(port) => Some(format!(
                "content {} listens on port {} instead of {port}",
                seg.content, seg.port
            )),
            None => Some(format!(
                "content {} is not part of the source cluster",
                seg.content
            )),
        })
        .collect();

    problems.extend(
        source
            .content_ids()
            .into_iter()
            .filter(|content| !catalog.iter().any(|seg| seg.content == *content))
            .map(|content| format!("content {content} is missing from the target catalog")),
    );
    problems
}

fn validate_target_ports<'a>(
    hub: &'a Hub,
    _stream: &'a MultiplexedStream,
) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        let source = hub.source();
        let port = source
            .coordinator()
            .map(|c| c.port)
            .ok_or_else(|| Error::Configuration("the source cluster has not been configured".into()))?;

        let mut catalog = hub.connect(ConnectOptions::normal(port), "target").await?;
        let segments = catalog.segments().await?;

        let problems = port_mismatches(&source, &segments);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "the target cluster is not on the source ports: {}",
                problems.join("; ")
            )))
        }
    }
    .boxed_local()
}

fn stop_agents<'a>(hub: &'a Hub, _stream: &'a MultiplexedStream) -> LocalBoxFuture<'a, Result<()>> {
    async move {
        hub.stop_agents().await;
        Ok(())
    }
    .boxed_local()
}
