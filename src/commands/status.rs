// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Subcommand;

use crate::{
    commands::{hub_client, Cli, Handle, HandledResult},
    gpupgrade_capnp::cli_to_hub,
    hub::status::ConversionStatus,
    state::Status,
    step::Substep,
};

#[derive(Subcommand, Debug)]
pub enum StatusCommand {
    /// The status of every upgrade step.
    Upgrade,
    /// The upgrade status of every segment.
    Conversion,
}

pub async fn status(cli: &Cli, command: &StatusCommand) -> HandledResult<()> {
    let client = hub_client(cli).await?;
    match command {
        StatusCommand::Upgrade => {
            let steps = upgrade_status(&client)
                .await
                .handle_err(|e| eprintln!("Could not get upgrade status: {e}"))?;
            for (step, status) in steps {
                println!("{status} - {}", step.description());
            }
        }
        StatusCommand::Conversion => {
            let rows = conversion_status(&client)
                .await
                .handle_err(|e| eprintln!("Could not get conversion status: {e}"))?;
            for row in rows {
                println!("{row}");
            }
        }
    }
    Ok(())
}

async fn upgrade_status(client: &cli_to_hub::Client) -> capnp::Result<Vec<(Substep, Status)>> {
    let reply = client.status_upgrade_request().send().promise.await?;

    let mut steps = Vec::new();
    for entry in reply.get()?.get_steps()?.iter() {
        // Codes this CLI does not know come from a newer hub.
        if let Some(step) = Substep::from_code(entry.get_step()) {
            steps.push((step, entry.get_status()?.into()));
        }
    }
    Ok(steps)
}

async fn conversion_status(client: &cli_to_hub::Client) -> capnp::Result<Vec<ConversionStatus>> {
    let reply = client.status_conversion_request().send().promise.await?;

    reply
        .get()?
        .get_segments()?
        .iter()
        .map(|s| {
            Ok(ConversionStatus {
                status: s.get_status()?.into(),
                dbid: s.get_dbid(),
                content: s.get_content(),
                host: s.get_host()?.to_string()?,
            })
        })
        .collect()
}
