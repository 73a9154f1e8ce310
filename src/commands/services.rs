// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{Cli, Handle, HandledResult},
    gpupgrade_capnp::cli_to_hub,
};

/// Asks the hub to stop its agents and then itself.
pub async fn stop_hub(client: &cli_to_hub::Client) -> HandledResult<()> {
    client
        .stop_services_request()
        .send()
        .promise
        .await
        .handle_err(|e| eprintln!("Could not stop the gpupgrade services: {e}"))?;
    Ok(())
}

pub async fn kill_services(cli: &Cli) -> HandledResult<()> {
    let Ok(connection) =
        crate::gpupgrade_capnp::connect::<cli_to_hub::Client>(&cli.hub_address()).await
    else {
        println!("The hub is not running.");
        return Ok(());
    };

    stop_hub(&connection.client).await?;
    println!("Stopped the gpupgrade hub and agents.");
    Ok(())
}
