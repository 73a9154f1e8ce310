// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Subcommand;

use crate::{
    commands::{hub_client, Cli, Handle, HandledResult},
    gpupgrade_capnp::cli_to_hub,
    hub::status::HostFilesystemUsage,
};

#[derive(Subcommand, Debug)]
pub enum CheckCommand {
    /// Report filesystem usage on every segment host.
    DiskSpace,
}

pub async fn check(cli: &Cli, command: &CheckCommand) -> HandledResult<()> {
    match command {
        CheckCommand::DiskSpace => disk_space(cli).await,
    }
}

fn usage_line(usage: &HostFilesystemUsage) -> String {
    format!(
        "{:<20}{:<40}{:>6.1}%",
        usage.host, usage.filesystem, usage.usage_percent
    )
}

async fn disk_space(cli: &Cli) -> HandledResult<()> {
    let client = hub_client(cli).await?;
    let usage = fetch(&client)
        .await
        .handle_err(|e| eprintln!("Could not check disk space: {e}"))?;

    println!("{:<20}{:<40}{:>7}", "HOST", "FILESYSTEM", "USED");
    for u in &usage {
        println!("{}", usage_line(u));
    }
    Ok(())
}

async fn fetch(client: &cli_to_hub::Client) -> capnp::Result<Vec<HostFilesystemUsage>> {
    let reply = client.check_disk_space_request().send().promise.await?;

    reply
        .get()?
        .get_usage()?
        .iter()
        .map(|u| {
            Ok(HostFilesystemUsage {
                host: u.get_host()?.to_string()?,
                filesystem: u.get_filesystem()?.to_string()?,
                usage_percent: u.get_usage_percent(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_printed_in_columns() {
        let line = usage_line(&HostFilesystemUsage {
            host: "sdw1".to_string(),
            filesystem: "/dev/sda1".to_string(),
            usage_percent: 42.0,
        });
        assert_eq!(line, format!("{:<20}{:<40}{:>6}%", "sdw1", "/dev/sda1", "42.0"));
    }
}
