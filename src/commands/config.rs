// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Subcommand;

use crate::{
    commands::{handled_error, hub_client, BinDirArgs, Cli, Handle, HandledResult},
    gpupgrade_capnp::cli_to_hub,
};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Change the bin directory of the source or target cluster.
    Set(BinDirArgs),
    /// Print the recorded bin directories. With no flags, prints both.
    Show(ShowArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ShowArgs {
    #[arg(long)]
    pub source_bindir: bool,

    #[arg(long)]
    pub target_bindir: bool,
}

/// The `(key, value)` pairs a `config set` sends, in a fixed order.
fn settings(args: &BinDirArgs) -> Vec<(&'static str, String)> {
    let mut settings = Vec::new();
    if let Some(dir) = &args.source_bindir {
        settings.push(("source-bindir", dir.to_string_lossy().into_owned()));
    }
    if let Some(dir) = &args.target_bindir {
        settings.push(("target-bindir", dir.to_string_lossy().into_owned()));
    }
    settings
}

/// The keys a `config show` asks for.
fn keys(args: &ShowArgs) -> Vec<&'static str> {
    match (args.source_bindir, args.target_bindir) {
        (true, false) => vec!["source-bindir"],
        (false, true) => vec!["target-bindir"],
        _ => vec!["source-bindir", "target-bindir"],
    }
}

pub async fn config(cli: &Cli, command: &ConfigCommand) -> HandledResult<()> {
    match command {
        ConfigCommand::Set(args) => set(cli, args).await,
        ConfigCommand::Show(args) => show(cli, args).await,
    }
}

async fn set(cli: &Cli, args: &BinDirArgs) -> HandledResult<()> {
    let settings = settings(args);
    if settings.is_empty() {
        eprintln!("Nothing to set; pass --source-bindir or --target-bindir.");
        return handled_error();
    }

    let client = hub_client(cli).await?;
    for (name, value) in settings {
        set_one(&client, name, &value)
            .await
            .handle_err(|e| eprintln!("Could not set {name}: {e}"))?;
        println!("Successfully set {name} to {value}");
    }
    Ok(())
}

async fn set_one(client: &cli_to_hub::Client, name: &str, value: &str) -> capnp::Result<()> {
    let mut request = client.set_config_request();
    request.get().set_name(name);
    request.get().set_value(value);
    request.send().promise.await?;
    Ok(())
}

async fn get_one(client: &cli_to_hub::Client, name: &str) -> capnp::Result<String> {
    let mut request = client.get_config_request();
    request.get().set_name(name);
    let reply = request.send().promise.await?;
    Ok(reply.get()?.get_value()?.to_string()?)
}

async fn show(cli: &Cli, args: &ShowArgs) -> HandledResult<()> {
    let client = hub_client(cli).await?;
    let keys = keys(args);

    for name in &keys {
        let value = get_one(&client, name)
            .await
            .handle_err(|e| eprintln!("Could not read {name}: {e}"))?;
        if keys.len() == 1 {
            println!("{value}");
        } else {
            println!("{name} - {value}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn set_sends_only_the_given_keys() {
        let args = BinDirArgs {
            source_bindir: None,
            target_bindir: Some(PathBuf::from("/usr/local/gpdb6/bin")),
        };
        assert_eq!(
            settings(&args),
            vec![("target-bindir", "/usr/local/gpdb6/bin".to_string())]
        );
        assert!(settings(&BinDirArgs::default()).is_empty());
    }

    #[test]
    fn show_defaults_to_both_keys() {
        assert_eq!(keys(&ShowArgs::default()), vec!["source-bindir", "target-bindir"]);
        assert_eq!(
            keys(&ShowArgs {
                source_bindir: true,
                target_bindir: false
            }),
            vec!["source-bindir"]
        );
    }
}
