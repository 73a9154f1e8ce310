// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Running the hub and agent in the background.
//!
//! `--daemonize` re-runs the current executable as a child in its own process group. The child
//! binds its listener, announces itself on stdout, and detaches from the pipes. The parent waits
//! for that announcement and relays it, so whoever started the daemon (the CLI, or ssh during
//! `start-agents`) sees a nonzero exit when the child fails to come up.

use std::{
    ffi::OsString,
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    os::{fd::AsRawFd, unix::process::CommandExt},
    process::{Command, Stdio},
};

use nix::unistd::dup2;

pub const DAEMONIZE_FLAG: &str = "--daemonize";

/// Passed to the re-executed child so it knows to announce and detach.
pub const CHILD_FLAG: &str = "--daemon-child";

/// Starts the background child and waits until it is serving. Returns the exit code for this
/// (parent) process.
pub fn daemonize() -> io::Result<i32> {
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os()
        .skip(1)
        .filter(|arg| arg != DAEMONIZE_FLAG)
        .collect();

    let mut child = Command::new(exe)
        .args(args)
        .arg(CHILD_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let mut line = String::new();
    if let Some(stdout) = child.stdout.take() {
        BufReader::new(stdout).read_line(&mut line)?;
    }

    if !line.is_empty() {
        print!("{line}");
        io::stdout().flush()?;
        return Ok(0);
    }

    // The child closed stdout without announcing itself, so it is exiting.
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr)?;
    }
    let status = child.wait()?;

    eprint!("{stderr}");
    eprintln!("daemon exited before it started serving ({status})");
    Ok(1)
}

/// Tells the waiting parent that startup succeeded, then points stdin, stdout, and stderr at
/// `/dev/null` so the parent's pipes close.
pub fn announce_and_detach(component: &str, port: u16) -> io::Result<()> {
    println!(
        "{component} started on port {port} (pid {})",
        std::process::id()
    );
    io::stdout().flush()?;

    let null = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in [
        io::stdin().as_raw_fd(),
        io::stdout().as_raw_fd(),
        io::stderr().as_raw_fd(),
    ] {
        dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}
