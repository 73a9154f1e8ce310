// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

fn main() {
    println!("cargo:rerun-if-changed=gpupgrade.capnp");

    capnpc::CompilerCommand::new()
        .file("gpupgrade.capnp")
        .run()
        .expect("compiling gpupgrade.capnp schema");
}
