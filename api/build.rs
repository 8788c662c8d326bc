// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost at the vendored protoc so builds don't depend on a system
    // protobuf installation.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/mandau/v1/mandau.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/mandau/v1/mandau.proto");

    Ok(())
}
