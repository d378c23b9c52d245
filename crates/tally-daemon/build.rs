use std::io::Result;

fn main() -> Result<()> {
    let protos = ["proto/entries.proto", "proto/alerter.proto"];
    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    let fds = protox::compile(protos, ["proto/"]).map_err(std::io::Error::other)?;

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(fds)
}
