use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds do not depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // SAFETY: build scripts are single-threaded at this point.
    unsafe { std::env::set_var("PROTOC", protoc) };

    let includes = [
        PathBuf::from("../proto"),
        protoc_bin_vendored::include_path()?,
    ];

    println!("cargo:rerun-if-changed=../proto/csi.proto");

    // Compile CSI proto (server side only)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&[PathBuf::from("../proto/csi.proto")], &includes)?;

    Ok(())
}
