//! Generates the CSI v1 server stubs from `proto/csi.proto`.

fn main() {
    let protos = ["proto/csi.proto"];

    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_protos(&protos, &["proto"])
        .expect("Failed to compile CSI protos");

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }
}
