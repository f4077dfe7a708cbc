/// Builds the gRPC client and server code for `orchestrator_service.proto`
/// using `tonic-prost-build`.
///
/// The client half is what the worker talks to the coordinator with. The
/// server half is generated as well so an in-process coordinator can be stood
/// up in tests without a real sidecar.
///
/// # Files and Paths
///
/// - Proto file: `proto/orchestrator_service.proto`
/// - Includes: `proto/`
///
/// # Output
///
/// Generated code is pulled in through:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("taskhub");
/// }
/// ```
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .compile_protos(&["proto/orchestrator_service.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/orchestrator_service.proto");
    Ok(())
}
