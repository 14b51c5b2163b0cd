fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Generate rust code from .proto protobuf.
    tonic_build::configure()
        .bytes(["."])
        .compile_protos(
            &["proto/cli_to_hub.proto", "proto/hub_to_agent.proto"],
            &["proto"],
        )
        .unwrap_or_else(|e| panic!("failed to compile protos {:?}", e));
    Ok(())
}
