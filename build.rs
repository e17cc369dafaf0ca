fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost/tonic at a vendored protoc when none is on PATH, so the
    // build works in environments without a system protobuf compiler.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }
    tonic_build::compile_protos("proto/imgflow.proto")?;
    Ok(())
}
