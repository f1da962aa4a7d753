fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/csi.proto");

    // protox compiles the descriptor set in-process, so building does not
    // require a protoc binary on the host.
    let file_descriptors = protox::compile(["proto/csi.proto"], ["proto"])?;

    let builder = tonic_build::configure().build_client(true).build_server(true);
    let mut config = prost_build::Config::new();
    config.service_generator(builder.service_generator());
    config.compile_fds(file_descriptors)?;

    Ok(())
}
