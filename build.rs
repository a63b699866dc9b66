fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the prover channel protocol. The input bundle types also derive
    // serde so the coordinator can persist them in the input_prover audit column.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/proto")
        .type_attribute(
            "aggregator.v1.InputProver",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            "aggregator.v1.PublicInputs",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .compile_protos(&["proto/aggregator.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/aggregator.proto");

    Ok(())
}
