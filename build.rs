fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().unwrap(),
    );

    let out_dir = std::env::var("OUT_DIR").unwrap();

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(format!("{}/ratelimit_descriptor.bin", out_dir))
        .compile(&["proto/ratelimit.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/");
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
