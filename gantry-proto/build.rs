use std::io::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=proto/");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());

    // Runtime protos: server reflection protocol and google.rpc.Status for
    // HTTP error bodies. The descriptor set lets the reflection service
    // describe itself.
    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("reflection_descriptor.bin"))
        .compile_protos(
            &[
                "proto/grpc/reflection/v1alpha/reflection.proto",
                "proto/google/rpc/status.proto",
            ],
            &["proto/"],
        )?;

    // Test fixtures: a greeter service covering all four streaming shapes
    // with google.api.http annotations, and a proto2 file with extensions.
    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("greet_descriptor.bin"))
        .compile_protos(
            &["proto/greet/greet.proto", "proto/exts/exts.proto"],
            &["proto/"],
        )?;

    Ok(())
}
