// Build script to generate the ModelService client and server from the
// hand-written prost messages in src/lib.rs.
//
// The service is described with tonic-build's manual builder, so the build
// does not depend on a system `protoc`. inference.proto is the schema shared
// with non-Rust clients and must be kept in sync with src/lib.rs.

fn main() {
    let generate = tonic_build::manual::Method::builder()
        .name("generate")
        .route_name("Generate")
        .input_type("crate::GenerateRequest")
        .output_type("crate::TokenResponse")
        .codec_path("tonic::codec::ProstCodec")
        .server_streaming()
        .build();

    let health = tonic_build::manual::Method::builder()
        .name("health")
        .route_name("Health")
        .input_type("crate::HealthRequest")
        .output_type("crate::HealthResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let model_service = tonic_build::manual::Service::builder()
        .name("ModelService")
        .package("inference")
        .method(generate)
        .method(health)
        .build();

    tonic_build::manual::Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[model_service]);

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=inference.proto");
}
