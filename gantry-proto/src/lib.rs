//! Generated protobuf code for gantry.
//!
//! The runtime depends on the reflection protocol and `google.rpc.Status`;
//! everything else here is test fixtures compiled with their descriptor set
//! so tests can feed the registry real descriptors.

pub mod reflection {
    tonic::include_proto!("grpc.reflection.v1alpha");

    /// Descriptor set for the reflection protocol itself, so the reflection
    /// service can describe its own types.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/reflection_descriptor.bin"));
}

pub mod rpc {
    tonic::include_proto!("google.rpc");
}

pub mod api {
    tonic::include_proto!("google.api");
}

pub mod greet {
    tonic::include_proto!("greet");

    /// Descriptor set for the greeter fixture, including its
    /// `google.api.http` annotations and transitive imports.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/greet_descriptor.bin"));
}

pub mod exts {
    tonic::include_proto!("exts");
}
