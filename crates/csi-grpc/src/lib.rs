//! Generated Rust bindings for the [Container Storage Interface][csi]
//! (CSI) gRPC API. The schema is vendored in `proto/csi.proto` and
//! compiled by `tonic-build`; this crate only re-exports the generated
//! types and service stubs.
//!
//! [csi]: https://github.com/container-storage-interface/spec

/// Messages and services of the `csi.v1` package.
pub mod v1 {
    #![allow(clippy::all)]
    tonic::include_proto!("csi.v1");
}
