//! Generated protobuf/gRPC types, see `build.rs`.

#[allow(clippy::all, clippy::pedantic)]
#[rustfmt::skip]
pub mod quorand;
