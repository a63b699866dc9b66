//! Protocol buffer definitions for the prover channel gRPC API.

#![allow(clippy::all)]
#![allow(unused_imports)]

// Include the generated protobuf code.
include!("aggregator.v1.rs");
