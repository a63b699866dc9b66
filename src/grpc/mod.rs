//! gRPC service implementations for the aggregation coordinator.
//!
//! The prover-facing service accepts bidirectional streams and binds each one
//! to a scheduler loop.

mod service;

pub use service::AggregatorGrpcService;
