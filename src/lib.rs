//! Rollup Proof Aggregation Coordinator
//!
//! Compresses a stream of executed L2 batches into a single recursive
//! validity proof and submits it to an L1 smart contract to finalize a range
//! of batches.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (proofs, batches)
//! - [`infra`] - Infrastructure implementations (PostgreSQL store, L1 client)
//! - [`coordinator`] - Scheduler loops, proof pipeline, final-proof dispatcher
//! - [`prover`] - Prover sessions over the bidirectional gRPC stream
//! - [`grpc`] - gRPC service binding streams to scheduler loops
//! - [`proto`] - Protocol buffer definitions
//! - [`metrics`] - Coordinator counters and gauges
//! - [`server`] - Bootstrap and configuration

pub mod coordinator;
pub mod domain;
pub mod grpc;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod proto;
pub mod prover;
pub mod server;

// Re-export commonly used types
pub use coordinator::{
    Coordinator, FinalProofGate, ProfitabilityChecker, ProfitabilityCheckerType,
};
pub use domain::{Batch, FinalProofInputs, Proof, VerifiedBatch};
pub use infra::{
    AggregatorError, EthTxManager, L1Client, PgProofStore, ProofStore, ProverClient, Result,
};
