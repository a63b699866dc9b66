//! Domain models for the proof aggregation coordinator.
//!
//! The central entity is [`Proof`], a recursive proof covering a contiguous
//! range of L2 batches. Batches themselves are read-only here; they are
//! written by the synchronizer and only consulted to build prover inputs and
//! to resolve authoritative state roots.

mod batch;
mod proof;

pub use batch::*;
pub use proof::*;
