//! PostgreSQL implementation of the proof store facade.

mod proof_store;

pub use proof_store::*;
