//! Recursive proof rows and the final-proof handoff types.

use chrono::{DateTime, Utc};

use crate::proto;

/// A recursive proof covering the inclusive batch range
/// `[batch_number, batch_number_final]`.
///
/// A batch proof covers a single batch (`batch_number == batch_number_final`);
/// an aggregated proof spans more than one. `generating` is the row-level
/// claim flag: while it is `true` the owning prover session has exclusive
/// rights over the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub batch_number: u64,
    pub batch_number_final: u64,
    /// Identifier returned by the prover for the in-flight computation.
    pub proof_id: Option<String>,
    /// The recursive proof artifact, opaque to the coordinator.
    pub proof: Option<String>,
    /// JSON-encoded prover inputs, kept for audit and replay.
    pub input_prover: Option<String>,
    /// Id of the prover session that produced (or is producing) this row.
    pub prover: Option<String>,
    pub generating: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proof {
    /// Whether this proof covers a single batch.
    pub fn is_batch_proof(&self) -> bool {
        self.batch_number == self.batch_number_final
    }

    /// Number of batches covered by the proof range.
    pub fn batch_span(&self) -> u64 {
        self.batch_number_final - self.batch_number + 1
    }
}

/// Inputs handed to the Ethereum transaction manager to verify a batch range.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalProofInputs {
    pub final_proof: proto::FinalProof,
    pub new_local_exit_root: Vec<u8>,
    pub new_state_root: Vec<u8>,
}
