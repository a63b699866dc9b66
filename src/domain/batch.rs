//! Batch entities mirrored from the synchronizer.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};

/// An executed L2 batch, identified by its monotonically increasing number.
///
/// Read-only to the coordinator: rows are written by the synchronizer as
/// batches are sequenced on L1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_number: u64,
    /// Sequencer address that collected the batch fees.
    pub coinbase: Address,
    /// Raw L2 transaction payload handed to the prover.
    pub batch_l2_data: Vec<u8>,
    pub state_root: B256,
    pub local_exit_root: B256,
    pub acc_input_hash: B256,
    pub global_exit_root: B256,
    pub timestamp: DateTime<Utc>,
}

/// A batch whose validity proof has been accepted by the L1 contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBatch {
    pub batch_number: u64,
    /// Hash of the L1 transaction that verified the batch.
    pub tx_hash: B256,
    pub aggregator: Address,
    /// L1 block in which the verification landed.
    pub block_number: u64,
}
