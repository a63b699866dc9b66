//! Trait definitions for the coordinator's collaborators.
//!
//! Every external dependency of the proof pipeline sits behind one of these
//! traits so the scheduling and locking logic can be exercised against mocks.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::{PgConnection, Postgres, Transaction};

use crate::domain::{Batch, FinalProofInputs, Proof, VerifiedBatch};
use crate::proto;

use super::Result;

/// A store transaction handle.
///
/// Selection and mutation primitives on [`ProofStore`] accept an optional
/// `&mut StoreTx`; when given one they run inside it, otherwise they
/// auto-commit against the pool.
pub struct StoreTx {
    inner: StoreTxInner,
}

enum StoreTxInner {
    Postgres(Transaction<'static, Postgres>),
    /// Transactionless handle for in-memory stores in tests.
    #[cfg(test)]
    Noop,
}

impl StoreTx {
    pub(crate) fn postgres(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: StoreTxInner::Postgres(tx),
        }
    }

    #[cfg(test)]
    pub(crate) fn noop() -> Self {
        Self {
            inner: StoreTxInner::Noop,
        }
    }

    /// Borrow the underlying Postgres connection.
    pub(crate) fn pg(&mut self) -> Result<&mut PgConnection> {
        match &mut self.inner {
            StoreTxInner::Postgres(tx) => Ok(&mut **tx),
            #[cfg(test)]
            StoreTxInner::Noop => Err(super::AggregatorError::Internal(
                "noop transaction has no connection".to_string(),
            )),
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self.inner {
            StoreTxInner::Postgres(tx) => Ok(tx.commit().await?),
            #[cfg(test)]
            StoreTxInner::Noop => Ok(()),
        }
    }

    pub async fn rollback(self) -> Result<()> {
        match self.inner {
            StoreTxInner::Postgres(tx) => Ok(tx.rollback().await?),
            #[cfg(test)]
            StoreTxInner::Noop => Ok(()),
        }
    }
}

/// Transactional CRUD over proof rows and batch lookups.
///
/// Selections return [`AggregatorError::NotFound`] when nothing qualifies.
/// The coordinator serializes claim sections with a process-wide mutex, so
/// implementations do not need serializable isolation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProofStore: Send + Sync {
    /// Open a transaction for multi-statement proof lifecycle transitions.
    async fn begin_transaction(&self) -> Result<StoreTx>;

    /// Startup sweep: remove proof rows whose payload was never written.
    /// Their generating session died with the previous process.
    async fn delete_ungenerated_proofs<'a>(&self, dbtx: Option<&'a mut StoreTx>) -> Result<()>;

    /// The highest batch verified on L1, or `NotFound` before the first
    /// verification.
    async fn get_last_verified_batch<'a>(
        &self,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<VerifiedBatch>;

    /// The lowest-numbered sequenced batch past `last_verified_batch_number`
    /// that no proof covers yet.
    async fn get_virtual_batch_to_prove<'a>(
        &self,
        last_verified_batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch>;

    async fn get_batch_by_number<'a>(
        &self,
        batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch>;

    /// The unclaimed proof starting right after the verified frontier and
    /// covering only complete sequences.
    async fn get_proof_ready_to_verify<'a>(
        &self,
        last_verified_batch_number: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Proof>;

    /// Two adjacent unclaimed proofs, earliest range first.
    async fn get_proofs_to_aggregate<'a>(
        &self,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<(Proof, Proof)>;

    /// Whether the proof's range starts and ends on sequence boundaries.
    async fn check_proof_contains_complete_sequences<'a>(
        &self,
        proof: &Proof,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<bool>;

    async fn add_generated_proof<'a>(
        &self,
        proof: &Proof,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()>;

    async fn update_generated_proof<'a>(
        &self,
        proof: &Proof,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()>;

    /// Delete every proof row contained in `[batch_number, batch_number_final]`.
    async fn delete_generated_proofs<'a>(
        &self,
        batch_number: u64,
        batch_number_final: u64,
        dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()>;
}

/// Submits and monitors the L1 transaction verifying a batch range.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EthTxManager: Send + Sync {
    /// Call `verify_batches(last_verified_batch, new_verified_batch, inputs)`
    /// on the rollup contract and return the transaction hash.
    async fn verify_batches(
        &self,
        last_verified_batch: u64,
        new_verified_batch: u64,
        inputs: &FinalProofInputs,
    ) -> Result<B256>;
}

/// Read-only view of the L1 rollup contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait L1Client: Send + Sync {
    /// The verified-batch frontier as seen by the contract.
    async fn get_latest_verified_batch_num(&self) -> Result<u64>;

    /// The aggregator account address used to sign verification transactions.
    async fn get_public_address(&self) -> Result<Address>;
}

/// One connected prover worker, driven over its bidirectional stream.
///
/// RPCs are strictly sequential per session: each call waits for the response
/// to the previous one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProverClient: Send + Sync {
    fn id(&self) -> String;

    fn addr(&self) -> String;

    /// Poll the worker status; non-idle provers are skipped by the scheduler.
    async fn is_idle(&self) -> Result<bool>;

    /// Request a base batch proof; returns the prover-side computation id.
    async fn batch_proof(&self, input: proto::InputProver) -> Result<String>;

    /// Request recursive aggregation of two proofs.
    async fn aggregated_proof(
        &self,
        recursive_proof_1: &str,
        recursive_proof_2: &str,
    ) -> Result<String>;

    /// Request the final wrapping proof.
    async fn final_proof(&self, recursive_proof: &str, aggregator_addr: &str) -> Result<String>;

    /// Poll until the recursive proof for `proof_id` is available.
    async fn wait_recursive_proof(&self, proof_id: &str) -> Result<String>;

    /// Poll until the final proof for `proof_id` is available.
    async fn wait_final_proof(&self, proof_id: &str) -> Result<proto::FinalProof>;
}
