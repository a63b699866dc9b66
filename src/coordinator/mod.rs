//! The proof aggregation coordinator.
//!
//! Owns the proof lifecycle: it claims work under a process-wide mutex,
//! dispatches it to idle prover sessions, folds adjacent recursive proofs
//! into wider ones, and elevates the proof at the verified frontier to a
//! final proof settled on L1.

mod dispatcher;
mod gate;
mod pipeline;
mod policy;
mod scheduler;
#[cfg(test)]
mod tests;

pub use gate::FinalProofGate;
pub use policy::{
    ProfitabilityChecker, ProfitabilityCheckerType, TxProfitabilityCheckerAcceptAll,
    TxProfitabilityCheckerBase,
};

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::domain::Proof;
use crate::infra::{
    AggregatorError, EthTxManager, L1Client, ProofStore, Result, Shutdown, ShutdownSignal,
};
use crate::metrics::Metrics;
use crate::proto;
use crate::server::Config;

/// Handoff from a prover session to the final-proof dispatcher.
pub(crate) struct FinalProofMsg {
    pub prover_id: String,
    pub recursive_proof: Proof,
    pub final_proof: proto::FinalProof,
}

/// Coordinator state shared by every prover session and the dispatcher.
pub struct Coordinator {
    cfg: Config,
    store: Arc<dyn ProofStore>,
    eth_tx_manager: Arc<dyn EthTxManager>,
    l1: Arc<dyn L1Client>,
    profitability: Arc<dyn ProfitabilityChecker>,
    gate: FinalProofGate,
    metrics: Metrics,
    /// Serializes proof-row selection with its `generating = true` stamp so
    /// two sessions cannot claim the same row. Never held across network I/O.
    store_mutex: Mutex<()>,
    /// Single-capacity handoff to the dispatcher. Together with the gate
    /// token this keeps at most one final proof in flight.
    final_proof_tx: mpsc::Sender<FinalProofMsg>,
    final_proof_rx: StdMutex<Option<mpsc::Receiver<FinalProofMsg>>>,
    shutdown: Shutdown,
}

impl Coordinator {
    pub fn new(
        cfg: Config,
        store: Arc<dyn ProofStore>,
        eth_tx_manager: Arc<dyn EthTxManager>,
        l1: Arc<dyn L1Client>,
        profitability: Arc<dyn ProfitabilityChecker>,
    ) -> Self {
        let (final_proof_tx, final_proof_rx) = mpsc::channel(1);
        let gate = FinalProofGate::new(cfg.verify_proof_interval);

        Self {
            cfg,
            store,
            eth_tx_manager,
            l1,
            profitability,
            gate,
            metrics: Metrics::new(),
            store_mutex: Mutex::new(()),
            final_proof_tx,
            final_proof_rx: StdMutex::new(Some(final_proof_rx)),
            shutdown: Shutdown::new(),
        }
    }

    /// Run the startup sweep, open the gate window, and spawn the
    /// final-proof dispatcher.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Proof rows without a payload were being generated by sessions of a
        // previous process; reclaim their batches.
        self.store
            .delete_ungenerated_proofs(None)
            .await
            .map_err(|e| {
                AggregatorError::Internal(format!("failed to initialize proofs cache: {e}"))
            })?;

        self.gate.reset_verify_proof_time().await;

        let rx = self
            .final_proof_rx
            .lock()
            .expect("final proof receiver lock poisoned")
            .take()
            .ok_or_else(|| AggregatorError::Internal("coordinator already started".to_string()))?;

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run_final_proof_dispatcher(rx).await });

        info!("Coordinator started");
        Ok(())
    }

    /// Initiate shutdown: terminates every scheduler loop, the dispatcher,
    /// and the gRPC server's shutdown future.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Whether the L2 state has caught up with the frontier verified on L1.
    /// Used as a barrier before final-proof eligibility and before pruning.
    pub(crate) async fn is_synced(&self) -> bool {
        let last_verified = match self.store.get_last_verified_batch(None).await {
            Ok(batch) => batch,
            Err(e) if e.is_not_found() => return false,
            Err(e) => {
                warn!(error = %e, "Failed to get last verified batch");
                return false;
            }
        };

        let last_verified_eth_batch_num = match self.l1.get_latest_verified_batch_num().await {
            Ok(num) => num,
            Err(e) => {
                warn!(error = %e, "Failed to get last verified batch from L1");
                return false;
            }
        };

        if last_verified.batch_number < last_verified_eth_batch_num {
            info!(
                last_verified_batch_num = last_verified.batch_number,
                last_verified_eth_batch_num, "Waiting for the state to be synced"
            );
            return false;
        }
        true
    }

    /// Sleep for the retry interval; returns `false` if shutdown fired first.
    pub(crate) async fn sleep_retry(&self) -> bool {
        let signal = self.shutdown.signal();
        tokio::select! {
            _ = signal.cancelled() => false,
            _ = tokio::time::sleep(self.cfg.retry_time) => true,
        }
    }
}
