//! Final-proof dispatcher.
//!
//! A single long-running consumer: it submits the verification transaction,
//! waits for the synchronizer to observe the new frontier, then prunes the
//! proofs the final proof covers. It is the sole clearer of the gate token on
//! the success path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::domain::FinalProofInputs;

use super::{Coordinator, FinalProofMsg};

impl Coordinator {
    /// Consume final proofs one at a time until shutdown. Errors never
    /// terminate the loop.
    pub(crate) async fn run_final_proof_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<FinalProofMsg>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown_signal().cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };
            self.settle_final_proof(msg).await;
        }
    }

    async fn settle_final_proof(&self, msg: FinalProofMsg) {
        let proof = msg.recursive_proof;

        info!(
            prover_id = %msg.prover_id,
            batch_number = proof.batch_number,
            batch_number_final = proof.batch_number_final,
            "Verifying final proof with L1 smart contract"
        );

        // The batch row carries the authoritative roots for the tx inputs.
        let final_batch = match self
            .store
            .get_batch_by_number(proof.batch_number_final, None)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    batch_number = proof.batch_number_final,
                    error = %e,
                    "Failed to retrieve final batch"
                );
                self.release_proof(&proof).await;
                self.gate.enable_proof_verification().await;
                return;
            }
        };

        let inputs = FinalProofInputs {
            final_proof: msg.final_proof,
            new_local_exit_root: final_batch.local_exit_root.to_vec(),
            new_state_root: final_batch.state_root.to_vec(),
        };

        info!(
            new_local_exit_root = %final_batch.local_exit_root,
            new_state_root = %final_batch.state_root,
            "Final proof inputs"
        );

        let tx_hash = match self
            .eth_tx_manager
            .verify_batches(proof.batch_number - 1, proof.batch_number_final, &inputs)
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                error!(
                    batch_number = proof.batch_number,
                    batch_number_final = proof.batch_number_final,
                    error = %e,
                    "Error verifying final proof"
                );
                self.metrics.verify_batches_failed();
                // Keep the proof row for a retry on the next elevation.
                self.release_proof(&proof).await;
                self.gate.enable_proof_verification().await;
                return;
            }
        };

        info!(
            batch_number = proof.batch_number,
            batch_number_final = proof.batch_number_final,
            tx_hash = %tx_hash,
            "Final proof verified in transaction"
        );
        self.metrics.final_proof_verified();

        // Wait for the synchronizer to catch up before pruning, so selections
        // never observe a frontier behind the chain.
        debug!("A final proof has been sent, waiting for the network to be synced");
        while !self.is_synced().await {
            info!("Waiting for synchronizer to sync...");
            if !self.sleep_retry().await {
                return;
            }
        }

        self.gate.reset_verify_proof_time().await;

        // The network holds the final proof now; the covering recursive
        // proofs are obsolete.
        if let Err(e) = self
            .store
            .delete_generated_proofs(proof.batch_number, proof.batch_number_final, None)
            .await
        {
            error!(error = %e, "Failed to prune proofs covered by the final proof");
        }
    }
}
