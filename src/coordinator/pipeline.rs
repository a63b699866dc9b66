//! Proof pipeline operations.
//!
//! The three `try_*` operations return `Ok(true)` when they produced (or
//! consumed) a proof, `Ok(false)` when there was nothing to do, and an error
//! otherwise. Every early exit releases the locks it acquired: `generating`
//! flags are restored and the gate token is given back unless a final proof
//! actually reached the dispatcher.

use std::collections::HashMap;

use alloy::primitives::U256;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::domain::{Batch, Proof};
use crate::infra::{AggregatorError, ProverClient, Result};
use crate::proto;

use super::{Coordinator, FinalProofMsg};

/// Roots returned by the mock prover. When both match, the authoritative
/// values from the batch row are substituted.
pub(crate) const MOCKED_STATE_ROOT: &str =
    "0x090bcaf734c4f06c93954a827b45a6e8c67b8e0fd1e0a35a1c5982d6961828f9";
pub(crate) const MOCKED_LOCAL_EXIT_ROOT: &str =
    "0x17c04c3760510b48c6012742c540a81aba4bca2f78b9d14bfd2f123e2e53ea3e";

impl Coordinator {
    /// Claim the next unproven virtual batch and generate its base proof.
    pub(crate) async fn try_generate_batch_proof(
        &self,
        prover: &dyn ProverClient,
    ) -> Result<bool> {
        debug!(prover_id = %prover.id(), "Batch proof generation pass");

        let (batch, mut proof) = match self.get_and_lock_batch_to_prove(prover).await {
            Ok(found) => found,
            Err(AggregatorError::NotFound) | Err(AggregatorError::NotProfitable) => {
                debug!("No batch pending to generate proof");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match self.generate_batch_proof(prover, &batch, &mut proof).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // The claim row has no payload worth keeping; drop it so the
                // batch can be claimed again.
                if let Err(e2) = self
                    .store
                    .delete_generated_proofs(proof.batch_number, proof.batch_number_final, None)
                    .await
                {
                    error!(error = %e2, "Failed to delete proof in progress");
                }
                Err(e)
            }
        }
    }

    async fn generate_batch_proof(
        &self,
        prover: &dyn ProverClient,
        batch: &Batch,
        proof: &mut Proof,
    ) -> Result<()> {
        info!(
            prover_id = %prover.id(),
            batch_number = batch.batch_number,
            "Generating proof for batch"
        );

        let input = self.build_input_prover(batch).await?;
        proof.input_prover = Some(serde_json::to_string(&input)?);

        info!(
            batch_number = batch.batch_number,
            "Sending batch witness to the prover"
        );
        let proof_id = prover.batch_proof(input).await?;
        proof.proof_id = Some(proof_id.clone());
        info!(batch_number = batch.batch_number, proof_id = %proof_id, "Batch proof id received");

        let recursive_proof = prover.wait_recursive_proof(&proof_id).await?;
        info!(proof_id = %proof_id, "Batch proof generated");
        proof.proof = Some(recursive_proof);
        self.metrics.batch_proof_generated();

        // The fresh proof may already be the one the contract expects next.
        let final_proof_built = self.try_build_final_proof(prover, Some(proof.clone())).await?;
        if !final_proof_built {
            proof.generating = false;
            self.store.update_generated_proof(proof, None).await?;
        }
        Ok(())
    }

    async fn get_and_lock_batch_to_prove(
        &self,
        prover: &dyn ProverClient,
    ) -> Result<(Batch, Proof)> {
        let _claim = self.store_mutex.lock().await;

        let last_verified = self.store.get_last_verified_batch(None).await?;
        let batch = self
            .store
            .get_virtual_batch_to_prove(last_verified.batch_number, None)
            .await?;

        info!(
            batch_number = batch.batch_number,
            "Found virtual batch pending to generate proof"
        );

        // The contract does not define an aggregator fee yet, so the check
        // runs with zero collateral.
        let batch_age = (Utc::now() - batch.timestamp).to_std().unwrap_or_default();
        if !self
            .profitability
            .is_profitable(U256::ZERO, batch_age)
            .await?
        {
            info!(
                batch_number = batch.batch_number,
                "Batch is not profitable to aggregate yet"
            );
            return Err(AggregatorError::NotProfitable);
        }

        let now = Utc::now();
        let proof = Proof {
            batch_number: batch.batch_number,
            batch_number_final: batch.batch_number,
            proof_id: None,
            proof: None,
            input_prover: None,
            prover: Some(prover.id()),
            generating: true,
            created_at: now,
            updated_at: now,
        };

        // Insert the claim row so no other session picks up the same batch.
        self.store.add_generated_proof(&proof, None).await?;

        Ok((batch, proof))
    }

    /// Fold two adjacent recursive proofs into one covering both ranges.
    pub(crate) async fn try_aggregate_proofs(&self, prover: &dyn ProverClient) -> Result<bool> {
        debug!(prover_id = %prover.id(), "Proof aggregation pass");

        let (proof1, proof2) = match self.get_and_lock_proofs_to_aggregate().await {
            Ok(pair) => pair,
            Err(e) if e.is_not_found() => {
                debug!("Nothing to aggregate");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut proof = match self.aggregate_proofs(prover, &proof1, &proof2).await {
            Ok(proof) => proof,
            Err(e) => {
                if let Err(e2) = self.unlock_proofs_to_aggregate(&proof1, &proof2).await {
                    error!(error = %e2, "Failed to release aggregated proofs");
                }
                return Err(e);
            }
        };

        // The inputs are gone and the new row is committed; from here on any
        // non-consumption outcome must release the new row instead.
        match self.try_build_final_proof(prover, Some(proof.clone())).await {
            Ok(true) => Ok(true),
            outcome => {
                proof.generating = false;
                self.store.update_generated_proof(&proof, None).await?;
                outcome.map(|_| true)
            }
        }
    }

    async fn aggregate_proofs(
        &self,
        prover: &dyn ProverClient,
        proof1: &Proof,
        proof2: &Proof,
    ) -> Result<Proof> {
        info!(
            prover_id = %prover.id(),
            batch_number_1 = proof1.batch_number,
            batch_number_final_1 = proof1.batch_number_final,
            batch_number_2 = proof2.batch_number,
            batch_number_final_2 = proof2.batch_number_final,
            "Aggregating proofs"
        );

        let payload1 = proof1.proof.as_deref().ok_or_else(|| {
            AggregatorError::Internal("aggregation input proof has no payload".to_string())
        })?;
        let payload2 = proof2.proof.as_deref().ok_or_else(|| {
            AggregatorError::Internal("aggregation input proof has no payload".to_string())
        })?;

        let input_prover = serde_json::json!({
            "recursive_proof_1": payload1,
            "recursive_proof_2": payload2,
        });

        let now = Utc::now();
        let mut proof = Proof {
            batch_number: proof1.batch_number,
            batch_number_final: proof2.batch_number_final,
            proof_id: None,
            proof: None,
            input_prover: Some(input_prover.to_string()),
            prover: Some(prover.id()),
            generating: true,
            created_at: now,
            updated_at: now,
        };

        let proof_id = prover.aggregated_proof(payload1, payload2).await?;
        proof.proof_id = Some(proof_id.clone());
        info!(
            batch_number = proof.batch_number,
            batch_number_final = proof.batch_number_final,
            proof_id = %proof_id,
            "Aggregated proof id received"
        );

        let recursive_proof = prover.wait_recursive_proof(&proof_id).await?;
        info!(proof_id = %proof_id, "Aggregated proof generated");
        proof.proof = Some(recursive_proof);

        // Swap the two inputs for the new wider proof atomically.
        let mut dbtx = self.store.begin_transaction().await?;
        let mut res = self
            .store
            .delete_generated_proofs(
                proof1.batch_number,
                proof2.batch_number_final,
                Some(&mut dbtx),
            )
            .await;
        if res.is_ok() {
            res = self.store.add_generated_proof(&proof, Some(&mut dbtx)).await;
        }
        if let Err(e) = res {
            if let Err(rb) = dbtx.rollback().await {
                warn!(error = %rb, "Failed to roll back proof aggregation");
            }
            return Err(e);
        }
        dbtx.commit().await?;

        self.metrics.aggregated_proof_generated();
        Ok(proof)
    }

    async fn get_and_lock_proofs_to_aggregate(&self) -> Result<(Proof, Proof)> {
        let _claim = self.store_mutex.lock().await;

        let (mut proof1, mut proof2) = self.store.get_proofs_to_aggregate(None).await?;

        // Stamp both rows as generating in a single transaction.
        let mut dbtx = self.store.begin_transaction().await?;
        proof1.generating = true;
        let mut res = self
            .store
            .update_generated_proof(&proof1, Some(&mut dbtx))
            .await;
        if res.is_ok() {
            proof2.generating = true;
            res = self
                .store
                .update_generated_proof(&proof2, Some(&mut dbtx))
                .await;
        }
        if let Err(e) = res {
            if let Err(rb) = dbtx.rollback().await {
                warn!(error = %rb, "Failed to roll back proof aggregation state");
            }
            return Err(e);
        }
        dbtx.commit().await?;

        Ok((proof1, proof2))
    }

    async fn unlock_proofs_to_aggregate(&self, proof1: &Proof, proof2: &Proof) -> Result<()> {
        let mut unlocked1 = proof1.clone();
        unlocked1.generating = false;
        let mut unlocked2 = proof2.clone();
        unlocked2.generating = false;

        let mut dbtx = self.store.begin_transaction().await?;
        let mut res = self
            .store
            .update_generated_proof(&unlocked1, Some(&mut dbtx))
            .await;
        if res.is_ok() {
            res = self
                .store
                .update_generated_proof(&unlocked2, Some(&mut dbtx))
                .await;
        }
        if let Err(e) = res {
            if let Err(rb) = dbtx.rollback().await {
                warn!(error = %rb, "Failed to roll back proof release");
            }
            return Err(e);
        }
        dbtx.commit().await?;
        Ok(())
    }

    /// Check whether `proof` (or a dormant ready proof when `None`) is
    /// eligible for finalization, and if so run the final wrapping proof and
    /// hand it to the dispatcher.
    pub(crate) async fn try_build_final_proof(
        &self,
        prover: &dyn ProverClient,
        proof: Option<Proof>,
    ) -> Result<bool> {
        debug!(prover_id = %prover.id(), "Final proof check");

        if !self.gate.can_verify_proof().await {
            debug!("Time to verify proof not reached");
            return Ok(false);
        }
        debug!("Send final proof time reached");

        // The gate token is held from here. Unless a final proof reaches the
        // dispatcher the token is given back on exit; after a handoff the
        // dispatcher is the sole clearer.
        let result = self.build_and_send_final_proof(prover, proof).await;
        if !matches!(result, Ok(true)) {
            self.gate.enable_proof_verification().await;
        }
        result
    }

    async fn build_and_send_final_proof(
        &self,
        prover: &dyn ProverClient,
        proof: Option<Proof>,
    ) -> Result<bool> {
        while !self.is_synced().await {
            info!("Waiting for synchronizer to sync...");
            if !self.sleep_retry().await {
                return Err(AggregatorError::Internal(
                    "interrupted while waiting for sync".to_string(),
                ));
            }
        }

        let last_verified_batch_number = match self.store.get_last_verified_batch(None).await {
            Ok(batch) => batch.batch_number,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        let (mut proof, locked_here) = match proof {
            Some(proof) => {
                // A proof generated moments ago by this session: check it is
                // the one the contract expects next.
                if !self
                    .validate_eligible_final_proof(&proof, last_verified_batch_number)
                    .await?
                {
                    return Ok(false);
                }
                (proof, false)
            }
            None => {
                match self
                    .get_and_lock_proof_ready_to_verify(last_verified_batch_number)
                    .await
                {
                    Ok(proof) => (proof, true),
                    Err(e) if e.is_not_found() => {
                        debug!("No proof ready to verify");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let final_proof = match self.build_final_proof(prover, &mut proof).await {
            Ok(final_proof) => final_proof,
            Err(e) => {
                if locked_here {
                    self.release_proof(&proof).await;
                }
                return Err(e);
            }
        };

        let msg = FinalProofMsg {
            prover_id: prover.id(),
            recursive_proof: proof.clone(),
            final_proof,
        };

        let signal = self.shutdown_signal();
        tokio::select! {
            _ = signal.cancelled() => {
                if locked_here {
                    self.release_proof(&proof).await;
                }
                return Err(AggregatorError::Internal(
                    "interrupted while handing off final proof".to_string(),
                ));
            }
            sent = self.final_proof_tx.send(msg) => {
                if sent.is_err() {
                    if locked_here {
                        self.release_proof(&proof).await;
                    }
                    return Err(AggregatorError::Internal(
                        "final proof dispatcher is gone".to_string(),
                    ));
                }
            }
        }

        debug!("Final proof handed to dispatcher");
        Ok(true)
    }

    pub(crate) async fn validate_eligible_final_proof(
        &self,
        proof: &Proof,
        last_verified_batch_number: u64,
    ) -> Result<bool> {
        let batch_number_to_verify = last_verified_batch_number + 1;
        if proof.batch_number != batch_number_to_verify {
            info!(
                batch_number = proof.batch_number,
                last_verified_batch_number,
                "Proof batch number is not the one following the last verified batch"
            );
            return Ok(false);
        }

        let complete = self
            .store
            .check_proof_contains_complete_sequences(proof, None)
            .await?;
        if !complete {
            info!(
                batch_number = proof.batch_number,
                batch_number_final = proof.batch_number_final,
                "Proof not eligible: does not contain complete sequences"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_and_lock_proof_ready_to_verify(
        &self,
        last_verified_batch_number: u64,
    ) -> Result<Proof> {
        let _claim = self.store_mutex.lock().await;

        let mut proof = self
            .store
            .get_proof_ready_to_verify(last_verified_batch_number, None)
            .await?;

        proof.generating = true;
        self.store.update_generated_proof(&proof, None).await?;

        Ok(proof)
    }

    async fn build_final_proof(
        &self,
        prover: &dyn ProverClient,
        proof: &mut Proof,
    ) -> Result<proto::FinalProof> {
        info!(
            prover_id = %prover.id(),
            batch_number = proof.batch_number,
            batch_number_final = proof.batch_number_final,
            "Generating final proof"
        );

        let aggregator_addr = self.l1.get_public_address().await?;
        let payload = proof.proof.as_deref().ok_or_else(|| {
            AggregatorError::Internal("proof has no payload to finalize".to_string())
        })?;

        let final_proof_id = prover
            .final_proof(payload, &aggregator_addr.to_string())
            .await?;
        proof.proof_id = Some(final_proof_id.clone());
        info!(proof_id = %final_proof_id, "Final proof id received");

        let mut final_proof = prover.wait_final_proof(&final_proof_id).await?;
        info!(proof_id = %final_proof_id, "Final proof generated");

        self.substitute_mocked_roots(&mut final_proof, proof.batch_number_final)
            .await?;

        Ok(final_proof)
    }

    /// The mock prover hands back fixed sentinel roots; replace them with the
    /// values captured by the executor. Substitution happens only when both
    /// roots match their sentinel.
    pub(crate) async fn substitute_mocked_roots(
        &self,
        final_proof: &mut proto::FinalProof,
        batch_number_final: u64,
    ) -> Result<()> {
        let Some(public) = final_proof.public.as_mut() else {
            return Ok(());
        };
        if public.new_state_root != MOCKED_STATE_ROOT.as_bytes()
            || public.new_local_exit_root != MOCKED_LOCAL_EXIT_ROOT.as_bytes()
        {
            return Ok(());
        }

        let batch = self
            .store
            .get_batch_by_number(batch_number_final, None)
            .await?;
        warn!(
            state_root = %batch.state_root,
            local_exit_root = %batch.local_exit_root,
            "Final proof roots look like mock values, using executor values instead"
        );
        public.new_state_root = batch.state_root.to_vec();
        public.new_local_exit_root = batch.local_exit_root.to_vec();
        Ok(())
    }

    /// Restore `generating = false` on a proof row, logging on failure.
    pub(crate) async fn release_proof(&self, proof: &Proof) {
        let mut unlocked = proof.clone();
        unlocked.generating = false;
        if let Err(e) = self.store.update_generated_proof(&unlocked, None).await {
            error!(
                batch_number = proof.batch_number,
                batch_number_final = proof.batch_number_final,
                error = %e,
                "Failed to release proof generating state"
            );
        }
    }

    /// Assemble the witness bundle for a base batch proof.
    pub(crate) async fn build_input_prover(&self, batch: &Batch) -> Result<proto::InputProver> {
        let previous_batch = self
            .store
            .get_batch_by_number(batch.batch_number - 1, None)
            .await?;
        let aggregator_addr = self.l1.get_public_address().await?;

        Ok(proto::InputProver {
            public_inputs: Some(proto::PublicInputs {
                old_state_root: previous_batch.state_root.to_vec(),
                old_acc_input_hash: previous_batch.acc_input_hash.to_vec(),
                old_batch_num: previous_batch.batch_number,
                chain_id: self.cfg.chain_id,
                batch_l2_data: batch.batch_l2_data.clone(),
                global_exit_root: batch.global_exit_root.to_vec(),
                eth_timestamp: batch.timestamp.timestamp() as u64,
                sequencer_addr: batch.coinbase.to_string(),
                aggregator_addr: aggregator_addr.to_string(),
            }),
            db: HashMap::new(),
            contracts_bytecode: HashMap::new(),
        })
    }
}
