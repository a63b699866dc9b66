//! Per-session dispatch loop.
//!
//! One loop runs for every connected prover. Each pass first checks whether a
//! dormant proof can be elevated to a final proof, then tries to aggregate,
//! then to generate a fresh batch proof. Errors are logged and never
//! terminate the loop; only shutdown or stream termination does.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::infra::ProverClient;

use super::Coordinator;

impl Coordinator {
    /// Drive one prover session until shutdown or the stream dies.
    pub async fn run_channel(&self, prover: Arc<dyn ProverClient>) {
        self.metrics.prover_connected();
        info!(prover_id = %prover.id(), addr = %prover.addr(), "Prover connected");

        loop {
            if self.shutdown_signal().is_shutdown() {
                break;
            }

            let idle = match prover.is_idle().await {
                Ok(idle) => idle,
                Err(e) => {
                    warn!(prover_id = %prover.id(), error = %e, "Prover status check failed, closing session");
                    break;
                }
            };
            if !idle {
                debug!(prover_id = %prover.id(), addr = %prover.addr(), "Prover is not idle");
                if !self.sleep_retry().await {
                    break;
                }
                continue;
            }

            // A dormant proof may have become ready to verify.
            if let Err(e) = self.try_build_final_proof(prover.as_ref(), None).await {
                error!(error = %e, "Error checking proofs to verify");
            }

            let mut proof_generated = match self.try_aggregate_proofs(prover.as_ref()).await {
                Ok(generated) => generated,
                Err(e) => {
                    error!(error = %e, "Error trying to aggregate proofs");
                    false
                }
            };
            if !proof_generated {
                proof_generated = match self.try_generate_batch_proof(prover.as_ref()).await {
                    Ok(generated) => generated,
                    Err(e) => {
                        error!(error = %e, "Error trying to generate batch proof");
                        false
                    }
                };
            }
            if !proof_generated {
                // Nothing produced this pass; back off. A produced proof
                // usually means more work is queued, so retry immediately.
                if !self.sleep_retry().await {
                    break;
                }
            }
        }

        self.metrics.prover_disconnected();
        info!(prover_id = %prover.id(), "Prover session closed");
    }
}
