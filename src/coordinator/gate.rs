//! Final-proof debounce gate.
//!
//! At most one prover session at a time may progress past the "should I
//! attempt a final proof?" check, and the deadline debounces attempts so the
//! aggregator prefers widening the covered range over spending L1 gas.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct GateState {
    time_send_final_proof: Instant,
    verifying_proof: bool,
}

/// Deadline plus single-token mutex controlling final-proof attempts.
pub struct FinalProofGate {
    verify_proof_interval: Duration,
    state: RwLock<GateState>,
}

impl FinalProofGate {
    pub fn new(verify_proof_interval: Duration) -> Self {
        Self {
            verify_proof_interval,
            state: RwLock::new(GateState {
                time_send_final_proof: Instant::now(),
                verifying_proof: false,
            }),
        }
    }

    /// Returns `true` and takes the verification token iff the deadline has
    /// passed and no other session holds the token.
    pub async fn can_verify_proof(&self) -> bool {
        let mut state = self.state.write().await;
        if state.time_send_final_proof <= Instant::now() {
            if state.verifying_proof {
                return false;
            }
            state.verifying_proof = true;
            return true;
        }
        false
    }

    /// Release the token without touching the deadline, allowing an immediate
    /// retry on the next pass.
    pub async fn enable_proof_verification(&self) {
        let mut state = self.state.write().await;
        state.verifying_proof = false;
    }

    /// Release the token and push the deadline out by the configured
    /// interval.
    pub async fn reset_verify_proof_time(&self) {
        let mut state = self.state.write().await;
        state.verifying_proof = false;
        state.time_send_final_proof = Instant::now() + self.verify_proof_interval;
    }
}
