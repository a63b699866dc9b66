//! Metrics for the aggregation coordinator.
//!
//! Plain atomic counters and gauges, snapshotted on demand. Owned by the
//! coordinator value rather than registered globally.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters and gauges tracked by the coordinator.
#[derive(Debug, Default)]
pub struct Metrics {
    connected_provers: AtomicU64,
    batch_proofs_generated: AtomicU64,
    aggregated_proofs_generated: AtomicU64,
    final_proofs_verified: AtomicU64,
    verify_batches_failures: AtomicU64,
}

/// Point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connected_provers: u64,
    pub batch_proofs_generated: u64,
    pub aggregated_proofs_generated: u64,
    pub final_proofs_verified: u64,
    pub verify_batches_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prover_connected(&self) {
        self.connected_provers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn prover_disconnected(&self) {
        self.connected_provers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn batch_proof_generated(&self) {
        self.batch_proofs_generated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn aggregated_proof_generated(&self) {
        self.aggregated_proofs_generated
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn final_proof_verified(&self) {
        self.final_proofs_verified.fetch_add(1, Ordering::SeqCst);
    }

    pub fn verify_batches_failed(&self) {
        self.verify_batches_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connected_provers: self.connected_provers.load(Ordering::SeqCst),
            batch_proofs_generated: self.batch_proofs_generated.load(Ordering::SeqCst),
            aggregated_proofs_generated: self.aggregated_proofs_generated.load(Ordering::SeqCst),
            final_proofs_verified: self.final_proofs_verified.load(Ordering::SeqCst),
            verify_batches_failures: self.verify_batches_failures.load(Ordering::SeqCst),
        }
    }
}
