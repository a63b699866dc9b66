//! Scenario tests for the proof pipeline, scheduler, and dispatcher.
//!
//! An in-memory proof store fake backs the end-to-end scenarios; mock-based
//! tests pin down the lock discipline on error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{Batch, FinalProofInputs, Proof, VerifiedBatch};
use crate::infra::{
    AggregatorError, EthTxManager, L1Client, MockEthTxManager, MockL1Client, MockProofStore,
    MockProverClient, ProofStore, ProverClient, Result, StoreTx,
};
use crate::proto;
use crate::server::Config;

use super::pipeline::{MOCKED_LOCAL_EXIT_ROOT, MOCKED_STATE_ROOT};
use super::policy::{MockProfitabilityChecker, TxProfitabilityCheckerAcceptAll};
use super::{Coordinator, ProfitabilityCheckerType};

// ------------------------------------------------------------------------
// Fixtures
// ------------------------------------------------------------------------

fn test_config(verify_proof_interval: Duration) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: String::new(),
        max_connections: 1,
        chain_id: 1001,
        retry_time: Duration::from_millis(10),
        verify_proof_interval,
        proof_state_polling_interval: Duration::from_millis(10),
        interval_after_which_batch_consolidate_anyway: Duration::from_secs(3600),
        tx_profitability_checker: ProfitabilityCheckerType::AcceptAll,
        tx_profitability_min_reward: U256::ZERO,
    }
}

fn batch(batch_number: u64) -> Batch {
    Batch {
        batch_number,
        coinbase: Address::repeat_byte(0x11),
        batch_l2_data: vec![batch_number as u8],
        state_root: B256::repeat_byte(batch_number as u8),
        local_exit_root: B256::repeat_byte(0x22),
        acc_input_hash: B256::repeat_byte(0x33),
        global_exit_root: B256::repeat_byte(0x44),
        timestamp: Utc::now(),
    }
}

fn verified(batch_number: u64) -> VerifiedBatch {
    VerifiedBatch {
        batch_number,
        tx_hash: B256::ZERO,
        aggregator: Address::ZERO,
        block_number: 0,
    }
}

fn dormant_proof(from: u64, to: u64) -> Proof {
    let now = Utc::now();
    Proof {
        batch_number: from,
        batch_number_final: to,
        proof_id: Some(format!("proof-{from}-{to}")),
        proof: Some(format!("recursive-{from}-{to}")),
        input_prover: None,
        prover: Some("seed".to_string()),
        generating: false,
        created_at: now,
        updated_at: now,
    }
}

// ------------------------------------------------------------------------
// In-memory fakes
// ------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    proofs: Vec<Proof>,
    batches: BTreeMap<u64, Batch>,
    virtual_batches: BTreeSet<u64>,
    verified_batches: BTreeMap<u64, VerifiedBatch>,
    sequences: Vec<(u64, u64)>,
}

#[derive(Default)]
struct FakeProofStore {
    state: StdMutex<FakeState>,
}

impl FakeProofStore {
    fn seed_batch(&self, b: Batch) {
        self.state
            .lock()
            .unwrap()
            .batches
            .insert(b.batch_number, b);
    }

    fn seed_virtual(&self, batch_number: u64) {
        self.state
            .lock()
            .unwrap()
            .virtual_batches
            .insert(batch_number);
    }

    fn seed_verified(&self, batch_number: u64) {
        self.state
            .lock()
            .unwrap()
            .verified_batches
            .insert(batch_number, verified(batch_number));
    }

    fn seed_sequence(&self, from: u64, to: u64) {
        self.state.lock().unwrap().sequences.push((from, to));
    }

    fn seed_proof(&self, proof: Proof) {
        self.state.lock().unwrap().proofs.push(proof);
    }

    fn proofs(&self) -> Vec<Proof> {
        self.state.lock().unwrap().proofs.clone()
    }

    fn contains_complete_sequences(state: &FakeState, proof: &Proof) -> bool {
        state
            .sequences
            .iter()
            .any(|(from, _)| *from == proof.batch_number)
            && state
                .sequences
                .iter()
                .any(|(_, to)| *to == proof.batch_number_final)
    }
}

#[async_trait]
impl ProofStore for FakeProofStore {
    async fn begin_transaction(&self) -> Result<StoreTx> {
        Ok(StoreTx::noop())
    }

    async fn delete_ungenerated_proofs<'a>(&self, _dbtx: Option<&'a mut StoreTx>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .proofs
            .retain(|p| p.proof.is_some());
        Ok(())
    }

    async fn get_last_verified_batch<'a>(&self, _dbtx: Option<&'a mut StoreTx>) -> Result<VerifiedBatch> {
        self.state
            .lock()
            .unwrap()
            .verified_batches
            .values()
            .next_back()
            .cloned()
            .ok_or(AggregatorError::NotFound)
    }

    async fn get_virtual_batch_to_prove<'a>(
        &self,
        last_verified_batch_number: u64,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch> {
        let state = self.state.lock().unwrap();
        for vb in &state.virtual_batches {
            if *vb <= last_verified_batch_number {
                continue;
            }
            let covered = state
                .proofs
                .iter()
                .any(|p| p.batch_number <= *vb && *vb <= p.batch_number_final);
            if !covered {
                return state.batches.get(vb).cloned().ok_or(AggregatorError::NotFound);
            }
        }
        Err(AggregatorError::NotFound)
    }

    async fn get_batch_by_number<'a>(
        &self,
        batch_number: u64,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Batch> {
        self.state
            .lock()
            .unwrap()
            .batches
            .get(&batch_number)
            .cloned()
            .ok_or(AggregatorError::NotFound)
    }

    async fn get_proof_ready_to_verify<'a>(
        &self,
        last_verified_batch_number: u64,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<Proof> {
        let state = self.state.lock().unwrap();
        state
            .proofs
            .iter()
            .find(|p| {
                p.batch_number == last_verified_batch_number + 1
                    && !p.generating
                    && Self::contains_complete_sequences(&state, p)
            })
            .cloned()
            .ok_or(AggregatorError::NotFound)
    }

    async fn get_proofs_to_aggregate<'a>(
        &self,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<(Proof, Proof)> {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<&Proof> =
            state.proofs.iter().filter(|p| !p.generating).collect();
        candidates.sort_by_key(|p| p.batch_number);
        for p1 in &candidates {
            if let Some(p2) = candidates
                .iter()
                .find(|p| p.batch_number == p1.batch_number_final + 1)
            {
                return Ok(((*p1).clone(), (*p2).clone()));
            }
        }
        Err(AggregatorError::NotFound)
    }

    async fn check_proof_contains_complete_sequences<'a>(
        &self,
        proof: &Proof,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(Self::contains_complete_sequences(&state, proof))
    }

    async fn add_generated_proof<'a>(&self, proof: &Proof, _dbtx: Option<&'a mut StoreTx>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.proofs.iter().any(|p| {
            p.batch_number == proof.batch_number && p.batch_number_final == proof.batch_number_final
        }) {
            return Err(AggregatorError::Internal("duplicate proof row".to_string()));
        }
        state.proofs.push(proof.clone());
        Ok(())
    }

    async fn update_generated_proof<'a>(
        &self,
        proof: &Proof,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.proofs.iter_mut().find(|p| {
            p.batch_number == proof.batch_number && p.batch_number_final == proof.batch_number_final
        }) {
            *row = proof.clone();
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_generated_proofs<'a>(
        &self,
        batch_number: u64,
        batch_number_final: u64,
        _dbtx: Option<&'a mut StoreTx>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .proofs
            .retain(|p| !(p.batch_number >= batch_number && p.batch_number_final <= batch_number_final));
        Ok(())
    }
}

struct FakeProver {
    id: String,
    next: AtomicU64,
    final_state_root: Vec<u8>,
    final_local_exit_root: Vec<u8>,
}

impl FakeProver {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            next: AtomicU64::new(1),
            final_state_root: B256::repeat_byte(0xaa).to_vec(),
            final_local_exit_root: B256::repeat_byte(0xbb).to_vec(),
        }
    }

    /// A prover that answers final proofs with the mock sentinel roots.
    fn with_mocked_roots(id: &str) -> Self {
        Self {
            final_state_root: MOCKED_STATE_ROOT.as_bytes().to_vec(),
            final_local_exit_root: MOCKED_LOCAL_EXIT_ROOT.as_bytes().to_vec(),
            ..Self::new(id)
        }
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{}-{kind}-{}", self.id, self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ProverClient for FakeProver {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn addr(&self) -> String {
        "fake".to_string()
    }

    async fn is_idle(&self) -> Result<bool> {
        Ok(true)
    }

    async fn batch_proof(&self, _input: proto::InputProver) -> Result<String> {
        Ok(self.next_id("batch"))
    }

    async fn aggregated_proof(
        &self,
        _recursive_proof_1: &str,
        _recursive_proof_2: &str,
    ) -> Result<String> {
        Ok(self.next_id("agg"))
    }

    async fn final_proof(&self, _recursive_proof: &str, _aggregator_addr: &str) -> Result<String> {
        Ok(self.next_id("final"))
    }

    async fn wait_recursive_proof(&self, proof_id: &str) -> Result<String> {
        Ok(format!("recursive({proof_id})"))
    }

    async fn wait_final_proof(&self, proof_id: &str) -> Result<proto::FinalProof> {
        Ok(proto::FinalProof {
            proof: format!("final({proof_id})"),
            public: Some(proto::PublicInputsExtended {
                public_inputs: None,
                new_state_root: self.final_state_root.clone(),
                new_local_exit_root: self.final_local_exit_root.clone(),
            }),
        })
    }
}

#[derive(Default)]
struct FakeEthTxManager {
    calls: StdMutex<Vec<(u64, u64, FinalProofInputs)>>,
    failures_remaining: AtomicUsize,
}

impl FakeEthTxManager {
    fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(u64, u64, FinalProofInputs)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EthTxManager for FakeEthTxManager {
    async fn verify_batches(
        &self,
        last_verified_batch: u64,
        new_verified_batch: u64,
        inputs: &FinalProofInputs,
    ) -> Result<B256> {
        self.calls
            .lock()
            .unwrap()
            .push((last_verified_batch, new_verified_batch, inputs.clone()));
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(AggregatorError::Ethereum("forced failure".to_string()));
        }
        Ok(B256::repeat_byte(0xfe))
    }
}

struct FakeL1 {
    latest_verified: AtomicU64,
    address: Address,
}

impl FakeL1 {
    fn new(latest_verified: u64) -> Self {
        Self {
            latest_verified: AtomicU64::new(latest_verified),
            address: Address::repeat_byte(0x99),
        }
    }

    fn set_latest(&self, latest_verified: u64) {
        self.latest_verified.store(latest_verified, Ordering::SeqCst);
    }
}

#[async_trait]
impl L1Client for FakeL1 {
    async fn get_latest_verified_batch_num(&self) -> Result<u64> {
        Ok(self.latest_verified.load(Ordering::SeqCst))
    }

    async fn get_public_address(&self) -> Result<Address> {
        Ok(self.address)
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    store: Arc<FakeProofStore>,
    eth: Arc<FakeEthTxManager>,
    l1: Arc<FakeL1>,
}

/// Build a coordinator over the fakes with its dispatcher running. The gate
/// window starts open; tests that need a closed gate reset it explicitly.
fn harness(verify_proof_interval: Duration) -> Harness {
    let store = Arc::new(FakeProofStore::default());
    let eth = Arc::new(FakeEthTxManager::default());
    let l1 = Arc::new(FakeL1::new(10));

    let coordinator = Arc::new(Coordinator::new(
        test_config(verify_proof_interval),
        store.clone(),
        eth.clone(),
        l1.clone(),
        Arc::new(TxProfitabilityCheckerAcceptAll),
    ));

    let rx = coordinator
        .final_proof_rx
        .lock()
        .unwrap()
        .take()
        .expect("dispatcher receiver");
    let dispatcher = coordinator.clone();
    tokio::spawn(async move { dispatcher.run_final_proof_dispatcher(rx).await });

    Harness {
        coordinator,
        store,
        eth,
        l1,
    }
}

async fn wait_until(timeout_ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ------------------------------------------------------------------------
// Scenarios
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_single_batch_path() {
    let h = harness(Duration::ZERO);
    h.store.seed_batch(batch(10));
    h.store.seed_batch(batch(11));
    h.store.seed_virtual(11);
    h.store.seed_verified(10);
    h.store.seed_sequence(11, 11);
    h.l1.set_latest(10);

    let prover = FakeProver::new("prover-1");
    let produced = h
        .coordinator
        .try_generate_batch_proof(&prover)
        .await
        .unwrap();
    assert!(produced);

    // The proof is elevated to final immediately and settled by the
    // dispatcher: verify_batches(10, 11, ...) then the row is pruned.
    assert!(wait_until(2000, || h.eth.calls().len() == 1).await);
    let (init, fin, _) = h.eth.calls()[0].clone();
    assert_eq!((init, fin), (10, 11));
    assert!(wait_until(2000, || h.store.proofs().is_empty()).await);
}

#[tokio::test]
async fn test_generated_proof_stays_dormant_when_gate_closed() {
    let h = harness(Duration::from_secs(3600));
    h.coordinator.gate.reset_verify_proof_time().await;

    h.store.seed_batch(batch(10));
    h.store.seed_batch(batch(11));
    h.store.seed_virtual(11);
    h.store.seed_verified(10);
    h.store.seed_sequence(11, 11);

    let prover = FakeProver::new("prover-1");
    let produced = h
        .coordinator
        .try_generate_batch_proof(&prover)
        .await
        .unwrap();
    assert!(produced);

    let proofs = h.store.proofs();
    assert_eq!(proofs.len(), 1);
    assert_eq!(
        (proofs[0].batch_number, proofs[0].batch_number_final),
        (11, 11)
    );
    assert!(!proofs[0].generating);
    assert!(proofs[0].proof.is_some());
    // The witness bundle is kept for audit.
    let input_prover = proofs[0].input_prover.as_deref().unwrap();
    assert!(input_prover.contains("old_batch_num"));
    assert!(h.eth.calls().is_empty());
}

#[tokio::test]
async fn test_aggregation_before_finalization() {
    let h = harness(Duration::from_millis(400));
    // Close the gate: aggregation happens first, finalization only after the
    // debounce elapses.
    h.coordinator.gate.reset_verify_proof_time().await;

    h.store.seed_batch(batch(11));
    h.store.seed_batch(batch(12));
    h.store.seed_verified(10);
    h.store.seed_sequence(11, 11);
    h.store.seed_sequence(12, 12);
    h.store.seed_proof(dormant_proof(11, 11));
    h.store.seed_proof(dormant_proof(12, 12));

    let prover = FakeProver::new("prover-1");
    let produced = h.coordinator.try_aggregate_proofs(&prover).await.unwrap();
    assert!(produced);

    // Both inputs replaced by the wider proof, left unlocked; no L1 call yet.
    let proofs = h.store.proofs();
    assert_eq!(proofs.len(), 1);
    assert_eq!(
        (proofs[0].batch_number, proofs[0].batch_number_final),
        (11, 12)
    );
    assert!(!proofs[0].generating);
    assert!(h.eth.calls().is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;

    let produced = h
        .coordinator
        .try_build_final_proof(&prover, None)
        .await
        .unwrap();
    assert!(produced);

    assert!(wait_until(2000, || h.eth.calls().len() == 1).await);
    let (init, fin, _) = h.eth.calls()[0].clone();
    assert_eq!((init, fin), (10, 12));
    assert!(wait_until(2000, || h.store.proofs().is_empty()).await);
}

#[tokio::test]
async fn test_two_provers_race_for_aggregations() {
    let h = harness(Duration::from_secs(3600));
    h.coordinator.gate.reset_verify_proof_time().await;

    h.store.seed_verified(10);
    for n in 11..=16 {
        h.store.seed_proof(dormant_proof(n, n));
    }

    let c1 = h.coordinator.clone();
    let t1 = tokio::spawn(async move {
        let prover = FakeProver::new("prover-1");
        while c1.try_aggregate_proofs(&prover).await.unwrap() {}
    });
    let c2 = h.coordinator.clone();
    let t2 = tokio::spawn(async move {
        let prover = FakeProver::new("prover-2");
        while c2.try_aggregate_proofs(&prover).await.unwrap() {}
    });
    t1.await.unwrap();
    t2.await.unwrap();

    // No pair aggregated twice, nothing left claimed, ranges disjoint and
    // fully covering 11..=16. With both loops running to quiescence the
    // proofs fold all the way down to a single range.
    let proofs = h.store.proofs();
    assert!(proofs.iter().all(|p| !p.generating));
    let mut covered: Vec<u64> = proofs
        .iter()
        .flat_map(|p| p.batch_number..=p.batch_number_final)
        .collect();
    covered.sort_unstable();
    assert_eq!(covered, (11..=16).collect::<Vec<u64>>());
    assert_eq!(proofs.len(), 1);
    assert!(h.eth.calls().is_empty());
}

#[tokio::test]
async fn test_l1_submission_failure_releases_proof_and_gate() {
    let h = harness(Duration::from_secs(600));
    h.store.seed_batch(batch(11));
    h.store.seed_batch(batch(12));
    h.store.seed_verified(10);
    h.store.seed_sequence(11, 12);
    h.store.seed_proof(dormant_proof(11, 12));
    h.eth.fail_next(1);

    let prover = FakeProver::new("prover-1");
    let produced = h
        .coordinator
        .try_build_final_proof(&prover, None)
        .await
        .unwrap();
    assert!(produced);

    // Submission fails: the proof row is restored to generating = false and
    // the gate re-opens immediately, no debounce wait.
    assert!(wait_until(2000, || h.eth.calls().len() == 1).await);
    assert!(
        wait_until(2000, || {
            let proofs = h.store.proofs();
            proofs.len() == 1 && !proofs[0].generating
        })
        .await
    );
    let mut reopened = false;
    for _ in 0..200 {
        // can_verify_proof takes the token when it succeeds; give it back.
        if h.coordinator.gate.can_verify_proof().await {
            h.coordinator.gate.enable_proof_verification().await;
            reopened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(reopened, "gate should re-open right after a submission failure");

    // The retry succeeds and the proof is pruned.
    let produced = h
        .coordinator
        .try_build_final_proof(&prover, None)
        .await
        .unwrap();
    assert!(produced);
    assert!(wait_until(2000, || h.eth.calls().len() == 2).await);
    assert!(wait_until(2000, || h.store.proofs().is_empty()).await);

    // After a successful settlement the gate stays shut for the full
    // debounce interval.
    assert!(!h.coordinator.gate.can_verify_proof().await);
}

#[tokio::test]
async fn test_mock_prover_sentinel_roots_are_substituted() {
    let h = harness(Duration::ZERO);
    h.store.seed_batch(batch(10));
    h.store.seed_batch(batch(11));
    h.store.seed_verified(10);
    h.store.seed_sequence(11, 11);
    h.store.seed_proof(dormant_proof(11, 11));

    let prover = FakeProver::with_mocked_roots("prover-1");
    let produced = h
        .coordinator
        .try_build_final_proof(&prover, None)
        .await
        .unwrap();
    assert!(produced);

    assert!(wait_until(2000, || h.eth.calls().len() == 1).await);
    let (_, _, inputs) = h.eth.calls()[0].clone();
    let public = inputs.final_proof.public.unwrap();
    assert_eq!(public.new_state_root, batch(11).state_root.to_vec());
    assert_eq!(
        public.new_local_exit_root,
        batch(11).local_exit_root.to_vec()
    );
}

#[tokio::test]
async fn test_sentinel_substitution_requires_both_roots() {
    let h = harness(Duration::ZERO);
    h.store.seed_batch(batch(11));

    // Only the state root matches the sentinel: nothing is replaced.
    let mut final_proof = proto::FinalProof {
        proof: "final".to_string(),
        public: Some(proto::PublicInputsExtended {
            public_inputs: None,
            new_state_root: MOCKED_STATE_ROOT.as_bytes().to_vec(),
            new_local_exit_root: b"not-a-sentinel".to_vec(),
        }),
    };
    h.coordinator
        .substitute_mocked_roots(&mut final_proof, 11)
        .await
        .unwrap();
    let public = final_proof.public.unwrap();
    assert_eq!(public.new_state_root, MOCKED_STATE_ROOT.as_bytes());
    assert_eq!(public.new_local_exit_root, b"not-a-sentinel".to_vec());
}

#[tokio::test]
async fn test_final_proof_waits_for_sync_barrier() {
    let h = harness(Duration::ZERO);
    h.store.seed_batch(batch(12));
    h.store.seed_batch(batch(13));
    h.store.seed_verified(10);
    h.store.seed_sequence(13, 13);
    h.store.seed_proof(dormant_proof(13, 13));
    // The chain is ahead of the local state: barrier must hold.
    h.l1.set_latest(12);

    let c = h.coordinator.clone();
    let attempt = tokio::spawn(async move {
        let prover = FakeProver::new("prover-1");
        c.try_build_final_proof(&prover, None).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.eth.calls().is_empty());

    // The synchronizer catches up; the attempt proceeds with frontier 12.
    h.store.seed_verified(12);
    let produced = attempt.await.unwrap().unwrap();
    assert!(produced);

    assert!(wait_until(2000, || h.eth.calls().len() == 1).await);
    let (init, fin, _) = h.eth.calls()[0].clone();
    assert_eq!((init, fin), (12, 13));
}

#[tokio::test]
async fn test_eligibility_rejects_non_frontier_proof() {
    let h = harness(Duration::ZERO);
    h.store.seed_sequence(12, 12);

    // last verified = 10, so only batch 11 is eligible next.
    let eligible = h
        .coordinator
        .validate_eligible_final_proof(&dormant_proof(12, 12), 10)
        .await
        .unwrap();
    assert!(!eligible);

    h.store.seed_sequence(11, 11);
    let eligible = h
        .coordinator
        .validate_eligible_final_proof(&dormant_proof(11, 11), 10)
        .await
        .unwrap();
    assert!(eligible);
}

#[tokio::test]
async fn test_startup_sweep_is_idempotent() {
    let store = FakeProofStore::default();
    let mut ungenerated = dormant_proof(11, 11);
    ungenerated.proof = None;
    ungenerated.generating = true;
    store.seed_proof(ungenerated);
    store.seed_proof(dormant_proof(12, 12));

    store.delete_ungenerated_proofs(None).await.unwrap();
    assert_eq!(store.proofs().len(), 1);
    assert_eq!(store.proofs()[0].batch_number, 12);

    store.delete_ungenerated_proofs(None).await.unwrap();
    assert_eq!(store.proofs().len(), 1);
}

#[tokio::test]
async fn test_scheduler_exits_when_stream_dies() {
    let h = harness(Duration::from_secs(3600));
    h.coordinator.gate.reset_verify_proof_time().await;

    let mut prover = MockProverClient::new();
    prover.expect_id().return_const("prover-1".to_string());
    prover.expect_addr().return_const("1.2.3.4:5".to_string());
    let mut seq = mockall::Sequence::new();
    prover
        .expect_is_idle()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Ok(false));
    prover
        .expect_is_idle()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Err(AggregatorError::ProverChannelClosed));

    let prover: Arc<dyn ProverClient> = Arc::new(prover);
    tokio::time::timeout(
        Duration::from_secs(5),
        h.coordinator.run_channel(prover),
    )
    .await
    .expect("scheduler loop should exit once the stream dies");

    assert_eq!(h.coordinator.metrics().snapshot().connected_provers, 0);
}

// ------------------------------------------------------------------------
// Lock discipline on error paths (mock-based)
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_aggregation_abort_restores_input_locks() {
    let updates: Arc<StdMutex<Vec<(u64, bool)>>> = Arc::new(StdMutex::new(Vec::new()));

    let mut store = MockProofStore::new();
    store
        .expect_get_proofs_to_aggregate()
        .times(1)
        .returning(|_| Ok((dormant_proof(11, 11), dormant_proof(12, 12))));
    store
        .expect_begin_transaction()
        .returning(|| Ok(StoreTx::noop()));
    let updates_log = updates.clone();
    store
        .expect_update_generated_proof()
        .returning(move |proof, _| {
            updates_log
                .lock()
                .unwrap()
                .push((proof.batch_number, proof.generating));
            Ok(())
        });
    store
        .expect_delete_generated_proofs()
        .times(1)
        .returning(|_, _, _| Ok(()));
    // The insert of the aggregated row aborts the transaction.
    store
        .expect_add_generated_proof()
        .times(1)
        .returning(|_, _| Err(AggregatorError::Internal("forced abort".to_string())));

    let mut prover = MockProverClient::new();
    prover.expect_id().return_const("prover-1".to_string());
    prover
        .expect_aggregated_proof()
        .returning(|_, _| Ok("agg-1".to_string()));
    prover
        .expect_wait_recursive_proof()
        .returning(|_| Ok("recursive(agg-1)".to_string()));

    let coordinator = Coordinator::new(
        test_config(Duration::ZERO),
        Arc::new(store),
        Arc::new(MockEthTxManager::new()),
        Arc::new(MockL1Client::new()),
        Arc::new(TxProfitabilityCheckerAcceptAll),
    );

    let err = coordinator.try_aggregate_proofs(&prover).await.unwrap_err();
    assert!(matches!(err, AggregatorError::Internal(_)));

    // Both inputs were stamped generating and then released again.
    assert_eq!(
        updates.lock().unwrap().clone(),
        vec![(11, true), (12, true), (11, false), (12, false)]
    );
}

#[tokio::test]
async fn test_unprofitable_batch_claims_nothing() {
    let mut store = MockProofStore::new();
    store
        .expect_get_last_verified_batch()
        .returning(|_| Ok(verified(10)));
    store
        .expect_get_virtual_batch_to_prove()
        .returning(|_, _| Ok(batch(11)));
    // No add_generated_proof expectation: claiming a row would fail the test.

    let mut policy = MockProfitabilityChecker::new();
    policy.expect_is_profitable().returning(|_, _| Ok(false));

    let mut prover = MockProverClient::new();
    prover.expect_id().return_const("prover-1".to_string());

    let coordinator = Coordinator::new(
        test_config(Duration::ZERO),
        Arc::new(store),
        Arc::new(MockEthTxManager::new()),
        Arc::new(MockL1Client::new()),
        Arc::new(policy),
    );

    let produced = coordinator
        .try_generate_batch_proof(&prover)
        .await
        .unwrap();
    assert!(!produced);
}

#[tokio::test]
async fn test_batch_proof_failure_deletes_claim_row() {
    let deletes: Arc<StdMutex<Vec<(u64, u64)>>> = Arc::new(StdMutex::new(Vec::new()));

    let mut store = MockProofStore::new();
    store
        .expect_get_last_verified_batch()
        .returning(|_| Ok(verified(10)));
    store
        .expect_get_virtual_batch_to_prove()
        .returning(|_, _| Ok(batch(11)));
    store
        .expect_get_batch_by_number()
        .returning(|_, _| Ok(batch(10)));
    store.expect_add_generated_proof().returning(|_, _| Ok(()));
    let deletes_log = deletes.clone();
    store
        .expect_delete_generated_proofs()
        .times(1)
        .returning(move |from, to, _| {
            deletes_log.lock().unwrap().push((from, to));
            Ok(())
        });

    let mut policy = MockProfitabilityChecker::new();
    policy.expect_is_profitable().returning(|_, _| Ok(true));

    let mut l1 = MockL1Client::new();
    l1.expect_get_public_address()
        .returning(|| Ok(Address::repeat_byte(0x99)));

    let mut prover = MockProverClient::new();
    prover.expect_id().return_const("prover-1".to_string());
    prover
        .expect_batch_proof()
        .returning(|_| Err(AggregatorError::Prover("prover crashed".to_string())));

    let coordinator = Coordinator::new(
        test_config(Duration::ZERO),
        Arc::new(store),
        Arc::new(MockEthTxManager::new()),
        Arc::new(l1),
        Arc::new(policy),
    );

    let err = coordinator
        .try_generate_batch_proof(&prover)
        .await
        .unwrap_err();
    assert!(matches!(err, AggregatorError::Prover(_)));
    assert_eq!(deletes.lock().unwrap().clone(), vec![(11, 11)]);
}
