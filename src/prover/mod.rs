//! Prover session over the bidirectional gRPC stream.
//!
//! The aggregator is the caller on this channel: it pushes a request message
//! and waits for the prover's response with the matching correlation id.
//! RPCs are strictly sequential per session; the channel lock enforces it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tonic::{Status, Streaming};
use tracing::debug;

use crate::infra::{AggregatorError, ProverClient, Result, ShutdownSignal};
use crate::proto::{
    aggregator_message, get_proof_response, get_status_response, prover_message,
    AggregatorMessage, ProverMessage,
};
use crate::proto;

struct SessionChannel {
    outbound: mpsc::Sender<std::result::Result<AggregatorMessage, Status>>,
    inbound: Streaming<ProverMessage>,
}

/// One accepted prover connection.
pub struct ProverSession {
    id: String,
    addr: Option<SocketAddr>,
    polling_interval: Duration,
    channel: Mutex<SessionChannel>,
    next_msg_id: AtomicU64,
    shutdown: ShutdownSignal,
}

impl ProverSession {
    /// Bind a session to an accepted stream and run the status handshake to
    /// learn the prover's id.
    pub async fn connect(
        outbound: mpsc::Sender<std::result::Result<AggregatorMessage, Status>>,
        inbound: Streaming<ProverMessage>,
        addr: Option<SocketAddr>,
        polling_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let mut session = Self {
            id: String::new(),
            addr,
            polling_interval,
            channel: Mutex::new(SessionChannel { outbound, inbound }),
            next_msg_id: AtomicU64::new(1),
            shutdown,
        };

        let status = session.get_status().await?;
        if status.prover_id.is_empty() {
            return Err(AggregatorError::Prover(
                "prover did not report an id".to_string(),
            ));
        }
        session.id = status.prover_id;

        Ok(session)
    }

    /// Push one request down the stream and wait for its response.
    async fn call(
        &self,
        request: aggregator_message::Request,
    ) -> Result<prover_message::Response> {
        let mut channel = self.channel.lock().await;

        let id = self.next_msg_id.fetch_add(1, Ordering::SeqCst).to_string();
        channel
            .outbound
            .send(Ok(AggregatorMessage {
                id: id.clone(),
                request: Some(request),
            }))
            .await
            .map_err(|_| AggregatorError::ProverChannelClosed)?;

        let message = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(AggregatorError::Internal(
                    "interrupted while awaiting prover response".to_string(),
                ));
            }
            message = channel.inbound.message() => message
                .map_err(|e| AggregatorError::Prover(format!("stream receive failed: {e}")))?,
        };
        let message = message.ok_or(AggregatorError::ProverChannelClosed)?;

        if message.id != id {
            return Err(AggregatorError::Prover(format!(
                "response id mismatch: expected {id}, got {}",
                message.id
            )));
        }
        message
            .response
            .ok_or_else(|| AggregatorError::Prover("empty response".to_string()))
    }

    async fn get_status(&self) -> Result<proto::GetStatusResponse> {
        match self
            .call(aggregator_message::Request::GetStatusRequest(
                proto::GetStatusRequest {},
            ))
            .await?
        {
            prover_message::Response::GetStatusResponse(response) => Ok(response),
            other => Err(unexpected_response("GetStatus", &other)),
        }
    }

    async fn get_proof(&self, proof_id: &str) -> Result<proto::GetProofResponse> {
        match self
            .call(aggregator_message::Request::GetProofRequest(
                proto::GetProofRequest {
                    id: proof_id.to_string(),
                    timeout: 0,
                },
            ))
            .await?
        {
            prover_message::Response::GetProofResponse(response) => Ok(response),
            other => Err(unexpected_response("GetProof", &other)),
        }
    }

    /// Poll the prover until `proof_id` completes.
    async fn wait_proof(&self, proof_id: &str) -> Result<proto::GetProofResponse> {
        loop {
            let response = self.get_proof(proof_id).await?;
            match response.result() {
                get_proof_response::Result::CompletedOk => return Ok(response),
                get_proof_response::Result::Pending => {
                    debug!(proof_id, "Proof still pending");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(AggregatorError::Internal(
                                "interrupted while waiting for proof".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(self.polling_interval) => {}
                    }
                }
                other => {
                    return Err(AggregatorError::Prover(format!(
                        "proof {proof_id} failed with result {other:?}: {}",
                        response.result_string
                    )));
                }
            }
        }
    }
}

fn unexpected_response(expected: &str, got: &prover_message::Response) -> AggregatorError {
    AggregatorError::Prover(format!("expected {expected} response, got {got:?}"))
}

fn check_result(op: &str, result: proto::Result, id: &str) -> Result<()> {
    if result == proto::Result::Ok {
        Ok(())
    } else {
        Err(AggregatorError::Prover(format!(
            "{op} for {id} rejected with result {result:?}"
        )))
    }
}

#[async_trait]
impl ProverClient for ProverSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn addr(&self) -> String {
        self.addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn is_idle(&self) -> Result<bool> {
        let status = self.get_status().await?;
        Ok(status.status() == get_status_response::Status::Idle)
    }

    async fn batch_proof(&self, input: proto::InputProver) -> Result<String> {
        match self
            .call(aggregator_message::Request::GenBatchProofRequest(
                proto::GenBatchProofRequest { input: Some(input) },
            ))
            .await?
        {
            prover_message::Response::GenBatchProofResponse(response) => {
                check_result("batch proof", response.result(), &response.id)?;
                Ok(response.id)
            }
            other => Err(unexpected_response("GenBatchProof", &other)),
        }
    }

    async fn aggregated_proof(
        &self,
        recursive_proof_1: &str,
        recursive_proof_2: &str,
    ) -> Result<String> {
        match self
            .call(aggregator_message::Request::GenAggregatedProofRequest(
                proto::GenAggregatedProofRequest {
                    recursive_proof_1: recursive_proof_1.to_string(),
                    recursive_proof_2: recursive_proof_2.to_string(),
                },
            ))
            .await?
        {
            prover_message::Response::GenAggregatedProofResponse(response) => {
                check_result("aggregated proof", response.result(), &response.id)?;
                Ok(response.id)
            }
            other => Err(unexpected_response("GenAggregatedProof", &other)),
        }
    }

    async fn final_proof(&self, recursive_proof: &str, aggregator_addr: &str) -> Result<String> {
        match self
            .call(aggregator_message::Request::GenFinalProofRequest(
                proto::GenFinalProofRequest {
                    recursive_proof: recursive_proof.to_string(),
                    aggregator_addr: aggregator_addr.to_string(),
                },
            ))
            .await?
        {
            prover_message::Response::GenFinalProofResponse(response) => {
                check_result("final proof", response.result(), &response.id)?;
                Ok(response.id)
            }
            other => Err(unexpected_response("GenFinalProof", &other)),
        }
    }

    async fn wait_recursive_proof(&self, proof_id: &str) -> Result<String> {
        let response = self.wait_proof(proof_id).await?;
        match response.proof {
            Some(get_proof_response::Proof::RecursiveProof(proof)) => Ok(proof),
            _ => Err(AggregatorError::Prover(format!(
                "proof {proof_id} completed without a recursive proof payload"
            ))),
        }
    }

    async fn wait_final_proof(&self, proof_id: &str) -> Result<proto::FinalProof> {
        let response = self.wait_proof(proof_id).await?;
        match response.proof {
            Some(get_proof_response::Proof::FinalProof(proof)) => Ok(proof),
            _ => Err(AggregatorError::Prover(format!(
                "proof {proof_id} completed without a final proof payload"
            ))),
        }
    }
}
