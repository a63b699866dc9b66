//! Prover channel gRPC service.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

use crate::coordinator::Coordinator;
use crate::infra::ProverClient;
use crate::proto::aggregator_service_server::AggregatorService;
use crate::proto::{AggregatorMessage, ProverMessage};
use crate::prover::ProverSession;

/// Accepts prover streams and hands each one to the coordinator.
pub struct AggregatorGrpcService {
    coordinator: Arc<Coordinator>,
}

impl AggregatorGrpcService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl AggregatorService for AggregatorGrpcService {
    type ChannelStream = Pin<Box<dyn Stream<Item = Result<AggregatorMessage, Status>> + Send>>;

    /// Bidirectional communication channel between a prover worker and the
    /// aggregator. The scheduler loop for the session runs in a dedicated
    /// task for as long as both sides stay up.
    async fn channel(
        &self,
        request: Request<Streaming<ProverMessage>>,
    ) -> Result<Response<Self::ChannelStream>, Status> {
        let remote_addr = request.remote_addr();
        let inbound = request.into_inner();
        let (outbound_tx, outbound_rx) = mpsc::channel(8);

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let polling_interval = coordinator.config().proof_state_polling_interval;
            let shutdown = coordinator.shutdown_signal();

            let session = match ProverSession::connect(
                outbound_tx,
                inbound,
                remote_addr,
                polling_interval,
                shutdown,
            )
            .await
            {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "Failed to establish prover session");
                    return;
                }
            };

            debug!(
                prover_id = %session.id(),
                addr = %session.addr(),
                "Establishing stream connection with prover"
            );

            let prover: Arc<dyn ProverClient> = Arc::new(session);
            coordinator.run_channel(prover).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(outbound_rx))))
    }
}
