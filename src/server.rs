//! Server bootstrap for the aggregation coordinator.
//!
//! This module wires together:
//! - configuration
//! - database connection pool
//! - the L1 rollup contract client
//! - the coordinator (scheduler, pipeline, dispatcher)
//! - the prover-facing tonic server with gRPC health

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::coordinator::{
    Coordinator, ProfitabilityChecker, ProfitabilityCheckerType, TxProfitabilityCheckerAcceptAll,
    TxProfitabilityCheckerBase,
};
use crate::grpc::AggregatorGrpcService;
use crate::infra::{shutdown_signal, EthConfig, PgProofStore, RollupContractClient};
use crate::proto::aggregator_service_server::AggregatorServiceServer;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// gRPC bind host.
    pub host: String,
    /// gRPC bind port.
    pub port: u16,
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum database connections.
    pub max_connections: u32,
    /// L2 chain id embedded in prover inputs.
    pub chain_id: u64,
    /// Idle/wait backoff used across the scheduler and dispatcher.
    pub retry_time: Duration,
    /// Debounce between final-proof attempts.
    pub verify_proof_interval: Duration,
    /// Prover-result poll cadence.
    pub proof_state_polling_interval: Duration,
    /// Batch age past which the base profitability checker accepts anyway.
    pub interval_after_which_batch_consolidate_anyway: Duration,
    pub tx_profitability_checker: ProfitabilityCheckerType,
    /// Reward threshold for the base checker.
    pub tx_profitability_min_reward: U256,
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(50081);

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/aggregator".to_string());
        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let chain_id: u64 = std::env::var("CHAIN_ID")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1001);

        let tx_profitability_checker = std::env::var("TX_PROFITABILITY_CHECKER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(ProfitabilityCheckerType::AcceptAll);
        let tx_profitability_min_reward = std::env::var("TX_PROFITABILITY_MIN_REWARD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(U256::ZERO);

        Self {
            host,
            port,
            database_url,
            max_connections,
            chain_id,
            retry_time: env_duration_secs("RETRY_TIME_SECS", 5),
            verify_proof_interval: env_duration_secs("VERIFY_PROOF_INTERVAL_SECS", 90),
            proof_state_polling_interval: env_duration_secs(
                "PROOF_STATE_POLLING_INTERVAL_SECS",
                5,
            ),
            interval_after_which_batch_consolidate_anyway: env_duration_secs(
                "BATCH_CONSOLIDATE_ANYWAY_INTERVAL_SECS",
                3600,
            ),
            tx_profitability_checker,
            tx_profitability_min_reward,
        }
    }
}

/// Start the coordinator and serve the prover channel until shutdown.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting rollup aggregator v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    info!("Configuration loaded");
    info!("  Listen address: {}:{}", config.host, config.port);
    info!("  Chain id: {}", config.chain_id);
    info!(
        "  Profitability checker: {:?}",
        config.tx_profitability_checker
    );

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    info!("Connected to PostgreSQL");

    let migrate_on_startup = std::env::var("DB_MIGRATE_ON_STARTUP")
        .ok()
        .map(|v| {
            !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off"
            )
        })
        .unwrap_or(true);
    if migrate_on_startup {
        info!("Running database migrations...");
        crate::migrations::run_postgres(&pool).await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }

    let eth_config = EthConfig::from_env()?;
    info!("L1 client configured:");
    info!("  RPC URL: {}", eth_config.rpc_url);
    info!("  Rollup manager: {:?}", eth_config.rollup_address);
    let eth = Arc::new(RollupContractClient::new(eth_config));

    let store = Arc::new(PgProofStore::new(pool));

    let profitability: Arc<dyn ProfitabilityChecker> = match config.tx_profitability_checker {
        ProfitabilityCheckerType::Base => Arc::new(TxProfitabilityCheckerBase::new(
            config.tx_profitability_min_reward,
            config.interval_after_which_batch_consolidate_anyway,
        )),
        ProfitabilityCheckerType::AcceptAll => Arc::new(TxProfitabilityCheckerAcceptAll),
    };

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        store,
        eth.clone(),
        eth,
        profitability,
    ));
    coordinator.start().await?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<AggregatorServiceServer<AggregatorGrpcService>>()
        .await;
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let service = AggregatorServiceServer::new(AggregatorGrpcService::new(coordinator.clone()));

    info!("gRPC server listening on {}", addr);

    let shutdown = coordinator.shutdown_signal();
    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(service)
        .serve_with_shutdown(addr, async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = shutdown_signal() => {}
            }
        })
        .await?;

    coordinator.stop();
    info!("Aggregator stopped");

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_env();
        assert_eq!(config.retry_time, Duration::from_secs(5));
        assert_eq!(config.verify_proof_interval, Duration::from_secs(90));
        assert_eq!(config.proof_state_polling_interval, Duration::from_secs(5));
    }
}
