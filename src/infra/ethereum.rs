//! L1 rollup contract access.
//!
//! Submits `verifyBatches` transactions and reads the verified-batch frontier
//! from the rollup manager contract.

use alloy::primitives::{Address, B256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use tracing::info;

use crate::domain::FinalProofInputs;
use crate::infra::{AggregatorError, EthTxManager, L1Client, Result};

// Generate contract bindings
sol! {
    #[sol(rpc)]
    interface IRollupManager {
        function verifyBatches(
            uint64 initNumBatch,
            uint64 finalNewBatch,
            bytes32 newLocalExitRoot,
            bytes32 newStateRoot,
            bytes proof
        ) external;

        function lastVerifiedBatch() external view returns (uint64);
    }
}

/// Rollup contract client configuration.
#[derive(Debug, Clone)]
pub struct EthConfig {
    /// RPC URL for the L1 chain.
    pub rpc_url: String,
    /// Rollup manager contract address.
    pub rollup_address: Address,
    /// Private key of the aggregator account.
    pub private_key: String,
}

impl EthConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("L1_RPC_URL")
            .map_err(|_| AggregatorError::Configuration("L1_RPC_URL is not set".to_string()))?;
        let rollup_address = std::env::var("ROLLUP_MANAGER_ADDRESS")
            .map_err(|_| {
                AggregatorError::Configuration("ROLLUP_MANAGER_ADDRESS is not set".to_string())
            })?
            .parse()
            .map_err(|e| {
                AggregatorError::Configuration(format!("Invalid ROLLUP_MANAGER_ADDRESS: {e}"))
            })?;
        let private_key = std::env::var("AGGREGATOR_PRIVATE_KEY").map_err(|_| {
            AggregatorError::Configuration("AGGREGATOR_PRIVATE_KEY is not set".to_string())
        })?;

        Ok(Self {
            rpc_url,
            rollup_address,
            private_key,
        })
    }
}

/// alloy-backed client implementing both the read-only L1 view and the
/// verification transaction submission.
pub struct RollupContractClient {
    config: EthConfig,
}

impl RollupContractClient {
    pub fn new(config: EthConfig) -> Self {
        Self { config }
    }

    fn signer(&self) -> Result<PrivateKeySigner> {
        self.config
            .private_key
            .parse()
            .map_err(|e| AggregatorError::Configuration(format!("Invalid private key: {e}")))
    }
}

#[async_trait]
impl L1Client for RollupContractClient {
    async fn get_latest_verified_batch_num(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().on_http(
            self.config
                .rpc_url
                .parse()
                .map_err(|e| AggregatorError::Configuration(format!("Invalid RPC URL: {e}")))?,
        );
        let contract = IRollupManager::new(self.config.rollup_address, &provider);

        let batch_num = contract
            .lastVerifiedBatch()
            .call()
            .await
            .map_err(|e| AggregatorError::Ethereum(format!("Contract call failed: {e}")))?;

        Ok(batch_num._0)
    }

    async fn get_public_address(&self) -> Result<Address> {
        Ok(self.signer()?.address())
    }
}

#[async_trait]
impl EthTxManager for RollupContractClient {
    async fn verify_batches(
        &self,
        last_verified_batch: u64,
        new_verified_batch: u64,
        inputs: &FinalProofInputs,
    ) -> Result<B256> {
        info!(
            from_batch = last_verified_batch + 1,
            to_batch = new_verified_batch,
            "Submitting verifyBatches transaction"
        );

        let signer = self.signer()?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(alloy::network::EthereumWallet::from(signer))
            .on_http(
                self.config
                    .rpc_url
                    .parse()
                    .map_err(|e| AggregatorError::Configuration(format!("Invalid RPC URL: {e}")))?,
            );

        let contract = IRollupManager::new(self.config.rollup_address, &provider);

        let new_local_exit_root = B256::try_from(inputs.new_local_exit_root.as_slice())
            .map_err(|_| AggregatorError::Internal("new_local_exit_root is not 32 bytes".into()))?;
        let new_state_root = B256::try_from(inputs.new_state_root.as_slice())
            .map_err(|_| AggregatorError::Internal("new_state_root is not 32 bytes".into()))?;

        let tx = contract.verifyBatches(
            last_verified_batch,
            new_verified_batch,
            new_local_exit_root,
            new_state_root,
            inputs.final_proof.proof.clone().into_bytes().into(),
        );

        let pending = tx
            .send()
            .await
            .map_err(|e| AggregatorError::Ethereum(format!("Failed to send transaction: {e}")))?;

        info!("Transaction sent: {:?}", pending.tx_hash());

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| AggregatorError::Ethereum(format!("Failed to get receipt: {e}")))?;

        info!(
            tx_hash = %receipt.transaction_hash,
            block = receipt.block_number.unwrap_or(0),
            "verifyBatches confirmed"
        );

        Ok(receipt.transaction_hash)
    }
}
