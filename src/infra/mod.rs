//! Infrastructure layer for the aggregation coordinator.
//!
//! Contains trait definitions and implementations for:
//! - Proof storage (PostgreSQL)
//! - Ethereum rollup contract access (L1 view + verification transactions)
//! - Shutdown signalling

mod error;
mod ethereum;
pub mod postgres;
mod shutdown;
mod traits;

pub use error::*;
pub use ethereum::{EthConfig, RollupContractClient};
pub use postgres::PgProofStore;
pub use shutdown::{shutdown_signal, Shutdown, ShutdownSignal};
pub use traits::*;
