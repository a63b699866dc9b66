//! Aggregator service entrypoint.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rollup_aggregator::server::run().await
}
