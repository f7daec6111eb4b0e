use beacon_server::{BeaconNode, Configuration, metrics, service, startup};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;

    let _logging_guard = startup::init_logging(&configuration.logging_config())?;
    metrics::init_metrics();

    let store = service::connect_store(&configuration).await?;
    let transport = service::connect_transport(&configuration).await?;
    let node = BeaconNode::start(&configuration, store, transport).await?;

    startup::wait_for_shutdown_signal().await;

    info!(node = %node.node(), "Shutting down");
    node.shutdown().await
}
