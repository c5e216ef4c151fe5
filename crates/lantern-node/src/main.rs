//! Lantern Node binary
//!
//! Publishes and discovers notification beacons on an IP network.

use lantern_node::{LanternNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lantern_node=info,lantern=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lantern Node");

    let config = NodeConfig::from_env()?;
    let node = LanternNode::new(config)?;
    node.run().await?;

    Ok(())
}
