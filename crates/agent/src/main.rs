//! Migration agent - traffic-aware VM live-migration daemon
//!
//! Runs on every hypervisor: samples datapath flows, answers location
//! lookups and takes its turn when a migration token comes round.

use anyhow::Result;
use migration_agent::{config::AgentConfig, daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting migration-agent");

    let config = AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        hypervisor = %config.hypervisor_address,
        algorithm = config.algorithm.as_str(),
        "Agent configured"
    );

    daemon::run(config).await
}
