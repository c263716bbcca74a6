//! Wiring of the per-host components

use crate::api::{self, AppState};
use crate::config::AgentConfig;
use anyhow::Result;
use migration_lib::{
    decision::MigrationDecisionEngine,
    flows::{DpctlFlowSource, FlowPollerBuilder, SharedFlowTable},
    health::{components, HealthRegistry},
    hypervisor::XenToolstack,
    location::{CostTable, LocationClient, LocationServer, TableCostLookup},
    observability::{AgentMetrics, StructuredLogger},
    token::{TokenServer, TokenServerConfig},
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build every component, run until Ctrl-C, then shut down
pub async fn run(config: AgentConfig) -> Result<()> {
    let hypervisor = config.hypervisor_addr()?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::POLLER).await;
    health_registry.register(components::TOKEN_SERVER).await;
    health_registry.register(components::LOCATION_SERVER).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let table = SharedFlowTable::new();
    let poller = FlowPollerBuilder::new()
        .source(Arc::new(DpctlFlowSource::new(&config.bridge)))
        .table(table.clone())
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .interval(config.poller().interval)
        .fetch_timeout(config.poller().fetch_timeout)
        .build()?;

    let costs = match &config.cost_table_path {
        Some(path) => {
            let costs = CostTable::load(path)?;
            info!(path = %path, entries = costs.len(), "Loaded cost table");
            costs
        }
        None => {
            warn!("No cost table configured, no peer will have a communication cost");
            CostTable::new()
        }
    };

    let xen = Arc::new(XenToolstack::new());
    let locations = LocationClient::new(config.location_port, config.io_timeout());
    let engine = MigrationDecisionEngine::new(
        table.clone(),
        Arc::new(TableCostLookup::new(
            hypervisor,
            locations.clone(),
            Arc::new(costs),
        )),
        Arc::new(locations),
        xen.clone(),
        config.engine(),
    )
    .with_logger(logger.clone());

    let token_server = TokenServer::new(Arc::new(engine), xen.clone(), config.token_server())
        .with_logger(logger.clone());
    let location_server = LocationServer::new(hypervisor, xen, config.io_timeout());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let poller_handle = tokio::spawn(poller.run(shutdown_tx.subscribe()));

    let token_handle = supervise(
        health_registry.clone(),
        components::TOKEN_SERVER,
        {
            let shutdown = shutdown_tx.subscribe();
            async move { token_server.run(shutdown).await }
        },
    );

    let location_port = config.location_port;
    let location_handle = supervise(
        health_registry.clone(),
        components::LOCATION_SERVER,
        {
            let shutdown = shutdown_tx.subscribe();
            async move { location_server.run(location_port, shutdown).await }
        },
    );

    let app_state = Arc::new(AppState::new(
        health_registry.clone(),
        metrics.clone(),
        table,
    ));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;
    logger.log_startup(AGENT_VERSION, config.algorithm.as_str());

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    poller_handle.await?;
    token_handle.await?;
    location_handle.await?;
    if let Err(e) = api_handle.await? {
        warn!(error = %e, "API server exited with error");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Spawn a server task and mark its component unhealthy if it fails
fn supervise<F>(health: HealthRegistry, component: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(component, error = %e, "Server task failed");
            health.set_unhealthy(component, format!("{e:#}")).await;
        }
    })
}
