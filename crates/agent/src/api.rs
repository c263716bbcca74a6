//! HTTP API for health checks, Prometheus metrics and flow inspection

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use migration_lib::{
    flows::{FlowIndex, SharedFlowTable},
    health::{ComponentStatus, HealthRegistry},
    models::HostSnapshot,
    observability::AgentMetrics,
    token::parse_ipv4,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub flows: SharedFlowTable,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: AgentMetrics, flows: SharedFlowTable) -> Self {
        Self {
            health_registry,
            metrics,
            flows,
        }
    }
}

/// Current (unconsumed) traffic window of one IP
#[derive(Debug, Serialize)]
pub struct FlowsResponse {
    pub mac: Option<String>,
    pub as_source: Option<HostSnapshot>,
    pub as_destination: Option<HostSnapshot>,
}

/// 200 while operational, 503 once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            e.to_string().into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Peek at an IP's traffic without consuming it
async fn flows(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Json<FlowsResponse>, (StatusCode, String)> {
    let ip = parse_ipv4(&ip).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let response = FlowsResponse {
        mac: state.flows.mac_of(ip).await,
        as_source: state.flows.copy(ip, FlowIndex::AsSource).await,
        as_destination: state.flows.copy(ip, FlowIndex::AsDestination).await,
    };

    if response.mac.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no traffic recorded for {ip}")));
    }
    Ok(Json(response))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/flows/:ip", get(flows))
        .with_state(state)
}

/// Serve the API until shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
