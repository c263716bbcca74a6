//! Observability infrastructure for the migration agent
//!
//! Provides:
//! - Prometheus metrics (poll latency, decision latency, token traffic, migrations)
//! - Structured JSON logging of domain events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    poll_latency_seconds: Histogram,
    poll_errors: IntCounter,
    flow_samples_applied: IntCounter,
    tracked_hosts: IntGaugeVec,
    decisions_evaluated: IntCounterVec,
    decision_latency_seconds: Histogram,
    migrations_triggered: IntCounter,
    migration_failures: IntCounter,
    tokens: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            poll_latency_seconds: register_histogram!(
                "migration_agent_poll_latency_seconds",
                "Time spent fetching and applying one batch of flow samples",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            poll_errors: register_int_counter!(
                "migration_agent_poll_errors_total",
                "Flow fetches that failed or timed out"
            )
            .expect("Failed to register poll_errors"),

            flow_samples_applied: register_int_counter!(
                "migration_agent_flow_samples_applied_total",
                "Flow samples folded into the flow table"
            )
            .expect("Failed to register flow_samples_applied"),

            tracked_hosts: register_int_gauge_vec!(
                "migration_agent_tracked_hosts",
                "Hosts with a record in each flow table index",
                &["index"]
            )
            .expect("Failed to register tracked_hosts"),

            decisions_evaluated: register_int_counter_vec!(
                "migration_agent_decisions_evaluated_total",
                "Migration decisions evaluated, by outcome",
                &["outcome"]
            )
            .expect("Failed to register decisions_evaluated"),

            decision_latency_seconds: register_histogram!(
                "migration_agent_decision_latency_seconds",
                "Time spent evaluating one migration decision",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register decision_latency_seconds"),

            migrations_triggered: register_int_counter!(
                "migration_agent_migrations_triggered_total",
                "Live migrations handed to the hypervisor"
            )
            .expect("Failed to register migrations_triggered"),

            migration_failures: register_int_counter!(
                "migration_agent_migration_failures_total",
                "Live migrations the hypervisor reported as failed"
            )
            .expect("Failed to register migration_failures"),

            tokens: register_int_counter_vec!(
                "migration_agent_tokens_total",
                "Migration tokens handled, by action",
                &["action"]
            )
            .expect("Failed to register tokens"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_poll_latency(&self, duration_secs: f64) {
        self.inner().poll_latency_seconds.observe(duration_secs);
    }

    pub fn inc_poll_errors(&self) {
        self.inner().poll_errors.inc();
    }

    pub fn add_flow_samples(&self, count: u64) {
        self.inner().flow_samples_applied.inc_by(count);
    }

    /// Update tracked host gauges for both indices
    pub fn set_tracked_hosts(&self, as_source: i64, as_destination: i64) {
        let gauge = &self.inner().tracked_hosts;
        gauge.with_label_values(&["src"]).set(as_source);
        gauge.with_label_values(&["dst"]).set(as_destination);
    }

    /// Count one decision; `migrate` is whether a target was chosen
    pub fn inc_decisions_evaluated(&self, migrate: bool) {
        let outcome = if migrate { "migrate" } else { "stay" };
        self.inner()
            .decisions_evaluated
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_decision_latency(&self, duration_secs: f64) {
        self.inner().decision_latency_seconds.observe(duration_secs);
    }

    pub fn inc_migrations_triggered(&self) {
        self.inner().migrations_triggered.inc();
    }

    pub fn inc_migration_failures(&self) {
        self.inner().migration_failures.inc();
    }

    pub fn inc_tokens_received(&self) {
        self.inner().tokens.with_label_values(&["received"]).inc();
    }

    pub fn inc_tokens_forwarded(&self) {
        self.inner().tokens.with_label_values(&["forwarded"]).inc();
    }

    pub fn inc_tokens_dropped(&self) {
        self.inner().tokens.with_label_values(&["dropped"]).inc();
    }
}

/// Structured logger for agent events
///
/// One event per significant domain action, tagged with the node name.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log the outcome of one migration decision
    pub fn log_decision(
        &self,
        vm: Ipv4Addr,
        algorithm: &str,
        aggregate_cost: f64,
        target: Option<Ipv4Addr>,
    ) {
        match target {
            Some(target) => info!(
                event = "decision_made",
                node = %self.node_name,
                vm = %vm,
                algorithm = %algorithm,
                aggregate_cost = aggregate_cost,
                target = %target,
                "Migration target selected"
            ),
            None => info!(
                event = "decision_made",
                node = %self.node_name,
                vm = %vm,
                algorithm = %algorithm,
                aggregate_cost = aggregate_cost,
                "VM stays on this host"
            ),
        }
    }

    pub fn log_migration_triggered(&self, vm_mac: &str, target: Ipv4Addr) {
        info!(
            event = "migration_triggered",
            node = %self.node_name,
            vm_mac = %vm_mac,
            target = %target,
            "Live migration triggered"
        );
    }

    pub fn log_migration_failed(&self, vm_mac: &str, target: Ipv4Addr, error: &str) {
        warn!(
            event = "migration_failed",
            node = %self.node_name,
            vm_mac = %vm_mac,
            target = %target,
            error = %error,
            "Live migration failed"
        );
    }

    pub fn log_token_forwarded(&self, next: Ipv4Addr, remaining: usize) {
        info!(
            event = "token_forwarded",
            node = %self.node_name,
            next = %next,
            remaining = remaining,
            "Token forwarded to next host"
        );
    }

    pub fn log_token_dropped(&self, reason: &str) {
        warn!(
            event = "token_dropped",
            node = %self.node_name,
            reason = %reason,
            "Token dropped, circulation stops here"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, algorithm: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            algorithm = %algorithm,
            "Migration agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Migration agent shutting down"
        );
    }
}
