//! Flow sampling loop
//!
//! Periodically fetches datapath samples and folds them into the shared
//! flow table. Sampling and every reader go through the same table-wide
//! lock, so a `copy_and_reset` is totally ordered with each batch update.

use super::table::{FlowIndex, FlowTable, HostRecord};
use super::FlowSource;
use crate::health::{components, HealthRegistry};
use crate::models::{FlowEntry, HostSnapshot};
use crate::observability::AgentMetrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Cloneable handle to the flow table behind its single lock
#[derive(Clone, Default)]
pub struct SharedFlowTable {
    inner: Arc<Mutex<FlowTable>>,
}

impl SharedFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one batch of samples under a single lock acquisition
    pub async fn apply(&self, entries: &[FlowEntry]) -> usize {
        let mut table = self.inner.lock().await;
        for entry in entries {
            table.update(entry);
        }
        entries.len()
    }

    /// Raw record (counters and offsets) for inspection
    pub async fn get(&self, ip: Ipv4Addr, index: FlowIndex) -> Option<HostRecord> {
        self.inner.lock().await.get(ip, index).cloned()
    }

    pub async fn copy(&self, ip: Ipv4Addr, index: FlowIndex) -> Option<HostSnapshot> {
        self.inner.lock().await.copy(ip, index)
    }

    /// Consume the traffic window of `ip` in one index
    pub async fn copy_and_reset(&self, ip: Ipv4Addr, index: FlowIndex) -> Option<HostSnapshot> {
        self.inner.lock().await.copy_and_reset(ip, index)
    }

    /// Consume both indices' windows of `ip` and resolve its MAC in one
    /// critical section
    ///
    /// The window end is read after the lock is taken, so it is never
    /// earlier than any window start in the result.
    pub async fn consume(&self, ip: Ipv4Addr) -> ConsumedTraffic {
        let mut table = self.inner.lock().await;
        Self::consume_locked(&mut table, ip, Utc::now())
    }

    /// Consume with an explicit window end
    pub async fn consume_at(&self, ip: Ipv4Addr, now: DateTime<Utc>) -> ConsumedTraffic {
        let mut table = self.inner.lock().await;
        Self::consume_locked(&mut table, ip, now)
    }

    fn consume_locked(table: &mut FlowTable, ip: Ipv4Addr, now: DateTime<Utc>) -> ConsumedTraffic {
        let source = table.copy_and_reset_at(ip, FlowIndex::AsSource, now);
        let destination = table.copy_and_reset_at(ip, FlowIndex::AsDestination, now);
        let mac = table.mac_of(ip).map(str::to_string);
        ConsumedTraffic {
            source,
            destination,
            mac,
            consumed_at: now,
        }
    }

    pub async fn mac_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.inner.lock().await.mac_of(ip).map(str::to_string)
    }

    pub async fn has_history(&self, ip: Ipv4Addr, index: FlowIndex) -> bool {
        self.inner.lock().await.has_history(ip, index)
    }

    pub async fn evict(&self, ip: Ipv4Addr, index: FlowIndex) -> bool {
        self.inner.lock().await.evict(ip, index)
    }

    /// Number of tracked hosts in each index as (source, destination)
    pub async fn host_counts(&self) -> (usize, usize) {
        let table = self.inner.lock().await;
        (
            table.host_count(FlowIndex::AsSource),
            table.host_count(FlowIndex::AsDestination),
        )
    }
}

/// Traffic windows consumed for one IP
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedTraffic {
    pub source: Option<HostSnapshot>,
    pub destination: Option<HostSnapshot>,
    pub mac: Option<String>,
    /// End of the consumed windows and start of the next ones
    pub consumed_at: DateTime<Utc>,
}

impl ConsumedTraffic {
    /// No history in either index
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.destination.is_none()
    }
}

/// Configuration for the flow poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between the start of consecutive polls (default: 1 second)
    pub interval: Duration,
    /// Upper bound on a single fetch before it counts as failed (default: 5 seconds)
    pub fetch_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Results from one poll iteration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollResults {
    pub samples_applied: usize,
    pub fetch_failed: bool,
}

/// Background loop feeding datapath samples into the flow table
pub struct FlowPoller {
    source: Arc<dyn FlowSource>,
    table: SharedFlowTable,
    config: PollerConfig,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
}

impl FlowPoller {
    pub fn new(
        source: Arc<dyn FlowSource>,
        table: SharedFlowTable,
        config: PollerConfig,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            source,
            table,
            config,
            metrics,
            health: None,
        }
    }

    /// Report fetch failures as a degraded poller
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Handle for readers of the table this poller feeds
    pub fn table(&self) -> SharedFlowTable {
        self.table.clone()
    }

    /// Run until a shutdown signal arrives
    ///
    /// Shutdown is only observed between iterations; an in-flight fetch and
    /// its batch update always complete.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting flow poller"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = self.poll_once().await;
                    poll_count += 1;

                    if poll_count % 60 == 0 {
                        debug!(
                            polls = poll_count,
                            samples = results.samples_applied,
                            "Flow poll cycle complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!(polls = poll_count, "Shutting down flow poller");
                    break;
                }
            }
        }
    }

    /// Fetch one batch and apply it
    ///
    /// A failed or timed-out fetch is an empty batch.
    pub async fn poll_once(&self) -> PollResults {
        let start = Instant::now();
        let mut results = PollResults::default();

        let batch = match self.fetch().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Flow fetch failed, treating as empty batch");
                self.metrics.inc_poll_errors();
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::POLLER, format!("{e:#}"))
                        .await;
                }
                results.fetch_failed = true;
                Vec::new()
            }
        };
        if !results.fetch_failed {
            if let Some(health) = &self.health {
                health.set_healthy(components::POLLER).await;
            }
        }

        results.samples_applied = self.table.apply(&batch).await;

        let (sources, destinations) = self.table.host_counts().await;
        self.metrics
            .observe_poll_latency(start.elapsed().as_secs_f64());
        self.metrics.add_flow_samples(results.samples_applied as u64);
        self.metrics.set_tracked_hosts(sources as i64, destinations as i64);

        results
    }

    async fn fetch(&self) -> Result<Vec<FlowEntry>> {
        match timeout(self.config.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "flow fetch timed out after {}ms",
                self.config.fetch_timeout.as_millis()
            )),
        }
    }
}

/// Builder for creating the flow poller
pub struct FlowPollerBuilder {
    source: Option<Arc<dyn FlowSource>>,
    table: Option<SharedFlowTable>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
    config: PollerConfig,
}

impl FlowPollerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            source: None,
            table: None,
            metrics: None,
            health: None,
            config: PollerConfig::default(),
        }
    }

    /// Set the flow sample source
    pub fn source(mut self, source: Arc<dyn FlowSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Share an existing table instead of creating a fresh one
    pub fn table(mut self, table: SharedFlowTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the poll interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the fetch timeout
    pub fn fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.config.fetch_timeout = fetch_timeout;
        self
    }

    /// Build the poller
    pub fn build(self) -> Result<FlowPoller> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Flow source is required"))?;

        let poller = FlowPoller::new(
            source,
            self.table.unwrap_or_default(),
            self.config,
            self.metrics.unwrap_or_default(),
        );
        Ok(match self.health {
            Some(health) => poller.with_health(health),
            None => poller,
        })
    }
}

impl Default for FlowPollerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
