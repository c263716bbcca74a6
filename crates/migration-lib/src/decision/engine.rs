//! Cost-weighted migration decision engine

use super::{CapacityLookup, CostLookup, VmInventory};
use crate::error::DecisionError;
use crate::flows::{ConsumedTraffic, SharedFlowTable};
use crate::models::{Capacity, MigrationDecision};
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Shortest accumulation window used as a divisor
const MIN_ELAPSED_SECS: f64 = 0.001;

/// Tuning of the decision engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// A hypervisor already running this many guests is full
    pub max_vms_per_host: u32,
    /// Weighted cost per point of pressure score
    pub cost_scale: f64,
    /// Hypervisor this engine runs on; peers hosted here are never targets
    pub local_hypervisor: Option<Ipv4Addr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_vms_per_host: 4,
            cost_scale: 1_000_000.0,
            local_hypervisor: None,
        }
    }
}

/// `2 * bytes * cost / elapsed`
pub fn weighted_cost(bytes: u64, cost: u32, elapsed_secs: f64) -> f64 {
    2.0 * bytes as f64 * cost as f64 / elapsed_secs.max(MIN_ELAPSED_SECS)
}

/// Aggregate cost compressed into the one-byte range carried by tokens
pub fn pressure_score(aggregate_cost: f64, cost_scale: f64) -> u8 {
    if cost_scale <= 0.0 {
        return u8::MAX;
    }
    (aggregate_cost / cost_scale).round().clamp(0.0, u8::MAX as f64) as u8
}

/// A peer that could pull the VM to its hypervisor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub peer: Ipv4Addr,
    pub hypervisor: Ipv4Addr,
    pub weighted_cost: f64,
}

/// Cost evaluation of one consumed traffic window
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub vm_ip: Ipv4Addr,
    pub vm_mac: String,
    pub elapsed_secs: f64,
    pub aggregate_cost: f64,
    /// Peers on other hypervisors with a positive weighted cost, ordered by
    /// peer address
    pub candidates: Vec<Candidate>,
}

impl Assessment {
    /// Most expensive candidate strictly below `ceiling`; lowest peer wins ties
    fn best_below(&self, ceiling: f64) -> Option<&Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.weighted_cost < ceiling)
            .fold(None, |best: Option<&Candidate>, c| match best {
                Some(b) if b.weighted_cost >= c.weighted_cost => Some(b),
                _ => Some(c),
            })
    }
}

/// Decides whether and where a VM should move
pub struct MigrationDecisionEngine {
    table: SharedFlowTable,
    costs: Arc<dyn CostLookup>,
    capacity: Arc<dyn CapacityLookup>,
    inventory: Arc<dyn VmInventory>,
    config: EngineConfig,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl MigrationDecisionEngine {
    pub fn new(
        table: SharedFlowTable,
        costs: Arc<dyn CostLookup>,
        capacity: Arc<dyn CapacityLookup>,
        inventory: Arc<dyn VmInventory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            table,
            costs,
            capacity,
            inventory,
            config,
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new("local"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consume the VM's traffic window and pick a target hypervisor
    ///
    /// `Ok(None)` means the VM stays: no traffic, no resolvable peer, or no
    /// candidate hypervisor with room.
    pub async fn round_robin(
        &self,
        ip: Ipv4Addr,
    ) -> Result<Option<MigrationDecision>, DecisionError> {
        let start = Instant::now();
        let decision = match self.assess(ip).await? {
            Some(assessment) => {
                let decision = self.select_target(&assessment).await;
                self.record("round_robin", &assessment, decision.as_ref());
                decision
            }
            None => None,
        };
        self.finish(start, decision.is_some());
        Ok(decision)
    }

    /// Token-driven variant: the VM only moves once its pressure score
    /// reaches `threshold`
    pub async fn distributed(
        &self,
        ip: Ipv4Addr,
        threshold: u8,
    ) -> Result<Option<MigrationDecision>, DecisionError> {
        let start = Instant::now();
        let decision = match self.assess(ip).await? {
            Some(assessment) => {
                let score = pressure_score(assessment.aggregate_cost, self.config.cost_scale);
                let decision = if score < threshold {
                    debug!(vm = %ip, score, threshold, "Pressure below token threshold");
                    None
                } else {
                    self.select_target(&assessment).await
                };
                self.record("distributed", &assessment, decision.as_ref());
                decision
            }
            None => None,
        };
        self.finish(start, decision.is_some());
        Ok(decision)
    }

    /// Consume the traffic window of `ip` and weigh every resolvable peer
    pub async fn assess(&self, ip: Ipv4Addr) -> Result<Option<Assessment>, DecisionError> {
        let consumed = self.table.consume(ip).await;
        self.weigh(ip, consumed).await
    }

    /// As [`Self::assess`], ending the window at `now`
    pub async fn assess_at(
        &self,
        ip: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Assessment>, DecisionError> {
        let consumed = self.table.consume_at(ip, now).await;
        self.weigh(ip, consumed).await
    }

    async fn weigh(
        &self,
        ip: Ipv4Addr,
        consumed: ConsumedTraffic,
    ) -> Result<Option<Assessment>, DecisionError> {
        if consumed.is_empty() {
            debug!(vm = %ip, "No traffic recorded, nothing to decide");
            return Ok(None);
        }
        let vm_mac = consumed.mac.ok_or(DecisionError::MacUnresolved(ip))?;

        let mut totals: BTreeMap<Ipv4Addr, u64> = BTreeMap::new();
        for snapshot in [&consumed.source, &consumed.destination].into_iter().flatten() {
            for (peer, bytes) in &snapshot.totals {
                let total = totals.entry(*peer).or_default();
                *total = total.saturating_add(*bytes);
            }
        }

        // Window start comes from the source index when the VM ever sent
        let since = consumed
            .source
            .as_ref()
            .or(consumed.destination.as_ref())
            .map(|snapshot| snapshot.since)
            .unwrap_or(consumed.consumed_at);
        let elapsed_secs =
            ((consumed.consumed_at - since).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6)
                .max(MIN_ELAPSED_SECS);

        let mut aggregate_cost = 0.0;
        let mut candidates = Vec::new();
        for (peer, bytes) in totals {
            let peer_cost = match self.costs.communication_cost(peer).await {
                Ok(Some(peer_cost)) => peer_cost,
                Ok(None) => {
                    debug!(vm = %ip, peer = %peer, "No cost known for peer, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(vm = %ip, peer = %peer, error = %e, "Cost lookup failed, skipping peer");
                    continue;
                }
            };

            let cost = weighted_cost(bytes, peer_cost.cost, elapsed_secs);
            aggregate_cost += cost;
            if Some(peer_cost.hypervisor) == self.config.local_hypervisor {
                debug!(vm = %ip, peer = %peer, "Peer shares this hypervisor, not a target");
                continue;
            }
            if cost > 0.0 {
                candidates.push(Candidate {
                    peer,
                    hypervisor: peer_cost.hypervisor,
                    weighted_cost: cost,
                });
            }
        }

        Ok(Some(Assessment {
            vm_ip: ip,
            vm_mac,
            elapsed_secs,
            aggregate_cost,
            candidates,
        }))
    }

    /// Walk candidates from the most expensive down until one hypervisor
    /// has room
    pub async fn select_target(&self, assessment: &Assessment) -> Option<MigrationDecision> {
        let mut ceiling = f64::INFINITY;
        let mut known_footprint: Option<u64> = None;
        let mut verdicts: HashMap<Ipv4Addr, bool> = HashMap::new();

        while let Some(candidate) = assessment.best_below(ceiling) {
            let footprint = match known_footprint {
                Some(bytes) => bytes,
                None => match self.inventory.memory_footprint_of(&assessment.vm_mac).await {
                    Ok(bytes) => *known_footprint.insert(bytes),
                    Err(e) => {
                        warn!(
                            vm = %assessment.vm_ip,
                            error = %e,
                            "Memory footprint unknown, VM stays"
                        );
                        return None;
                    }
                },
            };

            let admits = match verdicts.get(&candidate.hypervisor) {
                Some(admits) => *admits,
                None => {
                    let admits = self.has_room(candidate.hypervisor, footprint).await;
                    verdicts.insert(candidate.hypervisor, admits);
                    admits
                }
            };

            if admits {
                return Some(MigrationDecision {
                    vm_ip: assessment.vm_ip,
                    vm_mac: assessment.vm_mac.clone(),
                    target: candidate.hypervisor,
                    weighted_cost: candidate.weighted_cost,
                    aggregate_cost: assessment.aggregate_cost,
                });
            }

            debug!(
                vm = %assessment.vm_ip,
                hypervisor = %candidate.hypervisor,
                weighted_cost = candidate.weighted_cost,
                "Candidate hypervisor full, lowering ceiling"
            );
            ceiling = candidate.weighted_cost;
        }

        None
    }

    async fn has_room(&self, hypervisor: Ipv4Addr, footprint: u64) -> bool {
        match self.capacity.capacity_of(hypervisor).await {
            Ok(Some(capacity)) => self.admits(&capacity, footprint),
            Ok(None) => false,
            Err(e) => {
                warn!(hypervisor = %hypervisor, error = %e, "Capacity query failed");
                false
            }
        }
    }

    fn admits(&self, capacity: &Capacity, footprint: u64) -> bool {
        capacity.admits(self.config.max_vms_per_host, footprint)
    }

    fn record(&self, algorithm: &str, assessment: &Assessment, decision: Option<&MigrationDecision>) {
        self.logger.log_decision(
            assessment.vm_ip,
            algorithm,
            assessment.aggregate_cost,
            decision.map(|d| d.target),
        );
    }

    fn finish(&self, start: Instant, migrate: bool) {
        self.metrics
            .observe_decision_latency(start.elapsed().as_secs_f64());
        self.metrics.inc_decisions_evaluated(migrate);
    }
}
