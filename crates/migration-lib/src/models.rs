//! Core data models shared across the migration components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// One observed datapath flow sample
///
/// `bytes` is the cumulative count reported by the datapath at sample time,
/// not a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub bytes: u64,
}

impl FlowEntry {
    pub fn new(
        src_mac: impl Into<String>,
        dst_mac: impl Into<String>,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        bytes: u64,
    ) -> Self {
        Self {
            src_mac: src_mac.into(),
            dst_mac: dst_mac.into(),
            src_ip,
            dst_ip,
            bytes,
        }
    }
}

/// Value copy of one host's traffic taken from the flow table
///
/// Each peer maps to the visible total (`current + offset`) at copy time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub totals: BTreeMap<Ipv4Addr, u64>,
    /// Start of the accumulation window (last rebase before the copy)
    pub since: DateTime<Utc>,
}

impl HostSnapshot {
    /// Sum of all peer totals
    pub fn total_bytes(&self) -> u64 {
        self.totals.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

/// Spare room reported by a hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub vm_count: u32,
    pub available_memory: u64,
}

impl Capacity {
    /// Whether a VM of `footprint` fits under a `max_vms` ceiling
    pub fn admits(&self, max_vms: u32, footprint: u64) -> bool {
        self.vm_count < max_vms && self.available_memory >= footprint
    }
}

/// Outcome of a positive migration decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDecision {
    pub vm_ip: Ipv4Addr,
    pub vm_mac: String,
    pub target: Ipv4Addr,
    /// Weighted cost of the peer that selected the target
    pub weighted_cost: f64,
    /// Sum of weighted costs over all resolvable peers
    pub aggregate_cost: f64,
}
