//! Traffic-driven migration decisions
//!
//! The engine turns a consumed traffic window into a weighted cost per peer
//! and searches for the most expensive peer whose hypervisor can take the
//! VM. Everything outside this host is reached through the collaborator
//! traits below.

mod engine;


pub use engine::{
    pressure_score, weighted_cost, Assessment, Candidate, EngineConfig, MigrationDecisionEngine,
};

use crate::models::Capacity;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Hypervisor hosting a peer and the cost of talking to it from here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCost {
    pub hypervisor: Ipv4Addr,
    pub cost: u32,
}

/// Resolves where a peer lives and what reaching it costs
#[async_trait]
pub trait CostLookup: Send + Sync {
    /// `None` when the peer's hypervisor or the route cost is unknown
    async fn communication_cost(&self, peer: Ipv4Addr) -> Result<Option<PeerCost>>;
}

/// Spare room on a remote hypervisor
#[async_trait]
pub trait CapacityLookup: Send + Sync {
    async fn capacity_of(&self, hypervisor: Ipv4Addr) -> Result<Option<Capacity>>;
}

/// Guests on this hypervisor
#[async_trait]
pub trait VmInventory: Send + Sync {
    /// Memory in bytes of the guest owning `vm_mac`
    async fn memory_footprint_of(&self, vm_mac: &str) -> Result<u64>;

    /// Guest count and unallocated memory of this hypervisor
    async fn capacity(&self) -> Result<Capacity>;
}

/// Starts a live migration of a local guest
#[async_trait]
pub trait LiveMigrator: Send + Sync {
    async fn live_migrate(&self, vm_mac: &str, target: Ipv4Addr) -> Result<()>;
}
