//! Traffic-aware live migration for virtualization hosts
//!
//! This crate provides the core functionality for:
//! - Accounting per-VM traffic from datapath flow samples
//! - Deciding whether and where a VM should migrate
//! - Circulating migration tokens around a ring of hosts
//! - Locating VMs and hypervisor capacity
//! - Health checks and observability

pub mod decision;
pub mod error;
pub mod flows;
pub mod health;
pub mod hypervisor;
pub mod location;
pub mod models;
pub mod observability;
pub mod token;

pub use error::{AddressError, DecisionError, TokenError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
