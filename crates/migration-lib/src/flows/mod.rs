//! Traffic accounting from datapath flow samples
//!
//! This module provides the dual-indexed flow table, the background poller
//! that feeds it, and the `ovs-dpctl` adapter producing samples.

mod dpctl;
mod poller;
mod table;


pub use dpctl::DpctlFlowSource;
pub use poller::{
    ConsumedTraffic, FlowPoller, FlowPollerBuilder, PollResults, PollerConfig,
    SharedFlowTable,
};
pub use table::{FlowIndex, FlowTable, HostRecord, PeerCounter};

use crate::models::FlowEntry;
use anyhow::Result;

pub use async_trait::async_trait;

/// Source of raw datapath flow samples
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// Fetch the current cumulative counters of every visible flow
    async fn fetch(&self) -> Result<Vec<FlowEntry>>;
}
