//! Where VMs live and what talking to them costs
//!
//! A small text protocol maps a VM to its hypervisor and reports a
//! hypervisor's spare capacity; a static table prices each hypervisor pair.

mod client;
mod cost_table;
mod protocol;
mod server;


pub use client::{LocationClient, TableCostLookup};
pub use cost_table::CostTable;
pub use protocol::{LocationRequest, LocationResponse};
pub use server::{LocationServer, DEFAULT_LOCATION_PORT};
