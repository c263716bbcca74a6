//! Text messages of the location lookup protocol
//!
//! One request per connection. The client closes its write half after the
//! request and the server closes the connection after the response.

use crate::models::Capacity;
use crate::token::parse_ipv4;
use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::net::Ipv4Addr;

pub const ID_REQUEST: &str = "hypervisor_id_request";
pub const ID_RESPONSE: &str = "hypervisor_id_response";
pub const CAPACITY_REQUEST: &str = "hypervisor_capacity_request";
pub const CAPACITY_RESPONSE: &str = "hypervisor_capacity_response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationRequest {
    HypervisorId,
    Capacity,
}

impl LocationRequest {
    /// Recognise a request by its leading keyword; trailing bytes are ignored
    pub fn parse(message: &str) -> Option<Self> {
        match message.split_whitespace().next()? {
            ID_REQUEST => Some(LocationRequest::HypervisorId),
            CAPACITY_REQUEST => Some(LocationRequest::Capacity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationRequest::HypervisorId => ID_REQUEST,
            LocationRequest::Capacity => CAPACITY_REQUEST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationResponse {
    HypervisorId(Ipv4Addr),
    Capacity(Capacity),
}

impl LocationResponse {
    pub fn parse(message: &str) -> Result<Self> {
        let mut fields = message.split_whitespace();
        let keyword = fields.next().ok_or_else(|| anyhow!("empty response"))?;

        let response = match keyword {
            ID_RESPONSE => {
                let addr = fields
                    .next()
                    .ok_or_else(|| anyhow!("{ID_RESPONSE} without an address"))?;
                LocationResponse::HypervisorId(parse_ipv4(addr)?)
            }
            CAPACITY_RESPONSE => {
                let (Some(vm_count), Some(available_memory)) = (fields.next(), fields.next())
                else {
                    bail!("{CAPACITY_RESPONSE} needs a VM count and available memory");
                };
                LocationResponse::Capacity(Capacity {
                    vm_count: vm_count
                        .parse()
                        .map_err(|e| anyhow!("bad VM count {vm_count:?}: {e}"))?,
                    available_memory: available_memory
                        .parse()
                        .map_err(|e| anyhow!("bad available memory {available_memory:?}: {e}"))?,
                })
            }
            other => bail!("unexpected response keyword {other:?}"),
        };

        if fields.next().is_some() {
            bail!("trailing fields in {keyword}");
        }
        Ok(response)
    }
}

impl fmt::Display for LocationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationResponse::HypervisorId(addr) => write!(f, "{ID_RESPONSE} {addr}"),
            LocationResponse::Capacity(capacity) => write!(
                f,
                "{CAPACITY_RESPONSE} {} {}",
                capacity.vm_count, capacity.available_memory
            ),
        }
    }
}
