//! Location lookups against remote hypervisors

use super::cost_table::CostTable;
use super::protocol::{LocationRequest, LocationResponse};
use crate::decision::{CapacityLookup, CostLookup, PeerCost};
use crate::models::Capacity;
use crate::token::read_to_eof;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Client for the location lookup protocol
#[derive(Debug, Clone)]
pub struct LocationClient {
    port: u16,
    io_timeout: Duration,
}

impl LocationClient {
    pub fn new(port: u16, io_timeout: Duration) -> Self {
        Self { port, io_timeout }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hypervisor hosting `vm`
    ///
    /// The request is addressed to the VM itself; its hypervisor intercepts
    /// the location port.
    pub async fn hypervisor_of(&self, vm: Ipv4Addr) -> Result<Option<Ipv4Addr>> {
        match self.request(vm, LocationRequest::HypervisorId).await? {
            Some(LocationResponse::HypervisorId(addr)) => Ok(Some(addr)),
            Some(other) => anyhow::bail!("{vm} answered an id request with {other}"),
            None => Ok(None),
        }
    }

    /// Guest count and free memory reported by `hypervisor`
    pub async fn capacity_request(&self, hypervisor: Ipv4Addr) -> Result<Option<Capacity>> {
        match self.request(hypervisor, LocationRequest::Capacity).await? {
            Some(LocationResponse::Capacity(capacity)) => Ok(Some(capacity)),
            Some(other) => anyhow::bail!("{hypervisor} answered a capacity request with {other}"),
            None => Ok(None),
        }
    }

    /// `None` when the server closes without answering
    async fn request(
        &self,
        host: Ipv4Addr,
        request: LocationRequest,
    ) -> Result<Option<LocationResponse>> {
        let addr = SocketAddr::new(host.into(), self.port);

        let reply = timeout(self.io_timeout, async {
            let mut stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to location server at {addr}"))?;
            stream.write_all(request.as_str().as_bytes()).await?;
            stream.shutdown().await?;
            read_to_eof(stream, self.io_timeout).await
        })
        .await
        .with_context(|| format!("Location request to {addr} timed out"))??;

        let reply = String::from_utf8(reply).context("Location response is not UTF-8")?;
        if reply.trim().is_empty() {
            debug!(host = %host, request = request.as_str(), "Location server sent no answer");
            return Ok(None);
        }
        LocationResponse::parse(&reply).map(Some)
    }
}

#[async_trait]
impl CapacityLookup for LocationClient {
    async fn capacity_of(&self, hypervisor: Ipv4Addr) -> Result<Option<Capacity>> {
        self.capacity_request(hypervisor).await
    }
}

/// Peer cost from the peer's hypervisor and the static cost table
pub struct TableCostLookup {
    own_hypervisor: Ipv4Addr,
    client: LocationClient,
    table: Arc<CostTable>,
}

impl TableCostLookup {
    pub fn new(own_hypervisor: Ipv4Addr, client: LocationClient, table: Arc<CostTable>) -> Self {
        Self {
            own_hypervisor,
            client,
            table,
        }
    }
}

#[async_trait]
impl CostLookup for TableCostLookup {
    async fn communication_cost(&self, peer: Ipv4Addr) -> Result<Option<PeerCost>> {
        let Some(hypervisor) = self.client.hypervisor_of(peer).await? else {
            return Ok(None);
        };
        Ok(self
            .table
            .cost(self.own_hypervisor, hypervisor)
            .map(|cost| PeerCost { hypervisor, cost }))
    }
}
