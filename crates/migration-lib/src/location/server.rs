//! Location lookup server run on every hypervisor

use super::protocol::{LocationRequest, LocationResponse};
use crate::decision::VmInventory;
use crate::token::read_to_eof;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default port of the location lookup protocol
pub const DEFAULT_LOCATION_PORT: u16 = 8010;

/// Answers hypervisor id and capacity requests
///
/// Traffic to this port addressed to a local guest must be redirected here
/// (e.g. a DNAT rule) so that a lookup sent to a VM reaches its hypervisor.
#[derive(Clone)]
pub struct LocationServer {
    hypervisor: Ipv4Addr,
    inventory: Arc<dyn VmInventory>,
    io_timeout: Duration,
}

impl LocationServer {
    pub fn new(hypervisor: Ipv4Addr, inventory: Arc<dyn VmInventory>, io_timeout: Duration) -> Self {
        Self {
            hypervisor,
            inventory,
            io_timeout,
        }
    }

    pub async fn run(&self, port: u16, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind location port {addr}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serve until shutdown; each connection is answered on its own task
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            hypervisor = %self.hypervisor,
            "Location server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.answer(stream).await {
                                debug!(peer = %peer, error = %e, "Location request failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept location connection"),
                },
                _ = shutdown.recv() => {
                    info!("Shutting down location server");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn answer(&self, mut stream: TcpStream) -> Result<()> {
        let request = read_to_eof(&mut stream, self.io_timeout).await?;
        let request = String::from_utf8_lossy(&request);

        // Unknown requests get no answer, only a closed connection
        let Some(response) = self.respond(&request).await? else {
            return Ok(());
        };
        stream.write_all(response.to_string().as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Answer one request message
    pub async fn respond(&self, message: &str) -> Result<Option<LocationResponse>> {
        let response = match LocationRequest::parse(message) {
            Some(LocationRequest::HypervisorId) => LocationResponse::HypervisorId(self.hypervisor),
            Some(LocationRequest::Capacity) => {
                LocationResponse::Capacity(self.inventory.capacity().await?)
            }
            None => return Ok(None),
        };
        Ok(Some(response))
    }
}
