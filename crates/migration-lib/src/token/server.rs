//! Token circulation endpoint
//!
//! Each host accepts one token at a time, evaluates the VM named by the
//! head record, strips it and hands the remainder to the host of the next
//! VM. There is no coordinator and no retransmission.

use super::codec::{MigrationToken, RecordLayout};
use crate::decision::{LiveMigrator, MigrationDecisionEngine};
use crate::models::MigrationDecision;
use crate::observability::{AgentMetrics, StructuredLogger};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default port tokens circulate on
pub const DEFAULT_TOKEN_PORT: u16 = 8011;

/// Largest byte stream accepted as one message
pub const MAX_MESSAGE_BYTES: u64 = 1 << 20;

/// Decision variant a host runs when a token reaches it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Distributed,
}

impl Algorithm {
    /// Record layout of the tokens this variant circulates
    pub fn layout(&self) -> RecordLayout {
        match self {
            Algorithm::RoundRobin => RecordLayout::Basic,
            Algorithm::Distributed => RecordLayout::WithCost,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Distributed => "distributed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenServerConfig {
    /// Port the remainder is forwarded to on the next host
    pub port: u16,
    pub algorithm: Algorithm,
    /// Bound on reading a token and on forwarding it
    pub io_timeout: Duration,
}

impl Default for TokenServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TOKEN_PORT,
            algorithm: Algorithm::default(),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to one received token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Malformed; neither evaluated nor forwarded
    Dropped,
    /// Evaluated and nothing left to forward
    Completed,
    Forwarded { next: Ipv4Addr },
    /// Evaluated but the next host could not be reached
    Undeliverable { next: Ipv4Addr },
}

/// Receives, evaluates and forwards migration tokens
pub struct TokenServer {
    engine: Arc<MigrationDecisionEngine>,
    migrator: Arc<dyn LiveMigrator>,
    config: TokenServerConfig,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl TokenServer {
    pub fn new(
        engine: Arc<MigrationDecisionEngine>,
        migrator: Arc<dyn LiveMigrator>,
        config: TokenServerConfig,
    ) -> Self {
        Self {
            engine,
            migrator,
            config,
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new("local"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Bind the token port on all interfaces and serve until shutdown
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind token port {addr}"))?;
        self.serve(listener, shutdown).await
    }

    /// Accept tokens one at a time until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            algorithm = self.config.algorithm.as_str(),
            "Token server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept token connection");
                            continue;
                        }
                    };
                    match read_to_eof(stream, self.config.io_timeout).await {
                        Ok(bytes) => {
                            debug!(peer = %peer, len = bytes.len(), "Token received");
                            self.handle_token(&bytes).await;
                        }
                        Err(e) => {
                            self.metrics.inc_tokens_dropped();
                            self.logger.log_token_dropped(&format!("read from {peer} failed: {e:#}"));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down token server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decode, evaluate the head VM, strip it and forward the rest
    pub async fn handle_token(&self, bytes: &[u8]) -> TokenOutcome {
        self.metrics.inc_tokens_received();

        let token = match MigrationToken::decode(bytes, self.config.algorithm.layout()) {
            Ok(token) => token,
            Err(e) => {
                self.metrics.inc_tokens_dropped();
                self.logger.log_token_dropped(&e.to_string());
                return TokenOutcome::Dropped;
            }
        };

        let Some(head) = token.head().copied() else {
            debug!("Empty token, circulation complete");
            return TokenOutcome::Completed;
        };

        let vm = head.addr();
        let evaluated = match self.config.algorithm {
            Algorithm::RoundRobin => self.engine.round_robin(vm).await,
            Algorithm::Distributed => self.engine.distributed(vm, head.cost).await,
        };
        match evaluated {
            Ok(Some(decision)) => self.trigger_migration(decision),
            Ok(None) => {}
            Err(e) => warn!(vm = %vm, error = %e, "Decision aborted, forwarding token"),
        }

        let remainder = token.strip_head();
        let Some(next) = remainder.head_addr() else {
            info!(vm = %vm, "Last record evaluated, circulation complete");
            return TokenOutcome::Completed;
        };

        let addr = SocketAddr::new(next.into(), self.config.port);
        match send_token(addr, &remainder, self.config.io_timeout).await {
            Ok(()) => {
                self.metrics.inc_tokens_forwarded();
                self.logger.log_token_forwarded(next, remainder.len());
                TokenOutcome::Forwarded { next }
            }
            Err(e) => {
                self.metrics.inc_tokens_dropped();
                self.logger
                    .log_token_dropped(&format!("forward to {addr} failed: {e:#}"));
                TokenOutcome::Undeliverable { next }
            }
        }
    }

    /// Start the live migration in the background; forwarding does not wait
    fn trigger_migration(&self, decision: MigrationDecision) {
        self.metrics.inc_migrations_triggered();
        self.logger
            .log_migration_triggered(&decision.vm_mac, decision.target);

        let migrator = self.migrator.clone();
        let metrics = self.metrics.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = migrator
                .live_migrate(&decision.vm_mac, decision.target)
                .await
            {
                metrics.inc_migration_failures();
                logger.log_migration_failed(&decision.vm_mac, decision.target, &format!("{e:#}"));
            }
        });
    }
}

/// Connect, write the encoded token and close the write half
pub async fn send_token(
    addr: SocketAddr,
    token: &MigrationToken,
    io_timeout: Duration,
) -> Result<()> {
    let bytes = token.encode();
    timeout(io_timeout, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .with_context(|| format!("Sending token to {addr} timed out"))?
}

/// Read until the peer closes its write half
pub async fn read_to_eof<R>(mut reader: R, io_timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(
        io_timeout,
        (&mut reader).take(MAX_MESSAGE_BYTES + 1).read_to_end(&mut buf),
    )
    .await
    .context("Timed out waiting for peer to close")??;

    if buf.len() as u64 > MAX_MESSAGE_BYTES {
        anyhow::bail!("message exceeds {MAX_MESSAGE_BYTES} bytes");
    }
    Ok(buf)
}
