//! Agent configuration

use anyhow::{bail, Context, Result};
use migration_lib::decision::EngineConfig;
use migration_lib::flows::PollerConfig;
use migration_lib::token::{parse_ipv4, Algorithm, TokenServerConfig};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Address of this hypervisor as peers and the cost table know it
    #[serde(default)]
    pub hypervisor_address: String,

    /// Open vSwitch bridge the guests are attached to
    #[serde(default = "default_bridge")]
    pub bridge: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on one flow dump
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_token_port")]
    pub token_port: u16,

    #[serde(default = "default_location_port")]
    pub location_port: u16,

    /// Inter-hypervisor cost table; without one no peer has a cost
    #[serde(default)]
    pub cost_table_path: Option<String>,

    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default = "default_max_vms_per_host")]
    pub max_vms_per_host: u32,

    /// Timeout for token and location socket I/O
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Weighted cost per point of the distributed pressure score
    #[serde(default = "default_cost_scale")]
    pub cost_scale: f64,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_bridge() -> String {
    "xenbr0".to_string()
}

fn default_poll_interval() -> u64 {
    1
}

fn default_poll_timeout() -> u64 {
    5
}

fn default_token_port() -> u16 {
    migration_lib::token::DEFAULT_TOKEN_PORT
}

fn default_location_port() -> u16 {
    migration_lib::location::DEFAULT_LOCATION_PORT
}

fn default_max_vms_per_host() -> u32 {
    4
}

fn default_io_timeout() -> u64 {
    5
}

fn default_cost_scale() -> f64 {
    1_000_000.0
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("AGENT").try_parsing(true),
        );
        Self::from_config(builder.build()?)
    }

    /// Deserialize and validate an already assembled configuration
    pub fn from_config(config: config::Config) -> Result<Self> {
        let agent: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    pub fn validate(&self) -> Result<()> {
        self.hypervisor_addr()?;
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be positive");
        }
        if self.poll_timeout_secs == 0 || self.io_timeout_secs == 0 {
            bail!("timeouts must be positive");
        }
        if !(self.cost_scale > 0.0) {
            bail!("cost_scale must be positive, got {}", self.cost_scale);
        }
        if self.max_vms_per_host == 0 {
            bail!("max_vms_per_host must be positive");
        }
        Ok(())
    }

    pub fn hypervisor_addr(&self) -> Result<Ipv4Addr> {
        if self.hypervisor_address.is_empty() {
            bail!("AGENT_HYPERVISOR_ADDRESS is required");
        }
        parse_ipv4(&self.hypervisor_address).context("Invalid hypervisor_address")
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            fetch_timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_vms_per_host: self.max_vms_per_host,
            cost_scale: self.cost_scale,
            local_hypervisor: self.hypervisor_addr().ok(),
        }
    }

    pub fn token_server(&self) -> TokenServerConfig {
        TokenServerConfig {
            port: self.token_port,
            algorithm: self.algorithm,
            io_timeout: self.io_timeout(),
        }
    }
}
