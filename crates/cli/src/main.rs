//! Traffic-aware migration CLI
//!
//! A command-line tool for starting token circulations, querying a host's
//! location service and converting IPv4 addresses.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{ip, location, token};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Traffic-aware VM migration CLI
#[derive(Parser)]
#[command(name = "migctl")]
#[command(author, version, about = "CLI for traffic-aware VM migration", long_about = None)]
pub struct Cli {
    /// Port the token servers listen on (overrides the config file)
    #[arg(long, global = true, env = "MIGCTL_TOKEN_PORT")]
    pub token_port: Option<u16>,

    /// Port the location servers listen on (overrides the config file)
    #[arg(long, global = true, env = "MIGCTL_LOCATION_PORT")]
    pub location_port: Option<u16>,

    /// Network timeout in seconds
    #[arg(long, global = true, default_value_t = 5)]
    pub timeout_secs: u64,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and circulate migration tokens
    #[command(subcommand)]
    Token(TokenCommands),

    /// Query a host's location service
    #[command(subcommand)]
    Location(LocationCommands),

    /// Convert between dotted-quad and packed integer addresses
    #[command(subcommand)]
    Ip(IpCommands),
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Send a token to the host of its first VM
    Send {
        /// VM addresses in circulation order
        #[arg(required = true)]
        vms: Vec<Ipv4Addr>,

        /// Pressure threshold per VM (distributed mode), saturating at 255; one per address
        #[arg(long = "cost")]
        costs: Vec<u64>,
    },

    /// Print a token's encoding without sending it
    Show {
        /// VM addresses in circulation order
        #[arg(required = true)]
        vms: Vec<Ipv4Addr>,

        /// Pressure threshold per VM (distributed mode), saturating at 255; one per address
        #[arg(long = "cost")]
        costs: Vec<u64>,
    },
}

#[derive(Subcommand)]
pub enum LocationCommands {
    /// Ask which hypervisor hosts a VM
    Resolve {
        /// VM address
        vm: Ipv4Addr,
    },

    /// Ask a hypervisor for its guest count and free memory
    Capacity {
        /// Hypervisor address
        hypervisor: Ipv4Addr,
    },
}

#[derive(Subcommand)]
pub enum IpCommands {
    /// Dotted-quad literal to its big-endian integer
    ToInt {
        /// Address such as 10.0.0.1
        literal: String,
    },

    /// Big-endian integer to its dotted-quad literal
    ToStr {
        /// Integer in 0..=4294967295
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config = config::Config::load()?;
    let token_port = file_config.token_port(cli.token_port);
    let location_port = file_config.location_port(cli.location_port);
    let io_timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Token(token_cmd) => match token_cmd {
            TokenCommands::Send { vms, costs } => {
                token::send(&vms, &costs, token_port, io_timeout, cli.format).await?;
            }
            TokenCommands::Show { vms, costs } => {
                token::show(&vms, &costs, cli.format)?;
            }
        },
        Commands::Location(location_cmd) => {
            let client = migration_lib::location::LocationClient::new(location_port, io_timeout);
            match location_cmd {
                LocationCommands::Resolve { vm } => {
                    location::resolve(&client, vm, cli.format).await?;
                }
                LocationCommands::Capacity { hypervisor } => {
                    location::capacity(&client, hypervisor, cli.format).await?;
                }
            }
        }
        Commands::Ip(ip_cmd) => match ip_cmd {
            IpCommands::ToInt { literal } => ip::to_int(&literal, cli.format)?,
            IpCommands::ToStr { value } => ip::to_str(value, cli.format)?,
        },
    }

    Ok(())
}
