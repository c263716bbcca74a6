//! Location service CLI commands

use anyhow::Result;
use colored::Colorize;
use migration_lib::location::LocationClient;
use std::net::Ipv4Addr;

use crate::output::{format_bytes, print_json, print_warning, OutputFormat};

/// Ask which hypervisor hosts `vm`
pub async fn resolve(client: &LocationClient, vm: Ipv4Addr, format: OutputFormat) -> Result<()> {
    let hypervisor = client.hypervisor_of(vm).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "vm": vm,
            "hypervisor": hypervisor,
        }))?,
        OutputFormat::Table => match hypervisor {
            Some(hypervisor) => {
                println!("VM:         {}", vm.to_string().cyan());
                println!("Hypervisor: {}", hypervisor.to_string().green());
            }
            None => print_warning(&format!("{vm} is not hosted by the answering hypervisor")),
        },
    }

    Ok(())
}

/// Ask `hypervisor` for its guest count and free memory
pub async fn capacity(
    client: &LocationClient,
    hypervisor: Ipv4Addr,
    format: OutputFormat,
) -> Result<()> {
    let capacity = client.capacity_request(hypervisor).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "hypervisor": hypervisor,
            "capacity": capacity,
        }))?,
        OutputFormat::Table => match capacity {
            Some(capacity) => {
                println!("{}", "Hypervisor Capacity".bold());
                println!("{}", "=".repeat(40));
                println!("Hypervisor:       {}", hypervisor.to_string().cyan());
                println!("Guests:           {}", capacity.vm_count);
                println!(
                    "Available memory: {}",
                    format_bytes(capacity.available_memory)
                );
            }
            None => print_warning(&format!("{hypervisor} did not report its capacity")),
        },
    }

    Ok(())
}
