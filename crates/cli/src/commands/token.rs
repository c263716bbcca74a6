//! Token CLI commands

use anyhow::{Context, Result};
use colored::Colorize;
use migration_lib::token::{saturating_cost, send_token, MigrationToken, RecordLayout};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tabled::Tabled;
use thiserror::Error;

use crate::output::{format_hex, print_success, print_table, OutputFormat};

#[derive(Debug, PartialEq, Eq, Error)]
pub enum TokenArgsError {
    #[error("{costs} --cost values given for {vms} VMs; pass one per VM or none")]
    CostCountMismatch { vms: usize, costs: usize },
}

/// Row for token records table
#[derive(Tabled, Serialize)]
struct RecordRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "VM")]
    vm: Ipv4Addr,
    #[tabled(rename = "Id")]
    id: u32,
    #[tabled(rename = "Threshold", display_with = "display_threshold")]
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold: Option<u8>,
}

fn display_threshold(threshold: &Option<u8>) -> String {
    threshold.map_or_else(|| "-".to_string(), |t| t.to_string())
}

#[derive(Serialize)]
struct TokenView {
    layout: &'static str,
    hex: String,
    records: Vec<RecordRow>,
}

/// Basic token without costs, cost-carrying token when every VM has one
///
/// Costs above 255 saturate to 255.
pub fn build_token(vms: &[Ipv4Addr], costs: &[u64]) -> Result<MigrationToken, TokenArgsError> {
    if costs.is_empty() {
        return Ok(MigrationToken::from_addrs(vms.iter().copied()));
    }
    if costs.len() != vms.len() {
        return Err(TokenArgsError::CostCountMismatch {
            vms: vms.len(),
            costs: costs.len(),
        });
    }
    let costs = costs.iter().map(|cost| saturating_cost(*cost));
    Ok(MigrationToken::with_costs(
        vms.iter().map(|vm| u32::from(*vm)).zip(costs),
    ))
}

fn view(token: &MigrationToken) -> TokenView {
    let with_cost = token.layout() == RecordLayout::WithCost;
    TokenView {
        layout: token.layout().name(),
        hex: format_hex(&token.encode()),
        records: token
            .records()
            .iter()
            .enumerate()
            .map(|(position, record)| RecordRow {
                position,
                vm: record.addr(),
                id: record.id,
                threshold: with_cost.then_some(record.cost),
            })
            .collect(),
    }
}

/// Print the encoding of a token without sending it
pub fn show(vms: &[Ipv4Addr], costs: &[u64], format: OutputFormat) -> Result<()> {
    let token = build_token(vms, costs)?;
    let view = view(&token);

    match format {
        OutputFormat::Json => crate::output::print_json(&view)?,
        OutputFormat::Table => {
            println!("{}", "Migration Token".bold());
            println!("{}", "=".repeat(50));
            println!("Layout:   {}", view.layout.cyan());
            println!("Bytes:    {}", token.encode().len());
            println!("Encoded:  {}", view.hex);
            println!();
            print_table(&view.records, format);
        }
    }

    Ok(())
}

/// Send a token to the token server of its first VM's host
pub async fn send(
    vms: &[Ipv4Addr],
    costs: &[u64],
    port: u16,
    io_timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    let token = build_token(vms, costs)?;
    let head = token.head_addr().context("A token needs at least one VM")?;
    let addr = SocketAddr::new(head.into(), port);

    send_token(addr, &token, io_timeout).await?;

    match format {
        OutputFormat::Json => crate::output::print_json(&serde_json::json!({
            "sent_to": addr.to_string(),
            "records": token.len(),
            "layout": token.layout().name(),
        }))?,
        OutputFormat::Table => print_success(&format!(
            "Sent {}-record {} token to {}",
            token.len(),
            token.layout().name(),
            addr.to_string().cyan()
        )),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_lib::token::read_to_eof;
    use tokio::net::TcpListener;

    fn vms() -> Vec<Ipv4Addr> {
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    }

    #[test]
    fn test_no_costs_builds_basic_token() {
        let token = build_token(&vms(), &[]).unwrap();

        assert_eq!(token.layout(), RecordLayout::Basic);
        assert_eq!(token.encode(), vec![10, 0, 0, 1, 10, 0, 0, 2]);
    }

    #[test]
    fn test_costs_build_cost_token() {
        let token = build_token(&vms(), &[3, 200]).unwrap();

        assert_eq!(token.layout(), RecordLayout::WithCost);
        assert_eq!(token.encode(), vec![10, 0, 0, 1, 3, 10, 0, 0, 2, 200]);
    }

    #[test]
    fn test_oversized_costs_saturate() {
        let token = build_token(&vms(), &[300, 7]).unwrap();

        assert_eq!(token.encode(), vec![10, 0, 0, 1, 255, 10, 0, 0, 2, 7]);
        assert_eq!(view(&token).records[0].threshold, Some(u8::MAX));
    }

    #[test]
    fn test_cost_count_must_match() {
        let err = build_token(&vms(), &[3]).unwrap_err();
        assert_eq!(err, TokenArgsError::CostCountMismatch { vms: 2, costs: 1 });
    }

    #[test]
    fn test_view_hides_threshold_for_basic_tokens() {
        let basic = view(&build_token(&vms(), &[]).unwrap());
        assert_eq!(basic.hex, "0a000001 0a000002");
        assert!(basic.records.iter().all(|r| r.threshold.is_none()));

        let costed = view(&build_token(&vms(), &[0, 9]).unwrap());
        assert_eq!(costed.records[1].threshold, Some(9));
        assert_eq!(costed.records[1].id, 0x0a00_0002);
    }

    #[tokio::test]
    async fn test_send_delivers_to_head_vm() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_to_eof(stream, Duration::from_secs(5)).await.unwrap()
        });

        let vms = [Ipv4Addr::LOCALHOST, Ipv4Addr::new(10, 0, 0, 9)];
        send(&vms, &[], port, Duration::from_secs(5), OutputFormat::Json)
            .await
            .unwrap();

        assert_eq!(receiver.await.unwrap(), vec![127, 0, 0, 1, 10, 0, 0, 9]);
    }
}
