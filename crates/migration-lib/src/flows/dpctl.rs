//! Open vSwitch datapath flow source
//!
//! Shells out to `ovs-dpctl dump-flows <bridge>` and turns each IPv4 flow
//! line into a [`FlowEntry`]. A typical line:
//!
//! ```text
//! in_port(2),eth(src=00:16:3e:00:00:01,dst=00:16:3e:00:00:02),eth_type(0x0800),ipv4(src=192.168.2.1,dst=192.168.2.2,proto=6,tos=0,ttl=64,frag=no),tcp(src=5001,dst=41234), packets:10, bytes:1500, used:0.010s, actions:1
//! ```

use super::FlowSource;
use crate::models::FlowEntry;
use crate::token::parse_ipv4;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const IPV4_ETH_TYPE: &str = "eth_type(0x0800)";

/// Flow source backed by the `ovs-dpctl` command
pub struct DpctlFlowSource {
    bridge: String,
    program: String,
}

impl DpctlFlowSource {
    /// Create a source dumping flows for `bridge`
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            program: "ovs-dpctl".to_string(),
        }
    }

    /// Use a different executable (wrappers, tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Parse a full `dump-flows` output, skipping non-IPv4 and malformed lines
    pub fn parse_dump(output: &str) -> Vec<FlowEntry> {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let entry = Self::parse_flow_line(line);
                if entry.is_none() {
                    debug!(line = %line, "Skipping datapath flow line");
                }
                entry
            })
            .collect()
    }

    /// Parse one flow line
    ///
    /// Fields are located by name rather than position, since some
    /// protocols (IGMP for one) omit the transport tuple and shift the
    /// counters left.
    pub fn parse_flow_line(line: &str) -> Option<FlowEntry> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        if !fields.contains(&IPV4_ETH_TYPE) {
            return None;
        }

        let (src_mac, dst_mac) = Self::pair_after(&fields, "eth(src=")?;
        let (src_ip, dst_ip) = Self::pair_after(&fields, "ipv4(src=")?;
        let bytes = fields
            .iter()
            .find_map(|f| f.strip_prefix("bytes:"))?
            .trim()
            .parse::<u64>()
            .ok()?;

        Some(FlowEntry {
            src_mac: src_mac.to_string(),
            dst_mac: dst_mac.to_string(),
            src_ip: parse_ipv4(src_ip).ok()?,
            dst_ip: parse_ipv4(dst_ip).ok()?,
            bytes,
        })
    }

    /// Values of `<prefix>X` and the following `dst=Y` field
    fn pair_after<'a>(fields: &[&'a str], prefix: &str) -> Option<(&'a str, &'a str)> {
        let pos = fields.iter().position(|f| f.starts_with(prefix))?;
        let src = fields[pos].strip_prefix(prefix)?;
        let dst = fields.get(pos + 1)?.strip_prefix("dst=")?;
        Some((src.trim_end_matches(')'), dst.trim_end_matches(')')))
    }
}

#[async_trait]
impl FlowSource for DpctlFlowSource {
    async fn fetch(&self) -> Result<Vec<FlowEntry>> {
        let output = Command::new(&self.program)
            .args(["dump-flows", &self.bridge])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} dump-flows {}", self.program, self.bridge))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} dump-flows {} failed ({}): {}",
                self.program,
                self.bridge,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(Self::parse_dump(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const TCP_LINE: &str = "in_port(2),eth(src=00:16:3e:00:00:01,dst=00:16:3e:00:00:02),eth_type(0x0800),ipv4(src=192.168.2.1,dst=192.168.2.2,proto=6,tos=0,ttl=64,frag=no),tcp(src=5001,dst=41234), packets:10, bytes:1500, used:0.010s, actions:1";
    const IGMP_LINE: &str = "in_port(3),eth(src=00:16:3e:00:00:03,dst=01:00:5e:00:00:16),eth_type(0x0800),ipv4(src=192.168.2.3,dst=224.0.0.22,proto=2,tos=0xc0,ttl=1,frag=no), packets:2, bytes:108, used:2.340s, actions:drop";
    const ARP_LINE: &str = "in_port(2),eth(src=00:16:3e:00:00:01,dst=ff:ff:ff:ff:ff:ff),eth_type(0x0806),arp(sip=192.168.2.1,tip=192.168.2.2,op=1,sha=00:16:3e:00:00:01,tha=00:00:00:00:00:00), packets:1, bytes:42, used:0.500s, actions:1";

    #[test]
    fn test_parse_tcp_line() {
        let entry = DpctlFlowSource::parse_flow_line(TCP_LINE).unwrap();
        assert_eq!(entry.src_mac, "00:16:3e:00:00:01");
        assert_eq!(entry.dst_mac, "00:16:3e:00:00:02");
        assert_eq!(entry.src_ip, Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(entry.dst_ip, Ipv4Addr::new(192, 168, 2, 2));
        assert_eq!(entry.bytes, 1500);
    }

    #[test]
    fn test_parse_igmp_line_without_transport_fields() {
        let entry = DpctlFlowSource::parse_flow_line(IGMP_LINE).unwrap();
        assert_eq!(entry.dst_ip, Ipv4Addr::new(224, 0, 0, 22));
        assert_eq!(entry.bytes, 108);
    }

    #[test]
    fn test_non_ipv4_line_is_skipped() {
        assert!(DpctlFlowSource::parse_flow_line(ARP_LINE).is_none());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        assert!(DpctlFlowSource::parse_flow_line("").is_none());
        assert!(DpctlFlowSource::parse_flow_line("eth_type(0x0800),garbage").is_none());
        let bad_ip = TCP_LINE.replace("192.168.2.1", "192.168.2.999");
        assert!(DpctlFlowSource::parse_flow_line(&bad_ip).is_none());
    }

    #[test]
    fn test_parse_dump() {
        let dump = format!("{}\n{}\n\n{}\n", TCP_LINE, ARP_LINE, IGMP_LINE);
        let entries = DpctlFlowSource::parse_dump(&dump);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bytes, 1500);
        assert_eq!(entries[1].bytes, 108);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let source = DpctlFlowSource::new("xenbr0").with_program("/nonexistent/ovs-dpctl");
        assert!(source.fetch().await.is_err());
    }
}
