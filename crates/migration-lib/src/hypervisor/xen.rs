//! Xen `xm` toolstack adapter
//!
//! Guests are identified by the MAC of their first virtual interface, which
//! is what the datapath reports; domain ids are resolved on every call since
//! they change across reboots and migrations.

use crate::decision::{LiveMigrator, VmInventory};
use crate::models::Capacity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;
const CONTROL_DOMAIN: &str = "Domain-0";

/// One row of `xm list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub id: u32,
    pub memory_mib: u64,
}

/// Parsed `xm list` output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainList {
    /// Memory of the control domain, treated as the host total
    pub total_memory_mib: u64,
    pub guests: Vec<Domain>,
}

impl DomainList {
    /// `xm list` rows after the header: `Name ID Mem VCPUs State Time(s)`
    pub fn parse(output: &str) -> Result<Self> {
        let mut list = Self::default();

        for line in output.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [] | ["Name", ..] => continue,
                [name, id, mem, ..] => {
                    let domain = Domain {
                        name: name.to_string(),
                        id: id
                            .parse()
                            .with_context(|| format!("bad domain id in {line:?}"))?,
                        memory_mib: mem
                            .parse()
                            .with_context(|| format!("bad memory in {line:?}"))?,
                    };
                    if domain.name == CONTROL_DOMAIN {
                        list.total_memory_mib = domain.memory_mib;
                    } else {
                        list.guests.push(domain);
                    }
                }
                _ => anyhow::bail!("truncated xm list row {line:?}"),
            }
        }

        Ok(list)
    }

    /// Host total less the memory of every guest
    pub fn available_memory_mib(&self) -> u64 {
        let used: u64 = self.guests.iter().map(|d| d.memory_mib).sum();
        self.total_memory_mib.saturating_sub(used)
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            vm_count: self.guests.len() as u32,
            available_memory: self.available_memory_mib() * MIB,
        }
    }
}

/// MAC of the last interface row of `xm network-list <dom>`
pub fn parse_network_list(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("Idx"))
        .filter_map(|line| line.split_whitespace().nth(2))
        .last()
        .map(str::to_string)
}

/// Guest inventory and live migration through `xm`
#[derive(Debug, Clone)]
pub struct XenToolstack {
    program: String,
    leading_args: Vec<String>,
}

impl Default for XenToolstack {
    fn default() -> Self {
        Self::new()
    }
}

impl XenToolstack {
    pub fn new() -> Self {
        Self {
            program: "xm".to_string(),
            leading_args: Vec::new(),
        }
    }

    /// Use a different executable (wrappers, tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments placed before every `xm` subcommand, e.g. `sudo`-style
    /// wrappers or an interpreter running a script
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn xm(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.program, args.join(" ")))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn list_domains(&self) -> Result<DomainList> {
        DomainList::parse(&self.xm(&["list"]).await?)
    }

    pub async fn mac_of_domain(&self, id: u32) -> Result<Option<String>> {
        let output = self.xm(&["network-list", &id.to_string()]).await?;
        Ok(parse_network_list(&output))
    }

    /// Guest whose interface carries `mac`
    pub async fn domain_of_mac(&self, mac: &str) -> Result<Option<Domain>> {
        for domain in self.list_domains().await?.guests {
            match self.mac_of_domain(domain.id).await? {
                Some(found) if found.eq_ignore_ascii_case(mac) => return Ok(Some(domain)),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn require_domain(&self, mac: &str) -> Result<Domain> {
        self.domain_of_mac(mac)
            .await?
            .with_context(|| format!("no local domain with MAC {mac}"))
    }
}

#[async_trait]
impl VmInventory for XenToolstack {
    async fn memory_footprint_of(&self, vm_mac: &str) -> Result<u64> {
        Ok(self.require_domain(vm_mac).await?.memory_mib * MIB)
    }

    async fn capacity(&self) -> Result<Capacity> {
        Ok(self.list_domains().await?.capacity())
    }
}

#[async_trait]
impl LiveMigrator for XenToolstack {
    async fn live_migrate(&self, vm_mac: &str, target: Ipv4Addr) -> Result<()> {
        let domain = self.require_domain(vm_mac).await?;
        debug!(domain = domain.id, name = %domain.name, target = %target, "Starting xm migrate");

        self.xm(&["migrate", &domain.id.to_string(), &target.to_string(), "-l"])
            .await?;

        info!(domain = domain.id, name = %domain.name, target = %target, "Live migration finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XM_LIST: &str = "\
Name                                        ID   Mem VCPUs      State   Time(s)
Domain-0                                     0  4096     2     r-----    812.4
web                                          3   512     1     -b----     44.1
db                                           7  1024     2     -b----    120.9
";

    const NETWORK_LIST: &str = "\
Idx BE     MAC Addr.     handle state evt-ch tx-/rx-ring-ref BE-path
0   0  00:16:3e:5a:8b:11    0     4      13    768  /769    /local/domain/0/backend/vif/3/0
";

    #[test]
    fn test_parse_domain_list() {
        let list = DomainList::parse(XM_LIST).unwrap();

        assert_eq!(list.total_memory_mib, 4096);
        assert_eq!(
            list.guests,
            vec![
                Domain {
                    name: "web".to_string(),
                    id: 3,
                    memory_mib: 512,
                },
                Domain {
                    name: "db".to_string(),
                    id: 7,
                    memory_mib: 1024,
                },
            ]
        );
    }

    #[test]
    fn test_capacity_in_bytes() {
        let capacity = DomainList::parse(XM_LIST).unwrap().capacity();
        assert_eq!(capacity.vm_count, 2);
        assert_eq!(capacity.available_memory, 2560 * MIB);
    }

    #[test]
    fn test_overcommitted_host_has_no_memory() {
        let list = DomainList {
            total_memory_mib: 1024,
            guests: vec![Domain {
                name: "big".to_string(),
                id: 1,
                memory_mib: 2048,
            }],
        };
        assert_eq!(list.available_memory_mib(), 0);
    }

    #[test]
    fn test_parse_domain_list_rejects_garbage() {
        assert!(DomainList::parse("web three 512 1").is_err());
        assert!(DomainList::parse("web 3").is_err());
        assert_eq!(DomainList::parse("").unwrap(), DomainList::default());
    }

    #[test]
    fn test_parse_network_list() {
        assert_eq!(
            parse_network_list(NETWORK_LIST).as_deref(),
            Some("00:16:3e:5a:8b:11")
        );
        assert_eq!(
            parse_network_list("Idx BE     MAC Addr.     handle state\n"),
            None
        );
    }

    #[cfg(unix)]
    mod fake_xm {
        use super::*;

        /// Script answering `list`, `network-list` and `migrate`
        fn install(dir: &std::path::Path, migrate_exit: i32) -> XenToolstack {
            let path = dir.join("xm.sh");
            let log = dir.join("migrations.log");
            let script = format!(
                "#!/bin/sh\n\
                 case \"$1\" in\n\
                 list) cat <<'EOF'\n{XM_LIST}EOF\n;;\n\
                 network-list)\n\
                   echo 'Idx BE     MAC Addr.     handle state'\n\
                   if [ \"$2\" = 3 ]; then echo '0   0  00:16:3e:00:00:03    0     4'; fi\n\
                   if [ \"$2\" = 7 ]; then echo '0   0  00:16:3e:00:00:07    0     4'; fi\n\
                 ;;\n\
                 migrate) echo \"$2 $3 $4\" >> {log}; exit {migrate_exit} ;;\n\
                 esac\n",
                log = log.display()
            );
            std::fs::write(&path, script).unwrap();
            XenToolstack::new()
                .with_program("sh")
                .with_leading_args([path.display().to_string()])
        }

        #[tokio::test]
        async fn test_inventory_through_xm() {
            let dir = tempfile::tempdir().unwrap();
            let xen = install(dir.path(), 0);

            assert_eq!(
                xen.memory_footprint_of("00:16:3E:00:00:07").await.unwrap(),
                1024 * MIB
            );
            assert_eq!(xen.capacity().await.unwrap().vm_count, 2);
            assert!(xen.memory_footprint_of("00:16:3e:ff:ff:ff").await.is_err());
        }

        #[tokio::test]
        async fn test_live_migrate_runs_xm_migrate() {
            let dir = tempfile::tempdir().unwrap();
            let xen = install(dir.path(), 0);

            xen.live_migrate("00:16:3e:00:00:03", Ipv4Addr::new(192, 168, 1, 4))
                .await
                .unwrap();

            let log = std::fs::read_to_string(dir.path().join("migrations.log")).unwrap();
            assert_eq!(log.trim(), "3 192.168.1.4 -l");
        }

        #[tokio::test]
        async fn test_failed_migration_is_an_error() {
            let dir = tempfile::tempdir().unwrap();
            let xen = install(dir.path(), 1);

            let result = xen
                .live_migrate("00:16:3e:00:00:03", Ipv4Addr::new(192, 168, 1, 4))
                .await;
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let xen = XenToolstack::new().with_program("/nonexistent/xm");
        let err = xen.capacity().await.unwrap_err();
        assert!(err.to_string().contains("Failed to run"));
    }
}
