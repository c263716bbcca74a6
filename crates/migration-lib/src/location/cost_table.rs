//! Static inter-hypervisor communication costs
//!
//! File format, one directive per line:
//!
//! ```text
//! # comment
//! netmask 255.255.255.0
//! subnets 192.168.1.2 192.168.1.3 10
//! ```

use crate::token::parse_ipv4;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostTable {
    netmask: Option<Ipv4Addr>,
    costs: HashMap<(Ipv4Addr, Ipv4Addr), u32>,
}

impl CostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cost table {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid cost table {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut table = Self::new();

        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            table
                .apply_line(line)
                .with_context(|| format!("line {}: {line:?}", number + 1))?;
        }

        Ok(table)
    }

    fn apply_line(&mut self, line: &str) -> Result<()> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["netmask", mask] => {
                self.netmask = Some(parse_ipv4(mask)?);
            }
            ["subnets", src, dst, cost] => {
                let cost = cost
                    .parse::<u32>()
                    .map_err(|e| anyhow!("bad cost {cost:?}: {e}"))?;
                self.insert(parse_ipv4(src)?, parse_ipv4(dst)?, cost);
            }
            [keyword, ..] => bail!("unrecognised directive {keyword:?}"),
            [] => {}
        }
        Ok(())
    }

    /// Later entries for the same pair replace earlier ones
    pub fn insert(&mut self, src: Ipv4Addr, dst: Ipv4Addr, cost: u32) {
        self.costs.insert((src, dst), cost);
    }

    /// Cost of talking from `src` to `dst`; directional
    pub fn cost(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<u32> {
        self.costs.get(&(src, dst)).copied()
    }

    pub fn netmask(&self) -> Option<Ipv4Addr> {
        self.netmask
    }

    pub fn len(&self) -> usize {
        self.costs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HV1: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
    const HV2: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 3);
    const HV3: Ipv4Addr = Ipv4Addr::new(192, 168, 2, 2);

    const SAMPLE: &str = "\
# two racks
netmask 255.255.255.0

subnets 192.168.1.2 192.168.1.3 1
subnets 192.168.1.2 192.168.2.2 10
subnets 192.168.1.2 192.168.1.2 0
";

    #[test]
    fn test_parse_sample() {
        let table = CostTable::parse(SAMPLE).unwrap();

        assert_eq!(table.netmask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(table.len(), 3);
        assert_eq!(table.cost(HV1, HV2), Some(1));
        assert_eq!(table.cost(HV1, HV3), Some(10));
        assert_eq!(table.cost(HV1, HV1), Some(0));
    }

    #[test]
    fn test_costs_are_directional() {
        let table = CostTable::parse(SAMPLE).unwrap();
        assert_eq!(table.cost(HV2, HV1), None);
    }

    #[test]
    fn test_duplicate_pair_takes_last_value() {
        let table = CostTable::parse(
            "subnets 192.168.1.2 192.168.1.3 1\nsubnets 192.168.1.2 192.168.1.3 7\n",
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.cost(HV1, HV2), Some(7));
    }

    #[test]
    fn test_errors_name_the_line() {
        let err = CostTable::parse("netmask 255.255.255.0\nsubnets 192.168.1.2 oops 3\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        let err = CostTable::parse("subnets 192.168.1.2 192.168.1.3 -4").unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));

        assert!(CostTable::parse("subnets 192.168.1.2 192.168.1.3").is_err());
        assert!(CostTable::parse("routers 1.2.3.4").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let table = CostTable::load(file.path()).unwrap();
        assert_eq!(table.cost(HV1, HV3), Some(10));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CostTable::load(dir.path().join("absent.txt")).unwrap_err();
        assert!(err.to_string().contains("Failed to read cost table"));
    }
}
