//! Dual-indexed traffic accounting
//!
//! Every flow sample updates two independent indices: one keyed by the
//! sample's source IP, one keyed by its destination IP. Per-peer counters
//! survive datapath flow eviction by folding the old raw count into an
//! offset whenever the reported count goes backwards.

use crate::models::{FlowEntry, HostSnapshot};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

/// Which index of the table an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowIndex {
    /// Records keyed by the IP as flow source; peers are destinations
    AsSource,
    /// Records keyed by the IP as flow destination; peers are sources
    AsDestination,
}

impl FlowIndex {
    pub const ALL: [FlowIndex; 2] = [FlowIndex::AsSource, FlowIndex::AsDestination];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowIndex::AsSource => "src",
            FlowIndex::AsDestination => "dst",
        }
    }
}

/// Rebasing byte counter for one (owner, peer) pair
///
/// The visible total is `current + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerCounter {
    /// Last raw cumulative count reported by the datapath
    pub current: u64,
    /// Accumulated rebasing correction
    pub offset: i64,
}

impl PeerCounter {
    pub fn new(bytes: u64) -> Self {
        Self {
            current: bytes,
            offset: 0,
        }
    }

    /// Visible traffic total
    pub fn total(&self) -> i128 {
        self.current as i128 + self.offset as i128
    }

    /// Visible total clamped into `u64`
    pub fn visible_bytes(&self) -> u64 {
        self.total().clamp(0, u64::MAX as i128) as u64
    }

    /// Apply a fresh raw count from the datapath
    pub fn observe(&mut self, bytes: u64) {
        if bytes < self.current {
            // Flow instance was evicted and restarted lower.
            self.offset = self.offset.saturating_add(to_signed(self.current));
        }
        self.current = bytes;
    }

    /// Zero the visible total while keeping the raw count
    pub fn rebase(&mut self) {
        self.offset = -to_signed(self.current);
    }
}

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Traffic history of one IP within one index
#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub mac: String,
    pub peers: BTreeMap<Ipv4Addr, PeerCounter>,
    pub rebased_at: DateTime<Utc>,
}

impl HostRecord {
    fn new(mac: &str, now: DateTime<Utc>) -> Self {
        Self {
            mac: mac.to_string(),
            peers: BTreeMap::new(),
            rebased_at: now,
        }
    }

    fn snapshot(&self, ip: Ipv4Addr) -> HostSnapshot {
        HostSnapshot {
            ip,
            mac: self.mac.clone(),
            totals: self
                .peers
                .iter()
                .map(|(peer, counter)| (*peer, counter.visible_bytes()))
                .collect(),
            since: self.rebased_at,
        }
    }

    fn rebase(&mut self, now: DateTime<Utc>) {
        for counter in self.peers.values_mut() {
            counter.rebase();
        }
        self.rebased_at = now;
    }
}

/// Per-IP traffic accounting over the source and destination indices
///
/// Not synchronised; share it through [`super::SharedFlowTable`].
#[derive(Debug, Default)]
pub struct FlowTable {
    sources: HashMap<Ipv4Addr, HostRecord>,
    destinations: HashMap<Ipv4Addr, HostRecord>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, index: FlowIndex) -> &HashMap<Ipv4Addr, HostRecord> {
        match index {
            FlowIndex::AsSource => &self.sources,
            FlowIndex::AsDestination => &self.destinations,
        }
    }

    fn index_mut(&mut self, index: FlowIndex) -> &mut HashMap<Ipv4Addr, HostRecord> {
        match index {
            FlowIndex::AsSource => &mut self.sources,
            FlowIndex::AsDestination => &mut self.destinations,
        }
    }

    /// Fold one sample into both indices
    pub fn update(&mut self, entry: &FlowEntry) {
        self.update_at(entry, Utc::now());
    }

    /// Fold one sample into both indices, stamping new records with `now`
    pub fn update_at(&mut self, entry: &FlowEntry, now: DateTime<Utc>) {
        Self::observe(
            &mut self.sources,
            entry.src_ip,
            &entry.src_mac,
            entry.dst_ip,
            entry.bytes,
            now,
        );
        Self::observe(
            &mut self.destinations,
            entry.dst_ip,
            &entry.dst_mac,
            entry.src_ip,
            entry.bytes,
            now,
        );
    }

    fn observe(
        records: &mut HashMap<Ipv4Addr, HostRecord>,
        owner: Ipv4Addr,
        mac: &str,
        peer: Ipv4Addr,
        bytes: u64,
        now: DateTime<Utc>,
    ) {
        let record = records
            .entry(owner)
            .or_insert_with(|| HostRecord::new(mac, now));

        record
            .peers
            .entry(peer)
            .and_modify(|counter| counter.observe(bytes))
            .or_insert_with(|| PeerCounter::new(bytes));
    }

    /// Rebase every peer of `ip` in one index. Returns false if absent.
    pub fn reset(&mut self, ip: Ipv4Addr, index: FlowIndex) -> bool {
        self.reset_at(ip, index, Utc::now())
    }

    pub fn reset_at(&mut self, ip: Ipv4Addr, index: FlowIndex, now: DateTime<Utc>) -> bool {
        match self.index_mut(index).get_mut(&ip) {
            Some(record) => {
                record.rebase(now);
                true
            }
            None => false,
        }
    }

    /// Rebase a single owner -> peer edge, leaving the record timestamp alone
    pub fn reset_peer(&mut self, owner: Ipv4Addr, peer: Ipv4Addr, index: FlowIndex) -> bool {
        match self
            .index_mut(index)
            .get_mut(&owner)
            .and_then(|record| record.peers.get_mut(&peer))
        {
            Some(counter) => {
                counter.rebase();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, ip: Ipv4Addr, index: FlowIndex) -> Option<&HostRecord> {
        self.index(index).get(&ip)
    }

    /// Value copy of a record without rebasing it
    pub fn copy(&self, ip: Ipv4Addr, index: FlowIndex) -> Option<HostSnapshot> {
        self.get(ip, index).map(|record| record.snapshot(ip))
    }

    /// Value copy of a record, then rebase it to start a new window
    pub fn copy_and_reset(&mut self, ip: Ipv4Addr, index: FlowIndex) -> Option<HostSnapshot> {
        self.copy_and_reset_at(ip, index, Utc::now())
    }

    pub fn copy_and_reset_at(
        &mut self,
        ip: Ipv4Addr,
        index: FlowIndex,
        now: DateTime<Utc>,
    ) -> Option<HostSnapshot> {
        let record = self.index_mut(index).get_mut(&ip)?;
        let snapshot = record.snapshot(ip);
        record.rebase(now);
        Some(snapshot)
    }

    pub fn has_history(&self, ip: Ipv4Addr, index: FlowIndex) -> bool {
        self.index(index).contains_key(&ip)
    }

    /// Whether `owner` has a counter for `peer` in the given index
    pub fn has_edge(&self, owner: Ipv4Addr, peer: Ipv4Addr, index: FlowIndex) -> bool {
        self.get(owner, index)
            .map(|record| record.peers.contains_key(&peer))
            .unwrap_or(false)
    }

    /// MAC of `ip`, preferring the source index
    pub fn mac_of(&self, ip: Ipv4Addr) -> Option<&str> {
        self.sources
            .get(&ip)
            .or_else(|| self.destinations.get(&ip))
            .map(|record| record.mac.as_str())
    }

    /// Drop a record entirely. Returns whether one existed.
    pub fn evict(&mut self, ip: Ipv4Addr, index: FlowIndex) -> bool {
        self.index_mut(index).remove(&ip).is_some()
    }

    pub fn host_count(&self, index: FlowIndex) -> usize {
        self.index(index).len()
    }
}
