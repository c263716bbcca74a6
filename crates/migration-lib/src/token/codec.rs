//! Binary encoding of migration tokens
//!
//! A token is a sequence of fixed-width records with no length prefix or
//! terminator. Each record starts with a big-endian 32-bit identifier (a
//! packed IPv4 address); the cost-carrying layout appends one cost byte.

use crate::error::TokenError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Width of the identifier part of every record
pub const ID_WIDTH: usize = 4;

/// Record layout of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordLayout {
    /// 4-byte identifier
    Basic,
    /// 4-byte identifier followed by a 1-byte cost
    WithCost,
}

impl RecordLayout {
    /// Bytes per record
    pub fn width(&self) -> usize {
        match self {
            RecordLayout::Basic => ID_WIDTH,
            RecordLayout::WithCost => ID_WIDTH + 1,
        }
    }

    /// Total encoded length of `records` records
    pub fn encoded_len(&self, records: usize) -> usize {
        records * self.width()
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordLayout::Basic => "basic",
            RecordLayout::WithCost => "with_cost",
        }
    }
}

impl std::fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One token entry
///
/// `cost` is always zero in `Basic` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: u32,
    pub cost: u8,
}

impl TokenRecord {
    pub fn new(id: u32, cost: u8) -> Self {
        Self { id, cost }
    }

    /// Identifier as an IPv4 address
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.id)
    }
}

/// Clamp a wide cost into the one-byte wire range
pub fn saturating_cost(cost: u64) -> u8 {
    u8::try_from(cost).unwrap_or(u8::MAX)
}

/// Ordered queue of host identifiers circulated around the ring
///
/// Immutable: stripping the head builds a new token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationToken {
    layout: RecordLayout,
    records: Vec<TokenRecord>,
}

impl MigrationToken {
    /// Token of bare identifiers
    pub fn basic<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        Self {
            layout: RecordLayout::Basic,
            records: ids.into_iter().map(|id| TokenRecord::new(id, 0)).collect(),
        }
    }

    /// Token of identifiers paired with cost bytes
    pub fn with_costs<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, u8)>,
    {
        Self {
            layout: RecordLayout::WithCost,
            records: entries
                .into_iter()
                .map(|(id, cost)| TokenRecord::new(id, cost))
                .collect(),
        }
    }

    /// Basic token built from addresses
    pub fn from_addrs<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        Self::basic(addrs.into_iter().map(u32::from))
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn head(&self) -> Option<&TokenRecord> {
        self.records.first()
    }

    pub fn head_addr(&self) -> Option<Ipv4Addr> {
        self.head().map(TokenRecord::addr)
    }

    /// Remaining queue after removing the head
    ///
    /// Stripping an empty token yields an empty token.
    pub fn strip_head(&self) -> MigrationToken {
        Self {
            layout: self.layout,
            records: self.records.iter().skip(1).copied().collect(),
        }
    }

    /// Exactly `layout.encoded_len(len())` bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.layout.encoded_len(self.records.len()));
        for record in &self.records {
            buf.extend_from_slice(&record.id.to_be_bytes());
            if self.layout == RecordLayout::WithCost {
                buf.push(record.cost);
            }
        }
        buf
    }

    /// Decode a complete byte stream
    ///
    /// The length must be a whole number of records; an empty stream is an
    /// empty token.
    pub fn decode(bytes: &[u8], layout: RecordLayout) -> Result<Self, TokenError> {
        let width = layout.width();
        if bytes.len() % width != 0 {
            return Err(TokenError::Misaligned {
                len: bytes.len(),
                width,
            });
        }

        let records = bytes
            .chunks_exact(width)
            .map(|chunk| {
                let id = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let cost = match layout {
                    RecordLayout::Basic => 0,
                    RecordLayout::WithCost => chunk[ID_WIDTH],
                };
                TokenRecord::new(id, cost)
            })
            .collect();

        Ok(Self { layout, records })
    }
}
