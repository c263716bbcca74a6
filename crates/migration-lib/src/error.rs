//! Error types surfaced by the algorithmic components
//!
//! Boundary errors are typed so callers can tell a malformed input apart
//! from an I/O failure. Adapters and collaborator seams use `anyhow`.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Malformed IPv4 literal or packed integer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Literal does not have exactly four dot-separated decimal octets in [0, 255]
    #[error("invalid IPv4 address format: {0:?}")]
    InvalidLiteral(String),

    /// Integer outside [0, 2^32 - 1]
    #[error("IP address out of range: {0}")]
    OutOfRange(i64),
}

/// Token wire format violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Byte stream length is not a multiple of the record width
    #[error("token of {len} bytes is not a whole number of {width}-byte records")]
    Misaligned { len: usize, width: usize },
}

/// Failures of the decision engine itself (not of its collaborators)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    /// Traffic was recorded for the VM but its MAC vanished before it could be read
    #[error("no MAC address recorded for {0}")]
    MacUnresolved(Ipv4Addr),
}
