//! IPv4 literal <-> packed integer conversions used on the wire

use crate::error::AddressError;
use std::net::Ipv4Addr;

/// Parse a dotted-quad literal
///
/// Exactly four octets, each one to three ASCII digits in [0, 255] with no
/// leading zero, so every address has one literal.
pub fn parse_ipv4(literal: &str) -> Result<Ipv4Addr, AddressError> {
    let invalid = || AddressError::InvalidLiteral(literal.to_string());

    let parts: Vec<&str> = literal.split('.').collect();
    if parts.len() != 4 {
        return Err(invalid());
    }

    let mut octets = [0u8; 4];
    for (octet, part) in octets.iter_mut().zip(parts) {
        if part.is_empty()
            || part.len() > 3
            || (part.len() > 1 && part.starts_with('0'))
            || !part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        *octet = part.parse().map_err(|_| invalid())?;
    }

    Ok(Ipv4Addr::from(octets))
}

/// `"10.2.0.1"` -> `167903233`
pub fn ipv4_str_to_int(literal: &str) -> Result<u32, AddressError> {
    parse_ipv4(literal).map(u32::from)
}

/// Packed integer to address, rejecting anything outside `u32`
pub fn int_to_ipv4(value: i64) -> Result<Ipv4Addr, AddressError> {
    u32::try_from(value)
        .map(Ipv4Addr::from)
        .map_err(|_| AddressError::OutOfRange(value))
}

/// `167903233` -> `"10.2.0.1"`
pub fn ipv4_int_to_str(value: i64) -> Result<String, AddressError> {
    int_to_ipv4(value).map(|addr| addr.to_string())
}
