//! Migration token wire format and ring circulation
//!
//! Tokens carry packed IPv4 identifiers, so the literal/integer conversions
//! live here too.

mod address;
mod codec;
mod server;

#[cfg(test)]
mod tests;

pub use address::{int_to_ipv4, ipv4_int_to_str, ipv4_str_to_int, parse_ipv4};
pub use codec::{saturating_cost, MigrationToken, RecordLayout, TokenRecord, ID_WIDTH};
pub use server::{
    read_to_eof, send_token, Algorithm, TokenOutcome, TokenServer, TokenServerConfig,
    DEFAULT_TOKEN_PORT, MAX_MESSAGE_BYTES,
};
