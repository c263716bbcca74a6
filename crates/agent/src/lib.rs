//! Migration agent daemon internals
//!
//! Exposed as a library so the HTTP router and configuration can be tested
//! from `tests/`.

pub mod api;
pub mod config;
pub mod daemon;
