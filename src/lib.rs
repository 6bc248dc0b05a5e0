//! riskwarden: real-time trading risk enforcement daemon.
//!
//! Monitors brokerage accounts over push streams, evaluates every event
//! against the configured risk rules, and enforces breaches through the
//! brokerage REST API (close, cancel, protective stops, lockouts).

pub mod api;
pub mod config;
pub mod core;
pub mod enforcement;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod router;
pub mod rules;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;
