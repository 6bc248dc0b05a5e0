//! Last-price store fed by the market hub.
//!
//! Quotes arrive keyed by gateway symbol ("F.US.MNQ"); positions reference
//! contract ids ("CON.F.US.MNQ.U25"). Both normalize to the symbol root so
//! P&L lookups hit regardless of which spelling the caller holds.

use crate::models::{extract_symbol_root, Quote};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Quotes older than this are reported stale; P&L-driven rules skip them.
pub const STALE_AFTER_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct QuoteEntry {
    last_price: f64,
    received_at: DateTime<Utc>,
}

/// Normalize any spelling to the symbol root: contract ids take the 4th
/// dot-segment, bare gateway symbols their last.
pub fn quote_key(symbol_or_contract: &str) -> &str {
    if symbol_or_contract.starts_with("CON.") {
        return extract_symbol_root(symbol_or_contract);
    }
    symbol_or_contract
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(symbol_or_contract)
}

#[derive(Default)]
pub struct QuoteTracker {
    quotes: RwLock<HashMap<String, QuoteEntry>>,
}

impl QuoteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_quote(&self, quote: &Quote) {
        let Some(last_price) = quote.last_price else {
            return;
        };
        let key = quote_key(&quote.symbol).to_string();
        self.quotes.write().insert(
            key,
            QuoteEntry {
                last_price,
                received_at: quote.last_updated.unwrap_or_else(Utc::now),
            },
        );
    }

    /// Latest price regardless of age.
    pub fn last_price(&self, symbol_or_contract: &str) -> Option<f64> {
        let key = quote_key(symbol_or_contract);
        self.quotes.read().get(key).map(|entry| entry.last_price)
    }

    pub fn is_stale(&self, symbol_or_contract: &str, now: DateTime<Utc>) -> bool {
        let key = quote_key(symbol_or_contract);
        match self.quotes.read().get(key) {
            Some(entry) => now - entry.received_at > Duration::seconds(STALE_AFTER_SECS),
            None => true,
        }
    }

    /// Latest price, or None when missing or stale.
    pub fn fresh_price(&self, symbol_or_contract: &str) -> Option<f64> {
        let key = quote_key(symbol_or_contract);
        let quotes = self.quotes.read();
        let entry = quotes.get(key)?;
        if Utc::now() - entry.received_at > Duration::seconds(STALE_AFTER_SECS) {
            debug!(symbol = key, "quote is stale, skipping");
            return None;
        }
        Some(entry.last_price)
    }
}
