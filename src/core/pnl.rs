//! Realized and unrealized P&L, the single source every loss/profit rule
//! reads.
//!
//! Realized P&L accumulates per account per session date and persists on
//! every trade. Unrealized P&L is derived on demand from open positions,
//! fresh quotes, and contract tick metadata; a position with a missing or
//! stale quote is skipped (logged), never an error.

use super::contracts::ContractCache;
use super::quotes::QuoteTracker;
use super::session::SessionClock;
use super::state::StateManager;
use crate::models::PositionDirection;
use crate::persistence::Store;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PnlTracker {
    state: Arc<StateManager>,
    quotes: Arc<QuoteTracker>,
    contracts: Arc<ContractCache>,
    store: Option<Store>,
    clock: SessionClock,
    daily: RwLock<HashMap<i64, f64>>,
}

impl PnlTracker {
    pub fn new(
        state: Arc<StateManager>,
        quotes: Arc<QuoteTracker>,
        contracts: Arc<ContractCache>,
        store: Option<Store>,
        clock: SessionClock,
    ) -> Self {
        Self {
            state,
            quotes,
            contracts,
            store,
            clock,
            daily: RwLock::new(HashMap::new()),
        }
    }

    /// Restore a daily total loaded from the store at startup.
    pub fn preload_daily(&self, account_id: i64, realized: f64) {
        self.daily.write().insert(account_id, realized);
        info!(account_id, realized, "daily P&L preloaded from store");
    }

    /// Accumulate a trade's realized P&L and persist; returns the new
    /// daily total.
    pub async fn add_trade_pnl(&self, account_id: i64, pnl: f64) -> f64 {
        let total = {
            let mut daily = self.daily.write();
            let entry = daily.entry(account_id).or_insert(0.0);
            *entry += pnl;
            *entry
        };

        if let Some(store) = &self.store {
            let date = self.clock.session_date(Utc::now());
            if let Err(err) = store.upsert_daily_pnl(account_id, date, total).await {
                warn!(account_id, error = %err, "failed to persist daily P&L");
            }
        }

        info!(account_id, pnl, daily_total = total, "realized P&L recorded");
        total
    }

    pub fn daily_realized(&self, account_id: i64) -> f64 {
        self.daily.read().get(&account_id).copied().unwrap_or(0.0)
    }

    /// Zero the daily aggregate at the session boundary; the archived day
    /// stays in the store under its own date.
    pub async fn reset_daily(&self, account_id: i64) {
        self.daily.write().insert(account_id, 0.0);
        if let Some(store) = &self.store {
            let date = self.clock.session_date(Utc::now());
            if let Err(err) = store.upsert_daily_pnl(account_id, date, 0.0).await {
                warn!(account_id, error = %err, "failed to persist daily P&L reset");
            }
        }
        info!(account_id, "daily P&L reset");
    }

    fn position_pnl(&self, direction: PositionDirection, size: i64, entry: f64, last: f64, tick_size: f64, tick_value: f64) -> Option<f64> {
        if tick_size <= 0.0 {
            return None;
        }
        let mut ticks = (last - entry) / tick_size;
        if direction == PositionDirection::Short {
            ticks = -ticks;
        }
        Some(ticks * tick_value * size as f64)
    }

    /// Total unrealized P&L over all open positions.
    pub fn calculate_unrealized(&self, account_id: i64) -> f64 {
        self.calculate_per_position(account_id).values().sum()
    }

    /// Unrealized P&L per contract. Positions lacking a fresh quote or
    /// cached contract are skipped.
    pub fn calculate_per_position(&self, account_id: i64) -> HashMap<String, f64> {
        let mut result = HashMap::new();
        for position in self.state.open_positions(account_id) {
            let Some(last_price) = self.quotes.fresh_price(&position.contract_id) else {
                debug!(
                    contract_id = %position.contract_id,
                    "no fresh quote, skipping position P&L"
                );
                continue;
            };
            let Some(contract) = self.contracts.get(&position.contract_id) else {
                warn!(
                    contract_id = %position.contract_id,
                    "contract metadata missing, skipping position P&L"
                );
                continue;
            };
            let Some(pnl) = self.position_pnl(
                position.direction,
                position.size,
                position.average_price,
                last_price,
                contract.tick_size,
                contract.tick_value,
            ) else {
                warn!(
                    contract_id = %position.contract_id,
                    tick_size = contract.tick_size,
                    "invalid tick size, skipping position P&L"
                );
                continue;
            };
            result.insert(position.contract_id.clone(), pnl);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Contract, Position, Quote};

    fn fixture() -> (Arc<StateManager>, Arc<QuoteTracker>, Arc<ContractCache>, PnlTracker) {
        let state = Arc::new(StateManager::new());
        let quotes = Arc::new(QuoteTracker::new());
        let contracts = Arc::new(ContractCache::new());
        let clock = SessionClock::from_config("17:00", "America/New_York").unwrap();
        let tracker = PnlTracker::new(
            state.clone(),
            quotes.clone(),
            contracts.clone(),
            None,
            clock,
        );
        (state, quotes, contracts, tracker)
    }

    fn mnq_contract() -> Contract {
        Contract {
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            name: "MNQ".to_string(),
            symbol: "F.US.MNQ".to_string(),
            tick_size: 0.25,
            tick_value: 0.5,
            contract_size: 1,
            active_contract: true,
        }
    }

    fn long_position(size: i64, entry: f64) -> Position {
        Position {
            position_id: Some(1),
            account_id: 1,
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            opened_at: None,
            direction: PositionDirection::Long,
            size,
            average_price: entry,
        }
    }

    fn post_quote(quotes: &QuoteTracker, price: f64) {
        quotes.on_quote(&Quote {
            symbol: "F.US.MNQ".to_string(),
            last_price: Some(price),
            best_bid: None,
            best_ask: None,
            last_updated: Some(Utc::now()),
        });
    }

    #[tokio::test]
    async fn test_realized_accumulates() {
        let (_, _, _, tracker) = fixture();
        assert_eq!(tracker.add_trade_pnl(1, -450.0).await, -450.0);
        assert_eq!(tracker.add_trade_pnl(1, -75.5).await, -525.5);
        assert_eq!(tracker.daily_realized(1), -525.5);
        assert_eq!(tracker.daily_realized(2), 0.0);
    }

    #[tokio::test]
    async fn test_reset_daily_zeroes() {
        let (_, _, _, tracker) = fixture();
        tracker.add_trade_pnl(1, 120.0).await;
        tracker.reset_daily(1).await;
        assert_eq!(tracker.daily_realized(1), 0.0);
    }

    #[test]
    fn test_unrealized_long() {
        let (state, quotes, contracts, tracker) = fixture();
        contracts.insert(mnq_contract());
        state.apply_position(long_position(2, 21000.0));
        post_quote(&quotes, 21005.0);

        // (21005 - 21000) / 0.25 = 20 ticks * $0.50 * 2 = $20
        let total = tracker.calculate_unrealized(1);
        assert!((total - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_short_sign_flips() {
        let (state, quotes, contracts, tracker) = fixture();
        contracts.insert(mnq_contract());
        state.apply_position(Position {
            direction: PositionDirection::Short,
            ..long_position(2, 21000.0)
        });
        post_quote(&quotes, 21005.0);

        let total = tracker.calculate_unrealized(1);
        assert!((total + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_quote_skips_position() {
        let (state, _, contracts, tracker) = fixture();
        contracts.insert(mnq_contract());
        state.apply_position(long_position(2, 21000.0));

        assert_eq!(tracker.calculate_unrealized(1), 0.0);
        assert!(tracker.calculate_per_position(1).is_empty());
    }

    #[test]
    fn test_missing_contract_skips_position() {
        let (state, quotes, _, tracker) = fixture();
        state.apply_position(long_position(2, 21000.0));
        post_quote(&quotes, 21010.0);

        assert_eq!(tracker.calculate_unrealized(1), 0.0);
    }

    #[tokio::test]
    async fn test_preload_restores_startup_state() {
        let (_, _, _, tracker) = fixture();
        tracker.preload_daily(1, -450.0);
        assert_eq!(tracker.add_trade_pnl(1, -75.5).await, -525.5);
    }
}
