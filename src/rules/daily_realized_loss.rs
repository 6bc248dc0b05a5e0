//! RULE-003: hard daily realized loss limit.
//!
//! Fires on trades that carry realized P&L (half-turns are ignored). A
//! daily total strictly below the limit flattens the account and locks it
//! until the next daily reset in the broker timezone.

use super::{lockout_until_reset, Breach, BreachAction, LockoutSpec, RiskRule};
use crate::config::DailyRealizedLossConfig;
use crate::core::{LockoutManager, PnlTracker, SessionClock};
use crate::enforcement::EnforcementActions;
use crate::models::Trade;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

pub struct DailyRealizedLossRule {
    config: DailyRealizedLossConfig,
    pnl: Arc<PnlTracker>,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    clock: SessionClock,
}

impl DailyRealizedLossRule {
    pub const RULE_ID: &'static str = "RULE-003";

    pub fn new(
        config: DailyRealizedLossConfig,
        pnl: Arc<PnlTracker>,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
        clock: SessionClock,
    ) -> Self {
        Self {
            config,
            pnl,
            actions,
            lockouts,
            clock,
        }
    }
}

#[async_trait]
impl RiskRule for DailyRealizedLossRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_trade(&self, trade: &Trade) -> Option<Breach> {
        // Half-turns carry no realized P&L and cannot move the daily total.
        trade.realized_pnl?;

        let daily = self.pnl.daily_realized(trade.account_id);
        if daily >= self.config.limit {
            return None;
        }

        warn!(
            account_id = trade.account_id,
            daily_pnl = daily,
            limit = self.config.limit,
            "daily realized loss limit breached"
        );
        let lockout = if self.config.lockout_until_reset {
            lockout_until_reset(&self.clock, Utc::now())
        } else {
            LockoutSpec::None
        };
        Some(Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::CloseAllAndLockout { lockout },
            reason: format!(
                "daily loss limit hit: ${daily:.2} < ${:.2}",
                self.config.limit
            ),
            observed_metrics: serde_json::json!({
                "daily_pnl": daily,
                "limit": self.config.limit,
            }),
        })
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        let BreachAction::CloseAllAndLockout { lockout } = &breach.action else {
            return false;
        };
        let close_ok = self.actions.close_all_positions(account_id).await;
        let cancel_ok = self.actions.cancel_all_orders(account_id).await;
        match lockout {
            LockoutSpec::Until(until) => {
                self.lockouts
                    .set_lockout(account_id, breach.reason.clone(), Some(*until))
                    .await;
            }
            LockoutSpec::Indefinite => {
                self.lockouts
                    .set_lockout(account_id, breach.reason.clone(), None)
                    .await;
            }
            LockoutSpec::None => {}
        }
        close_ok && cancel_ok
    }
}
