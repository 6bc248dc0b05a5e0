//! RULE-006: overtrading guard.
//!
//! Execution counts roll over minute/hour/session windows; the most
//! severe overflowing window wins (session > hour > minute) and earns its
//! configured cooldown. No positions are touched.

use super::{Breach, BreachAction, RiskRule};
use crate::config::TradeFrequencyConfig;
use crate::core::{LockoutManager, TradeCounter};
use crate::models::Trade;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

pub struct TradeFrequencyRule {
    config: TradeFrequencyConfig,
    counter: Arc<TradeCounter>,
    lockouts: Arc<LockoutManager>,
}

impl TradeFrequencyRule {
    pub const RULE_ID: &'static str = "RULE-006";

    pub fn new(
        config: TradeFrequencyConfig,
        counter: Arc<TradeCounter>,
        lockouts: Arc<LockoutManager>,
    ) -> Self {
        Self {
            config,
            counter,
            lockouts,
        }
    }
}

#[async_trait]
impl RiskRule for TradeFrequencyRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_trade(&self, trade: &Trade) -> Option<Breach> {
        let counts = self
            .counter
            .counts(trade.account_id, trade.executed_at.unwrap_or_else(Utc::now));

        // Most severe window first.
        let (window, count, limit, cooldown) = if let Some(limit) = self.config.per_session {
            if counts.session > limit {
                (
                    "per_session",
                    counts.session,
                    limit,
                    self.config.per_session_cooldown_secs,
                )
            } else {
                self.hour_or_minute(&counts)?
            }
        } else {
            self.hour_or_minute(&counts)?
        };

        warn!(
            account_id = trade.account_id,
            window, count, limit, "trade frequency limit breached"
        );
        Some(Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::Cooldown {
                duration_secs: cooldown,
            },
            reason: format!("trade frequency limit: {count}/{limit} trades ({window})"),
            observed_metrics: serde_json::json!({
                "breach_type": window,
                "trade_count": count,
                "limit": limit,
                "cooldown_secs": cooldown,
            }),
        })
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        let BreachAction::Cooldown { duration_secs } = &breach.action else {
            return false;
        };
        // Cooldown only; positions stay open.
        self.lockouts
            .set_cooldown(account_id, breach.reason.clone(), *duration_secs)
            .await;
        true
    }
}

impl TradeFrequencyRule {
    fn hour_or_minute(
        &self,
        counts: &crate::core::TradeCounts,
    ) -> Option<(&'static str, usize, usize, u64)> {
        if let Some(limit) = self.config.per_hour {
            if counts.hour > limit {
                return Some((
                    "per_hour",
                    counts.hour,
                    limit,
                    self.config.per_hour_cooldown_secs,
                ));
            }
        }
        if let Some(limit) = self.config.per_minute {
            if counts.minute > limit {
                return Some((
                    "per_minute",
                    counts.minute,
                    limit,
                    self.config.per_minute_cooldown_secs,
                ));
            }
        }
        None
    }
}
