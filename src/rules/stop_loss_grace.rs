//! RULE-008: grace period for unprotected positions.
//!
//! A position arriving without a working protective stop starts a keyed
//! timer; an opposite-side stop order on the same contract cancels it.
//! When the timer fires with the position still unprotected, the account
//! is flattened and locked for the configured duration.

use super::{Breach, RiskRule};
use crate::config::StopLossGraceConfig;
use crate::core::{LockoutManager, StateManager, TimerManager};
use crate::enforcement::EnforcementActions;
use crate::models::{Order, Position};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct StopLossGraceRule {
    config: StopLossGraceConfig,
    state: Arc<StateManager>,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    timers: Arc<TimerManager>,
}

fn grace_key(account_id: i64, contract_id: &str) -> String {
    format!("no_sl_grace:{account_id}:{contract_id}")
}

impl StopLossGraceRule {
    pub const RULE_ID: &'static str = "RULE-008";

    pub fn new(
        config: StopLossGraceConfig,
        state: Arc<StateManager>,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
        timers: Arc<TimerManager>,
    ) -> Self {
        Self {
            config,
            state,
            actions,
            lockouts,
            timers,
        }
    }

    /// The timer body: re-check, then flatten and lock.
    async fn on_grace_expired(
        account_id: i64,
        contract_id: String,
        grace_secs: u64,
        lockout_secs: u64,
        state: Arc<StateManager>,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
    ) {
        if state.position(account_id, &contract_id).is_none() {
            debug!(account_id, contract_id = %contract_id, "grace expired but position already flat");
            return;
        }
        if !state.protective_stops(account_id, &contract_id).is_empty() {
            debug!(account_id, contract_id = %contract_id, "grace expired but a stop arrived");
            return;
        }
        if lockouts.is_locked_out(account_id) {
            return;
        }

        warn!(
            account_id,
            contract_id = %contract_id,
            grace_secs,
            "no stop-loss placed within grace period"
        );
        let reason =
            format!("no stop-loss on {contract_id} within {grace_secs}s grace period");
        let close_ok = actions.close_all_positions(account_id).await;
        let cancel_ok = actions.cancel_all_orders(account_id).await;
        lockouts
            .set_lockout(
                account_id,
                reason.clone(),
                Some(Utc::now() + Duration::seconds(lockout_secs as i64)),
            )
            .await;
        actions
            .log_enforcement(
                &uuid::Uuid::new_v4().to_string(),
                account_id,
                Self::RULE_ID,
                "CLOSE_ALL_AND_LOCKOUT",
                &reason,
                serde_json::json!({
                    "contract_id": contract_id,
                    "grace_period_seconds": grace_secs,
                    "lockout_duration_seconds": lockout_secs,
                    "close_ok": close_ok,
                    "cancel_ok": cancel_ok,
                }),
            )
            .await;
    }
}

#[async_trait]
impl RiskRule for StopLossGraceRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_position(&self, position: &Position) -> Option<Breach> {
        let key = grace_key(position.account_id, &position.contract_id);

        if position.size == 0 {
            if self.timers.cancel(&key) {
                debug!(key = %key, "position closed, grace timer cancelled");
            }
            return None;
        }

        if !self
            .state
            .protective_stops(position.account_id, &position.contract_id)
            .is_empty()
        {
            self.timers.cancel(&key);
            return None;
        }

        if self.timers.has(&key) {
            return None;
        }

        info!(
            account_id = position.account_id,
            contract_id = %position.contract_id,
            grace_secs = self.config.grace_period_seconds,
            "unprotected position, starting stop-loss grace timer"
        );
        let account_id = position.account_id;
        let contract_id = position.contract_id.clone();
        let grace_secs = self.config.grace_period_seconds;
        let lockout_secs = self.config.lockout_duration_seconds;
        let state = self.state.clone();
        let actions = self.actions.clone();
        let lockouts = self.lockouts.clone();
        self.timers.schedule(
            key,
            Utc::now() + Duration::seconds(grace_secs as i64),
            async move {
                Self::on_grace_expired(
                    account_id,
                    contract_id,
                    grace_secs,
                    lockout_secs,
                    state,
                    actions,
                    lockouts,
                )
                .await;
            },
        );
        None
    }

    async fn on_order(&self, order: &Order) -> Option<Breach> {
        // A protective stop arriving for the contract satisfies the rule.
        if !order.order_type.is_protective_stop() || !order.state.is_working() {
            return None;
        }
        let Some(position) = self.state.position(order.account_id, &order.contract_id) else {
            return None;
        };
        let expected_side = match position.direction {
            crate::models::PositionDirection::Long => crate::models::OrderSide::Sell,
            crate::models::PositionDirection::Short => crate::models::OrderSide::Buy,
        };
        if order.side == expected_side {
            let key = grace_key(order.account_id, &order.contract_id);
            if self.timers.cancel(&key) {
                info!(key = %key, "protective stop arrived, grace timer cancelled");
            }
        }
        None
    }

    async fn enforce(&self, _account_id: i64, _breach: &Breach) -> bool {
        // Enforcement happens in the timer callback, not via the router.
        true
    }
}
