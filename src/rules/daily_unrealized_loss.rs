//! RULE-004: floating loss limit, re-evaluated on every quote.
//!
//! `total` scope flattens the account (optional lockout until reset) when
//! aggregate unrealized P&L reaches the negative limit; `per_position`
//! closes only the first offending position.

use super::{lockout_until_reset, Breach, BreachAction, LockoutSpec, RiskRule};
use crate::config::{DailyUnrealizedLossConfig, PnlScope};
use crate::core::{LockoutManager, PnlTracker, SessionClock};
use crate::enforcement::EnforcementActions;
use crate::models::Quote;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

pub struct DailyUnrealizedLossRule {
    config: DailyUnrealizedLossConfig,
    pnl: Arc<PnlTracker>,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    clock: SessionClock,
}

impl DailyUnrealizedLossRule {
    pub const RULE_ID: &'static str = "RULE-004";

    pub fn new(
        config: DailyUnrealizedLossConfig,
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
impl RiskRule for DailyUnrealizedLossRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_quote(&self, account_id: i64, _quote: &Quote) -> Option<Breach> {
        let floor = -self.config.loss_limit;
        match self.config.scope {
            PnlScope::Total => {
                let unrealized = self.pnl.calculate_unrealized(account_id);
                if unrealized > floor {
                    return None;
                }
                warn!(
                    account_id,
                    unrealized, floor, "total unrealized loss limit breached"
                );
                let lockout = if self.config.lockout {
                    lockout_until_reset(&self.clock, Utc::now())
                } else {
                    LockoutSpec::None
                };
                Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::CloseAllAndLockout { lockout },
                    reason: format!(
                        "total unrealized loss ${unrealized:.2} exceeds limit ${floor:.2}"
                    ),
                    observed_metrics: serde_json::json!({
                        "unrealized_pnl": unrealized,
                        "limit": floor,
                        "scope": "total",
                    }),
                })
            }
            PnlScope::PerPosition => {
                let per_position = self.pnl.calculate_per_position(account_id);
                let (contract_id, pnl) = per_position
                    .into_iter()
                    .find(|(_, pnl)| *pnl <= floor)?;
                warn!(
                    account_id,
                    contract_id = %contract_id,
                    pnl,
                    floor,
                    "per-position unrealized loss limit breached"
                );
                Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::ClosePosition {
                        contract_id: contract_id.clone(),
                    },
                    reason: format!(
                        "position {contract_id} unrealized loss ${pnl:.2} exceeds limit ${floor:.2}"
                    ),
                    observed_metrics: serde_json::json!({
                        "unrealized_pnl": pnl,
                        "limit": floor,
                        "scope": "per_position",
                        "contract_id": contract_id,
                    }),
                })
            }
        }
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        match &breach.action {
            BreachAction::CloseAllAndLockout { lockout } => {
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
            BreachAction::ClosePosition { contract_id } => {
                self.actions.close_position(account_id, contract_id).await
            }
            _ => false,
        }
    }
}
