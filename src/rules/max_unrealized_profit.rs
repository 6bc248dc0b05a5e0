//! RULE-005: profit target / breakeven exit.
//!
//! `profit_target` locks in gains once unrealized P&L reaches the target
//! (account-wide or per position). `breakeven` arms on a position that has
//! been in profit and closes it when the P&L falls back to zero or below.

use super::{lockout_until_reset, Breach, BreachAction, LockoutSpec, RiskRule};
use crate::config::{MaxUnrealizedProfitConfig, PnlScope, ProfitMode};
use crate::core::{LockoutManager, PnlTracker, SessionClock};
use crate::enforcement::EnforcementActions;
use crate::models::Quote;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MaxUnrealizedProfitRule {
    config: MaxUnrealizedProfitConfig,
    pnl: Arc<PnlTracker>,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    clock: SessionClock,
    /// Positions that have been observed in profit; breakeven mode only
    /// closes a position that armed first.
    armed: RwLock<HashSet<(i64, String)>>,
}

impl MaxUnrealizedProfitRule {
    pub const RULE_ID: &'static str = "RULE-005";

    pub fn new(
        config: MaxUnrealizedProfitConfig,
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
            armed: RwLock::new(HashSet::new()),
        }
    }

    fn check_profit_target(&self, account_id: i64) -> Option<Breach> {
        let target = self.config.profit_target;
        match self.config.scope {
            PnlScope::Total => {
                let unrealized = self.pnl.calculate_unrealized(account_id);
                if unrealized < target {
                    return None;
                }
                info!(account_id, unrealized, target, "profit target reached");
                let lockout = if self.config.lockout {
                    lockout_until_reset(&self.clock, Utc::now())
                } else {
                    LockoutSpec::None
                };
                Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::CloseAllAndLockout { lockout },
                    reason: format!("profit target hit: ${unrealized:.2} >= ${target:.2}"),
                    observed_metrics: serde_json::json!({
                        "unrealized_pnl": unrealized,
                        "target": target,
                        "mode": "profit_target",
                        "scope": "total",
                    }),
                })
            }
            PnlScope::PerPosition => {
                let per_position = self.pnl.calculate_per_position(account_id);
                let (contract_id, pnl) =
                    per_position.into_iter().find(|(_, pnl)| *pnl >= target)?;
                info!(account_id, contract_id = %contract_id, pnl, target, "position profit target reached");
                Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::ClosePosition {
                        contract_id: contract_id.clone(),
                    },
                    reason: format!(
                        "position {contract_id} profit target: ${pnl:.2} >= ${target:.2}"
                    ),
                    observed_metrics: serde_json::json!({
                        "unrealized_pnl": pnl,
                        "target": target,
                        "mode": "profit_target",
                        "scope": "per_position",
                        "contract_id": contract_id,
                    }),
                })
            }
        }
    }

    fn check_breakeven(&self, account_id: i64) -> Option<Breach> {
        // Breakeven exits are inherently per position.
        let per_position = self.pnl.calculate_per_position(account_id);
        let mut armed = self.armed.write();

        let mut breach = None;
        for (contract_id, pnl) in per_position {
            let key = (account_id, contract_id.clone());
            if pnl > 0.0 {
                armed.insert(key);
                continue;
            }
            if armed.contains(&key) && breach.is_none() {
                warn!(account_id, contract_id = %contract_id, pnl, "armed position fell back to breakeven");
                armed.remove(&key);
                breach = Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::ClosePosition {
                        contract_id: contract_id.clone(),
                    },
                    reason: format!("position {contract_id} returned to breakeven from profit"),
                    observed_metrics: serde_json::json!({
                        "unrealized_pnl": pnl,
                        "mode": "breakeven",
                        "contract_id": contract_id,
                    }),
                });
            }
        }
        breach
    }
}

#[async_trait]
impl RiskRule for MaxUnrealizedProfitRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_quote(&self, account_id: i64, _quote: &Quote) -> Option<Breach> {
        match self.config.mode {
            ProfitMode::ProfitTarget => self.check_profit_target(account_id),
            ProfitMode::Breakeven => self.check_breakeven(account_id),
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
