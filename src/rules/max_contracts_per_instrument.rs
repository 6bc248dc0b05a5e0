//! RULE-002: per-symbol position size limits.
//!
//! Each symbol root carries its own cap; symbols without one fall under
//! the unknown-symbol policy (block, capped allowance, or unlimited).
//! Enforcement either trims the excess or closes the whole position.

use super::{Breach, BreachAction, RiskRule};
use crate::config::{InstrumentEnforcement, MaxContractsPerInstrumentConfig, UnknownSymbolAction};
use crate::core::StateManager;
use crate::enforcement::EnforcementActions;
use crate::models::Position;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct MaxContractsPerInstrumentRule {
    config: MaxContractsPerInstrumentConfig,
    state: Arc<StateManager>,
    actions: Arc<EnforcementActions>,
}

impl MaxContractsPerInstrumentRule {
    pub const RULE_ID: &'static str = "RULE-002";

    pub fn new(
        config: MaxContractsPerInstrumentConfig,
        state: Arc<StateManager>,
        actions: Arc<EnforcementActions>,
    ) -> Self {
        Self {
            config,
            state,
            actions,
        }
    }

    fn over_limit_action(&self, contract_id: &str, current: i64, limit: i64) -> BreachAction {
        match self.config.enforcement {
            InstrumentEnforcement::CloseAll => BreachAction::ClosePosition {
                contract_id: contract_id.to_string(),
            },
            InstrumentEnforcement::ReduceToLimit => BreachAction::ReducePosition {
                contract_id: contract_id.to_string(),
                reduce_by: current - limit,
            },
        }
    }
}

#[async_trait]
impl RiskRule for MaxContractsPerInstrumentRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_position(&self, position: &Position) -> Option<Breach> {
        let symbol = position.symbol_root().to_string();
        let current = self
            .state
            .get_contract_count(position.account_id, &position.contract_id);
        if current == 0 {
            return None;
        }

        let (action, limit) = if let Some(&limit) = self.config.limits.get(&symbol) {
            if current <= limit {
                return None;
            }
            (
                self.over_limit_action(&position.contract_id, current, limit),
                limit,
            )
        } else {
            match self.config.unknown_symbol_policy() {
                UnknownSymbolAction::AllowUnlimited => return None,
                UnknownSymbolAction::AllowWithLimit(limit) => {
                    if current <= limit {
                        return None;
                    }
                    (
                        self.over_limit_action(&position.contract_id, current, limit),
                        limit,
                    )
                }
                UnknownSymbolAction::Block => (
                    BreachAction::ClosePosition {
                        contract_id: position.contract_id.clone(),
                    },
                    0,
                ),
            }
        };

        warn!(
            account_id = position.account_id,
            symbol = %symbol,
            current,
            limit,
            "instrument contract limit breached"
        );
        Some(Breach {
            rule_id: Self::RULE_ID,
            action,
            reason: if limit == 0 {
                format!("symbol {symbol} not in configured limits")
            } else {
                format!("{symbol} holds {current} contracts, limit {limit}")
            },
            observed_metrics: serde_json::json!({
                "symbol": symbol,
                "current_size": current,
                "limit": limit,
                "contract_id": position.contract_id,
            }),
        })
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        match &breach.action {
            BreachAction::ReducePosition {
                contract_id,
                reduce_by,
            } => {
                self.actions
                    .reduce_position(account_id, contract_id, *reduce_by)
                    .await
            }
            BreachAction::ClosePosition { contract_id } => {
                self.actions.close_position(account_id, contract_id).await
            }
            _ => false,
        }
    }
}
