//! RULE-011: symbol blacklist.
//!
//! Positions in a blocked symbol are closed and the symbol is permanently
//! locked for the account; orders in a blocked symbol are cancelled. An
//! already-locked symbol only produces the close, never a second lockout.

use super::{Breach, BreachAction, RiskRule};
use crate::config::SymbolBlocksConfig;
use crate::core::LockoutManager;
use crate::enforcement::EnforcementActions;
use crate::models::{Order, Position};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct SymbolBlocksRule {
    config: SymbolBlocksConfig,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
}

impl SymbolBlocksRule {
    pub const RULE_ID: &'static str = "RULE-011";

    pub fn new(
        config: SymbolBlocksConfig,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
    ) -> Self {
        Self {
            config,
            actions,
            lockouts,
        }
    }

    fn is_blocked(&self, symbol: &str) -> bool {
        self.config.blocked_symbols.iter().any(|s| s == symbol)
    }
}

#[async_trait]
impl RiskRule for SymbolBlocksRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_position(&self, position: &Position) -> Option<Breach> {
        if position.size == 0 {
            return None;
        }
        let symbol = position.symbol_root().to_string();
        if !self.is_blocked(&symbol) {
            return None;
        }
        warn!(
            account_id = position.account_id,
            symbol = %symbol,
            contract_id = %position.contract_id,
            "position opened in blocked symbol"
        );

        let action = if self.lockouts.is_symbol_locked(position.account_id, &symbol) {
            // Lockout already live: close the position, skip a new breach.
            BreachAction::ClosePosition {
                contract_id: position.contract_id.clone(),
            }
        } else {
            BreachAction::ClosePositionAndSymbolLockout {
                contract_id: position.contract_id.clone(),
                symbol: symbol.clone(),
            }
        };
        Some(Breach {
            rule_id: Self::RULE_ID,
            action,
            reason: format!("symbol {symbol} is permanently blocked"),
            observed_metrics: serde_json::json!({
                "symbol": symbol,
                "contract_id": position.contract_id,
            }),
        })
    }

    async fn on_order(&self, order: &Order) -> Option<Breach> {
        if !order.state.is_working() {
            return None;
        }
        let symbol = order.symbol_root().to_string();
        if !self.is_blocked(&symbol) {
            return None;
        }
        warn!(
            account_id = order.account_id,
            order_id = order.order_id,
            symbol = %symbol,
            "order in blocked symbol"
        );
        Some(Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::CancelOrder {
                order_id: order.order_id,
            },
            reason: format!("order in blocked symbol {symbol}"),
            observed_metrics: serde_json::json!({
                "symbol": symbol,
                "order_id": order.order_id,
            }),
        })
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        match &breach.action {
            BreachAction::ClosePositionAndSymbolLockout {
                contract_id,
                symbol,
            } => {
                let close_ok = self.actions.close_position(account_id, contract_id).await;
                self.lockouts
                    .set_symbol_lockout(account_id, symbol.clone(), breach.reason.clone(), None)
                    .await;
                close_ok
            }
            BreachAction::ClosePosition { contract_id } => {
                self.actions.close_position(account_id, contract_id).await
            }
            BreachAction::CancelOrder { order_id } => {
                self.actions.cancel_order(account_id, *order_id).await
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StateManager;
    use crate::models::{OrderSide, OrderState, OrderType, PositionDirection};

    fn fixture() -> (Arc<StateManager>, Arc<LockoutManager>, SymbolBlocksRule) {
        let state = Arc::new(StateManager::new());
        let lockouts = Arc::new(LockoutManager::new(None));
        let actions = Arc::new(EnforcementActions::new(
            crate::testing::dry_run_rest_client(),
            state.clone(),
            None,
        ));
        let rule = SymbolBlocksRule::new(
            SymbolBlocksConfig {
                enabled: true,
                blocked_symbols: vec!["BTC".to_string(), "ETH".to_string(), "GC".to_string()],
            },
            actions,
            lockouts.clone(),
        );
        (state, lockouts, rule)
    }

    fn btc_position(size: i64) -> Position {
        Position {
            position_id: Some(9),
            account_id: 1,
            contract_id: "CON.F.US.BTC.U25".to_string(),
            opened_at: None,
            direction: PositionDirection::Long,
            size,
            average_price: 65000.0,
        }
    }

    #[tokio::test]
    async fn test_blocked_position_closed_and_symbol_locked() {
        let (state, lockouts, rule) = fixture();
        state.apply_position(btc_position(1));

        let breach = rule.on_position(&btc_position(1)).await.unwrap();
        assert_eq!(
            breach.action,
            BreachAction::ClosePositionAndSymbolLockout {
                contract_id: "CON.F.US.BTC.U25".to_string(),
                symbol: "BTC".to_string(),
            }
        );
        assert!(!breach.is_terminal());

        assert!(rule.enforce(1, &breach).await);
        assert!(lockouts.is_symbol_locked(1, "BTC"));
        // Permanent: no expiry.
        let lockout = &lockouts.symbol_lockouts(1)[0];
        assert!(lockout.until.is_none());
        assert!(state.open_positions(1).is_empty());
    }

    #[tokio::test]
    async fn test_allowed_symbol_untouched() {
        let (_, _, rule) = fixture();
        let position = Position {
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            ..btc_position(1)
        };
        assert!(rule.on_position(&position).await.is_none());
    }

    #[tokio::test]
    async fn test_already_locked_symbol_closes_without_new_lockout() {
        let (_, lockouts, rule) = fixture();
        lockouts
            .set_symbol_lockout(1, "BTC", "blocked", None)
            .await;

        let breach = rule.on_position(&btc_position(1)).await.unwrap();
        assert_eq!(
            breach.action,
            BreachAction::ClosePosition {
                contract_id: "CON.F.US.BTC.U25".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_blocked_order_cancelled() {
        let (_, _, rule) = fixture();
        let order = Order {
            order_id: 77,
            account_id: 1,
            contract_id: "CON.F.US.GC.Z25".to_string(),
            symbol_id: Some("F.US.GC".to_string()),
            created_at: None,
            updated_at: None,
            state: OrderState::Active,
            order_type: OrderType::Limit,
            side: OrderSide::Buy,
            size: 1,
            limit_price: Some(2400.0),
            stop_price: None,
            filled_quantity: 0,
            filled_price: None,
            custom_tag: None,
        };
        let breach = rule.on_order(&order).await.unwrap();
        assert_eq!(breach.action, BreachAction::CancelOrder { order_id: 77 });
    }

    #[tokio::test]
    async fn test_terminal_order_ignored() {
        let (_, _, rule) = fixture();
        let order = Order {
            order_id: 77,
            account_id: 1,
            contract_id: "CON.F.US.GC.Z25".to_string(),
            symbol_id: None,
            created_at: None,
            updated_at: None,
            state: OrderState::Filled,
            order_type: OrderType::Limit,
            side: OrderSide::Buy,
            size: 1,
            limit_price: None,
            stop_price: None,
            filled_quantity: 1,
            filled_price: Some(2400.0),
            custom_tag: None,
        };
        assert!(rule.on_order(&order).await.is_none());
    }
}
