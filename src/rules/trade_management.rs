//! RULE-012: automated stop management (auto-breakeven + trailing stop).
//!
//! Position events register management state; quote ticks drive it. The
//! rule only places and modifies protective stops, it never closes
//! positions or locks accounts.

use super::{Breach, BreachAction, RiskRule};
use crate::config::TradeManagementConfig;
use crate::core::quotes::quote_key;
use crate::core::{ContractCache, StateManager};
use crate::enforcement::EnforcementActions;
use crate::models::{extract_symbol_root, Order, OrderSide, Position, PositionDirection, Quote};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct ManagedPosition {
    entry_price: f64,
    direction: PositionDirection,
    size: i64,
    /// Stop order we placed ourselves (breakeven or trailing).
    stop_order_id: Option<i64>,
    breakeven_applied: bool,
    trailing_active: bool,
    /// High-water mark for longs, low-water for shorts; starts at entry.
    water_mark: f64,
    current_stop: Option<f64>,
    /// The trader placed their own stop before we did.
    manual_stop: bool,
}

pub struct TradeManagementRule {
    config: TradeManagementConfig,
    state: Arc<StateManager>,
    contracts: Arc<ContractCache>,
    actions: Arc<EnforcementActions>,
    managed: RwLock<HashMap<(i64, String), ManagedPosition>>,
}

impl TradeManagementRule {
    pub const RULE_ID: &'static str = "RULE-012";

    pub fn new(
        config: TradeManagementConfig,
        state: Arc<StateManager>,
        contracts: Arc<ContractCache>,
        actions: Arc<EnforcementActions>,
    ) -> Self {
        Self {
            config,
            state,
            contracts,
            actions,
            managed: RwLock::new(HashMap::new()),
        }
    }

    fn protective_side(direction: PositionDirection) -> OrderSide {
        match direction {
            PositionDirection::Long => OrderSide::Sell,
            PositionDirection::Short => OrderSide::Buy,
        }
    }

    fn profit_ticks(direction: PositionDirection, entry: f64, price: f64, tick_size: f64) -> f64 {
        let diff = match direction {
            PositionDirection::Long => price - entry,
            PositionDirection::Short => entry - price,
        };
        diff / tick_size
    }
}

#[async_trait]
impl RiskRule for TradeManagementRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_position(&self, position: &Position) -> Option<Breach> {
        let key = (position.account_id, position.contract_id.clone());
        let mut managed = self.managed.write();

        if position.size == 0 {
            if managed.remove(&key).is_some() {
                debug!(
                    account_id = position.account_id,
                    contract_id = %position.contract_id,
                    "position closed, management state dropped"
                );
            }
            return None;
        }

        managed.entry(key).or_insert_with(|| {
            let manual_stop = !self
                .state
                .protective_stops(position.account_id, &position.contract_id)
                .is_empty();
            debug!(
                account_id = position.account_id,
                contract_id = %position.contract_id,
                manual_stop,
                "position registered for trade management"
            );
            ManagedPosition {
                entry_price: position.average_price,
                direction: position.direction,
                size: position.size,
                stop_order_id: None,
                breakeven_applied: false,
                trailing_active: false,
                water_mark: position.average_price,
                current_stop: None,
                manual_stop,
            }
        });
        None
    }

    async fn on_order(&self, order: &Order) -> Option<Breach> {
        // A working protective stop we did not place marks the position as
        // manually protected.
        if !order.order_type.is_protective_stop() || !order.state.is_working() {
            return None;
        }
        let key = (order.account_id, order.contract_id.clone());
        let mut managed = self.managed.write();
        if let Some(entry) = managed.get_mut(&key) {
            if entry.stop_order_id != Some(order.order_id) {
                entry.manual_stop = true;
            }
        }
        None
    }

    async fn on_quote(&self, account_id: i64, quote: &Quote) -> Option<Breach> {
        let symbol_root = quote_key(&quote.symbol).to_string();
        let price = quote.last_price?;

        let mut managed = self.managed.write();
        for ((entry_account, contract_id), entry) in managed.iter_mut() {
            if *entry_account != account_id {
                continue;
            }
            if extract_symbol_root(contract_id) != symbol_root {
                continue;
            }
            let Some(contract) = self.contracts.get(contract_id) else {
                continue;
            };
            if contract.tick_size <= 0.0 {
                continue;
            }

            let profit_ticks =
                Self::profit_ticks(entry.direction, entry.entry_price, price, contract.tick_size);

            // Auto-breakeven: one shot per position.
            let be = &self.config.auto_breakeven;
            if be.enabled
                && !entry.breakeven_applied
                && profit_ticks >= be.profit_trigger_ticks
                && !(entry.manual_stop && be.respect_manual_stops)
            {
                let offset = be.offset_ticks * contract.tick_size;
                let stop_price = match entry.direction {
                    PositionDirection::Long => entry.entry_price + offset,
                    PositionDirection::Short => entry.entry_price - offset,
                };
                entry.breakeven_applied = true;
                entry.current_stop = Some(stop_price);
                info!(
                    account_id,
                    contract_id = %contract_id,
                    profit_ticks,
                    stop_price,
                    "auto-breakeven triggered"
                );
                return Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::ApplyBreakeven {
                        contract_id: contract_id.clone(),
                        stop_price,
                        size: entry.size,
                        side: Self::protective_side(entry.direction),
                    },
                    reason: format!(
                        "breakeven stop at {stop_price} after {profit_ticks:.0} profit ticks"
                    ),
                    observed_metrics: serde_json::json!({
                        "contract_id": contract_id,
                        "profit_ticks": profit_ticks,
                        "stop_price": stop_price,
                    }),
                });
            }

            // Trailing stop: activate at the configured profit, then
            // follow favourable ticks only.
            let trail = &self.config.trailing_stop;
            if trail.enabled {
                if !entry.trailing_active && profit_ticks >= trail.activation_ticks {
                    entry.trailing_active = true;
                }
                if entry.trailing_active {
                    let favourable = match entry.direction {
                        PositionDirection::Long => price > entry.water_mark,
                        PositionDirection::Short => price < entry.water_mark,
                    };
                    if favourable {
                        entry.water_mark = price;
                        let distance = trail.trail_distance_ticks * contract.tick_size;
                        let new_stop = match entry.direction {
                            PositionDirection::Long => price - distance,
                            PositionDirection::Short => price + distance,
                        };
                        let old_stop = entry.current_stop;
                        entry.current_stop = Some(new_stop);
                        info!(
                            account_id,
                            contract_id = %contract_id,
                            old_stop,
                            new_stop,
                            "trailing stop advanced"
                        );
                        return Some(Breach {
                            rule_id: Self::RULE_ID,
                            action: BreachAction::UpdateTrailingStop {
                                contract_id: contract_id.clone(),
                                stop_order_id: entry.stop_order_id,
                                new_stop_price: new_stop,
                                size: entry.size,
                                side: Self::protective_side(entry.direction),
                            },
                            reason: format!("trailing stop moved to {new_stop}"),
                            observed_metrics: serde_json::json!({
                                "contract_id": contract_id,
                                "old_stop": old_stop,
                                "new_stop": new_stop,
                                "water_mark": entry.water_mark,
                            }),
                        });
                    }
                }
            }
        }
        None
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        match &breach.action {
            BreachAction::ApplyBreakeven {
                contract_id,
                stop_price,
                size,
                side,
            } => {
                let existing = self
                    .managed
                    .read()
                    .get(&(account_id, contract_id.clone()))
                    .and_then(|entry| entry.stop_order_id);
                match existing {
                    Some(order_id) => {
                        self.actions
                            .modify_stop_loss(account_id, order_id, *stop_price)
                            .await
                    }
                    None => {
                        let Some(order_id) = self
                            .actions
                            .place_stop_loss(account_id, contract_id, *size, *stop_price, *side)
                            .await
                        else {
                            return false;
                        };
                        if let Some(entry) = self
                            .managed
                            .write()
                            .get_mut(&(account_id, contract_id.clone()))
                        {
                            entry.stop_order_id = Some(order_id);
                        }
                        true
                    }
                }
            }
            BreachAction::UpdateTrailingStop {
                contract_id,
                stop_order_id,
                new_stop_price,
                size,
                side,
            } => match stop_order_id {
                Some(order_id) => {
                    self.actions
                        .modify_stop_loss(account_id, *order_id, *new_stop_price)
                        .await
                }
                None => {
                    let Some(order_id) = self
                        .actions
                        .place_stop_loss(account_id, contract_id, *size, *new_stop_price, *side)
                        .await
                    else {
                        return false;
                    };
                    if let Some(entry) = self
                        .managed
                        .write()
                        .get_mut(&(account_id, contract_id.clone()))
                    {
                        entry.stop_order_id = Some(order_id);
                    }
                    true
                }
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoBreakevenConfig, TrailingStopConfig};
    use crate::models::Contract;
    use chrono::Utc;

    struct Fixture {
        state: Arc<StateManager>,
    }

    fn fixture(config: TradeManagementConfig) -> (Fixture, TradeManagementRule) {
        let state = Arc::new(StateManager::new());
        let contracts = Arc::new(ContractCache::new());
        contracts.insert(Contract {
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            name: "MNQ".to_string(),
            symbol: "F.US.MNQ".to_string(),
            tick_size: 0.25,
            tick_value: 0.5,
            contract_size: 1,
            active_contract: true,
        });
        let actions = Arc::new(EnforcementActions::new(
            crate::testing::dry_run_rest_client(),
            state.clone(),
            None,
        ));
        let rule = TradeManagementRule::new(config, state.clone(), contracts, actions);
        (Fixture { state }, rule)
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

    fn quote(price: f64) -> Quote {
        Quote {
            symbol: "F.US.MNQ".to_string(),
            last_price: Some(price),
            best_bid: None,
            best_ask: None,
            last_updated: Some(Utc::now()),
        }
    }

    fn trailing_config(trail_ticks: f64) -> TradeManagementConfig {
        TradeManagementConfig {
            enabled: true,
            auto_breakeven: AutoBreakevenConfig::default(),
            trailing_stop: TrailingStopConfig {
                enabled: true,
                activation_ticks: 0.0,
                trail_distance_ticks: trail_ticks,
            },
        }
    }

    fn breakeven_config(trigger: f64, offset: f64) -> TradeManagementConfig {
        TradeManagementConfig {
            enabled: true,
            auto_breakeven: AutoBreakevenConfig {
                enabled: true,
                profit_trigger_ticks: trigger,
                offset_ticks: offset,
                respect_manual_stops: true,
            },
            trailing_stop: TrailingStopConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_trailing_stop_follows_favourable_quotes() {
        let (_, rule) = fixture(trailing_config(10.0));
        rule.on_position(&long_position(2, 21000.0)).await;

        // 21005: stop trails to 21005 - 10*0.25 = 21002.5.
        let first = rule.on_quote(1, &quote(21005.0)).await.unwrap();
        let BreachAction::UpdateTrailingStop { new_stop_price, .. } = first.action else {
            panic!("expected trailing update");
        };
        assert!((new_stop_price - 21002.5).abs() < 1e-9);

        // 21010: stop advances to 21007.5.
        let second = rule.on_quote(1, &quote(21010.0)).await.unwrap();
        let BreachAction::UpdateTrailingStop {
            new_stop_price, ..
        } = second.action
        else {
            panic!("expected trailing update");
        };
        assert!((new_stop_price - 21007.5).abs() < 1e-9);
        assert_eq!(second.observed_metrics["old_stop"], 21002.5);
    }

    #[tokio::test]
    async fn test_unfavourable_quote_does_nothing() {
        let (_, rule) = fixture(trailing_config(10.0));
        rule.on_position(&long_position(2, 21000.0)).await;

        rule.on_quote(1, &quote(21010.0)).await.unwrap();
        // Pullback below the water mark: stop stays put.
        assert!(rule.on_quote(1, &quote(21004.0)).await.is_none());
    }

    #[tokio::test]
    async fn test_breakeven_fires_once_at_trigger() {
        let (_, rule) = fixture(breakeven_config(10.0, 2.0));
        rule.on_position(&long_position(1, 21000.0)).await;

        // 9 ticks of profit: not yet.
        assert!(rule.on_quote(1, &quote(21002.25)).await.is_none());

        // 10 ticks: stop at entry + 2 ticks = 21000.5.
        let breach = rule.on_quote(1, &quote(21002.5)).await.unwrap();
        let BreachAction::ApplyBreakeven { stop_price, side, .. } = breach.action else {
            panic!("expected breakeven");
        };
        assert!((stop_price - 21000.5).abs() < 1e-9);
        assert_eq!(side, OrderSide::Sell);

        // Applied once; further profit does not re-fire breakeven.
        assert!(rule.on_quote(1, &quote(21003.0)).await.is_none());
    }

    #[tokio::test]
    async fn test_manual_stop_respected() {
        let (fixture, rule) = fixture(breakeven_config(10.0, 0.0));
        // Trader already has a sell stop working on the contract.
        fixture.state.apply_order(Order {
            order_id: 500,
            account_id: 1,
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            symbol_id: None,
            created_at: None,
            updated_at: Some(Utc::now()),
            state: crate::models::OrderState::Active,
            order_type: crate::models::OrderType::Stop,
            side: OrderSide::Sell,
            size: 1,
            limit_price: None,
            stop_price: Some(20990.0),
            filled_quantity: 0,
            filled_price: None,
            custom_tag: None,
        });
        rule.on_position(&long_position(1, 21000.0)).await;

        assert!(rule.on_quote(1, &quote(21005.0)).await.is_none());
    }

    #[tokio::test]
    async fn test_short_position_mirrors() {
        let (_, rule) = fixture(trailing_config(10.0));
        rule.on_position(&Position {
            direction: PositionDirection::Short,
            ..long_position(2, 21000.0)
        })
        .await;

        // Favourable for a short is down.
        let breach = rule.on_quote(1, &quote(20995.0)).await.unwrap();
        let BreachAction::UpdateTrailingStop {
            new_stop_price,
            side,
            ..
        } = breach.action
        else {
            panic!("expected trailing update");
        };
        assert!((new_stop_price - 20997.5).abs() < 1e-9);
        assert_eq!(side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let (_, rule) = fixture(trailing_config(10.0));
        rule.on_position(&long_position(2, 21000.0)).await;
        rule.on_position(&long_position(0, 21000.0)).await;
        assert!(rule.on_quote(1, &quote(21010.0)).await.is_none());
    }
}
