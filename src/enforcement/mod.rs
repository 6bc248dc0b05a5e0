//! Composite enforcement primitives shared by every rule.
//!
//! All operations are idempotent against the state manager: closing a
//! position that is already gone is a success, and close-all over an empty
//! account is a no-op. A leg that fails is logged and the sweep continues;
//! the caller still installs its lockout, which is the stronger guarantee.

use crate::api::RestClient;
use crate::core::StateManager;
use crate::models::{EnforcementLogEntry, OrderSide, OrderType, PositionDirection};
use crate::persistence::Store;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct EnforcementActions {
    rest: Arc<RestClient>,
    state: Arc<StateManager>,
    store: Option<Store>,
}

impl EnforcementActions {
    pub fn new(rest: Arc<RestClient>, state: Arc<StateManager>, store: Option<Store>) -> Self {
        Self { rest, state, store }
    }

    /// Close every open position on the account. Returns true only when
    /// all close legs succeeded.
    pub async fn close_all_positions(&self, account_id: i64) -> bool {
        let positions = self.state.open_positions(account_id);
        if positions.is_empty() {
            info!(account_id, "close-all: no open positions, nothing to do");
            return true;
        }

        let mut all_ok = true;
        for position in positions {
            match self
                .rest
                .close_position(account_id, &position.contract_id)
                .await
            {
                Ok(()) => {
                    self.state.apply_position(crate::models::Position {
                        size: 0,
                        ..position
                    });
                }
                Err(err) => {
                    error!(
                        account_id,
                        contract_id = %position.contract_id,
                        error = %err,
                        "close-all leg failed"
                    );
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Cancel every working order on the account.
    pub async fn cancel_all_orders(&self, account_id: i64) -> bool {
        let orders = self.state.working_orders(account_id);
        if orders.is_empty() {
            return true;
        }

        let mut all_ok = true;
        for order in orders {
            if let Err(err) = self.rest.cancel_order(account_id, order.order_id).await {
                error!(
                    account_id,
                    order_id = order.order_id,
                    error = %err,
                    "cancel-all leg failed"
                );
                all_ok = false;
            }
        }
        all_ok
    }

    /// Close one position; a position already gone is a success.
    pub async fn close_position(&self, account_id: i64, contract_id: &str) -> bool {
        let Some(position) = self.state.position(account_id, contract_id) else {
            info!(account_id, contract_id, "close: position already flat");
            return true;
        };
        match self.rest.close_position(account_id, contract_id).await {
            Ok(()) => {
                self.state.apply_position(crate::models::Position {
                    size: 0,
                    ..position
                });
                true
            }
            Err(err) => {
                error!(account_id, contract_id, error = %err, "close position failed");
                false
            }
        }
    }

    /// Reduce a position by `reduce_by` contracts via an opposing market
    /// order. Guarantees at least reduction to the limit.
    pub async fn reduce_position(&self, account_id: i64, contract_id: &str, reduce_by: i64) -> bool {
        if reduce_by <= 0 {
            return true;
        }
        let Some(position) = self.state.position(account_id, contract_id) else {
            return true;
        };
        if reduce_by >= position.size {
            return self.close_position(account_id, contract_id).await;
        }

        let side = match position.direction {
            PositionDirection::Long => OrderSide::Sell,
            PositionDirection::Short => OrderSide::Buy,
        };
        match self
            .rest
            .place_order(
                account_id,
                contract_id,
                OrderType::Market,
                side,
                reduce_by,
                None,
                None,
            )
            .await
        {
            Ok(order_id) => {
                info!(
                    account_id,
                    contract_id, reduce_by, order_id, "position reduction order placed"
                );
                true
            }
            Err(err) => {
                error!(account_id, contract_id, error = %err, "position reduction failed");
                false
            }
        }
    }

    /// Place a protective stop; returns the new order id.
    pub async fn place_stop_loss(
        &self,
        account_id: i64,
        contract_id: &str,
        size: i64,
        stop_price: f64,
        side: OrderSide,
    ) -> Option<i64> {
        match self
            .rest
            .place_order(
                account_id,
                contract_id,
                OrderType::Stop,
                side,
                size,
                Some(stop_price),
                None,
            )
            .await
        {
            Ok(order_id) => {
                info!(account_id, contract_id, stop_price, order_id, "stop-loss placed");
                Some(order_id)
            }
            Err(err) => {
                error!(account_id, contract_id, error = %err, "stop-loss placement failed");
                None
            }
        }
    }

    pub async fn modify_stop_loss(
        &self,
        account_id: i64,
        order_id: i64,
        new_stop_price: f64,
    ) -> bool {
        match self
            .rest
            .modify_order(account_id, order_id, Some(new_stop_price))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(account_id, order_id, error = %err, "stop-loss modify failed");
                false
            }
        }
    }

    pub async fn cancel_order(&self, account_id: i64, order_id: i64) -> bool {
        match self.rest.cancel_order(account_id, order_id).await {
            Ok(()) => true,
            Err(err) => {
                error!(account_id, order_id, error = %err, "order cancel failed");
                false
            }
        }
    }

    /// Append one enforcement log entry (durable store + enforcement
    /// channel).
    pub async fn log_enforcement(
        &self,
        correlation_id: &str,
        account_id: i64,
        rule_id: &str,
        action: &str,
        reason: &str,
        observed_metrics: serde_json::Value,
    ) {
        info!(
            target: "enforcement",
            correlation_id,
            account_id,
            rule_id,
            action,
            reason,
            metrics = %observed_metrics,
            "enforcement executed"
        );
        if let Some(store) = &self.store {
            let entry = EnforcementLogEntry {
                at: Utc::now(),
                correlation_id: correlation_id.to_string(),
                account_id,
                rule_id: rule_id.to_string(),
                action: action.to_string(),
                reason: reason.to_string(),
                observed_metrics,
            };
            if let Err(err) = store.append_enforcement(&entry).await {
                warn!(error = %err, "failed to persist enforcement log entry");
            }
        }
    }
}
