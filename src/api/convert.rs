//! Wire ↔ internal conversion boundary.
//!
//! The gateway speaks camelCase JSON with two divergent integer codings
//! for order status (a 0-6 `status` field on push events and a 1-5
//! `state` field on the search endpoints). Everything is normalized here;
//! no other module ever sees a wire payload.

use crate::models::{
    Account, Contract, Order, OrderSide, OrderState, OrderType, Position, PositionDirection,
    Quote, Trade,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unknown order side code {0}")]
    UnknownSide(i64),
    #[error("unknown position type code {0}")]
    UnknownPositionType(i64),
    #[error("position event missing direction")]
    MissingDirection,
}

/// Lenient ISO-8601 parsing: the gateway mixes `Z` and `+00:00` suffixes,
/// and a malformed timestamp should never drop the whole event.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAccount {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub can_trade: bool,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub simulated: bool,
}

impl From<WireAccount> for Account {
    fn from(wire: WireAccount) -> Self {
        Account {
            account_id: wire.id,
            name: wire.name,
            balance: wire.balance,
            can_trade: wire.can_trade,
            is_visible: wire.is_visible,
            simulated: wire.simulated,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    #[serde(alias = "orderId")]
    pub id: i64,
    pub account_id: i64,
    pub contract_id: String,
    #[serde(default)]
    pub symbol_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_timestamp: Option<DateTime<Utc>>,
    /// Push-event coding (0-6).
    #[serde(default)]
    pub status: Option<i64>,
    /// Search-endpoint coding (1-5).
    #[serde(default)]
    pub state: Option<i64>,
    #[serde(rename = "type", default)]
    pub order_type: Option<i64>,
    #[serde(default)]
    pub side: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub fill_volume: i64,
    #[serde(default)]
    pub filled_price: Option<f64>,
    #[serde(default)]
    pub custom_tag: Option<String>,
}

/// Push-event `status` coding: 0 none, 1 open, 2 filled, 3 cancelled,
/// 4 expired, 5 rejected, 6 pending.
pub fn order_state_from_status(status: i64) -> OrderState {
    match status {
        1 => OrderState::Active,
        2 => OrderState::Filled,
        3 => OrderState::Cancelled,
        4 => OrderState::Expired,
        5 => OrderState::Rejected,
        // 0 (none) and 6 (pending) both mean not yet working.
        _ => OrderState::Pending,
    }
}

/// Search-endpoint `state` coding: 1 pending, 2 active, 3 filled,
/// 4 cancelled, 5 rejected.
pub fn order_state_from_state(state: i64) -> OrderState {
    match state {
        2 => OrderState::Active,
        3 => OrderState::Filled,
        4 => OrderState::Cancelled,
        5 => OrderState::Rejected,
        _ => OrderState::Pending,
    }
}

pub fn order_side_from_wire(side: i64) -> Result<OrderSide, ConvertError> {
    match side {
        0 => Ok(OrderSide::Buy),
        1 => Ok(OrderSide::Sell),
        other => Err(ConvertError::UnknownSide(other)),
    }
}

pub fn order_side_to_wire(side: OrderSide) -> i64 {
    match side {
        OrderSide::Buy => 0,
        OrderSide::Sell => 1,
    }
}

pub fn order_type_from_wire(code: i64) -> OrderType {
    match code {
        1 => OrderType::Limit,
        2 => OrderType::Market,
        3 => OrderType::StopLimit,
        4 => OrderType::Stop,
        5 => OrderType::TrailingStop,
        6 => OrderType::JoinBid,
        7 => OrderType::JoinAsk,
        _ => OrderType::Unknown,
    }
}

pub fn order_type_to_wire(order_type: OrderType) -> i64 {
    match order_type {
        OrderType::Unknown => 0,
        OrderType::Limit => 1,
        OrderType::Market => 2,
        OrderType::StopLimit => 3,
        OrderType::Stop => 4,
        OrderType::TrailingStop => 5,
        OrderType::JoinBid => 6,
        OrderType::JoinAsk => 7,
    }
}

impl WireOrder {
    pub fn into_order(self) -> Result<Order, ConvertError> {
        let state = match (self.status, self.state) {
            (Some(status), _) => order_state_from_status(status),
            (None, Some(state)) => order_state_from_state(state),
            (None, None) => OrderState::Pending,
        };
        Ok(Order {
            order_id: self.id,
            account_id: self.account_id,
            contract_id: self.contract_id,
            symbol_id: self.symbol_id,
            created_at: self.creation_timestamp,
            updated_at: self.update_timestamp,
            state,
            order_type: order_type_from_wire(self.order_type.unwrap_or(0)),
            side: order_side_from_wire(self.side)?,
            size: self.size,
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            filled_quantity: self.fill_volume,
            filled_price: self.filled_price,
            custom_tag: self.custom_tag,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    #[serde(default)]
    pub id: Option<i64>,
    pub account_id: i64,
    pub contract_id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// 1 = Long, 2 = Short.
    #[serde(rename = "type", default)]
    pub position_type: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub average_price: Option<f64>,
    // Legacy field spellings from older gateway versions.
    #[serde(default)]
    pub side: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
}

impl WirePosition {
    pub fn into_position(self) -> Result<Position, ConvertError> {
        let direction = match (self.position_type, self.side) {
            (Some(1), _) => PositionDirection::Long,
            (Some(2), _) => PositionDirection::Short,
            (Some(other), _) => return Err(ConvertError::UnknownPositionType(other)),
            // Legacy coding: side 0 = buy = long, 1 = sell = short.
            (None, Some(0)) => PositionDirection::Long,
            (None, Some(1)) => PositionDirection::Short,
            (None, Some(other)) => return Err(ConvertError::UnknownSide(other)),
            (None, None) => return Err(ConvertError::MissingDirection),
        };
        Ok(Position {
            position_id: self.id,
            account_id: self.account_id,
            contract_id: self.contract_id,
            opened_at: self.creation_timestamp,
            direction,
            size: self.size.or(self.quantity).unwrap_or(0),
            average_price: self.average_price.or(self.avg_price).unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrade {
    pub id: i64,
    #[serde(default)]
    pub order_id: i64,
    pub account_id: i64,
    pub contract_id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub price: f64,
    /// `null` for half-turn (opening) trades.
    #[serde(default)]
    pub profit_and_loss: Option<f64>,
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub side: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub voided: bool,
}

impl WireTrade {
    pub fn into_trade(self) -> Result<Trade, ConvertError> {
        Ok(Trade {
            trade_id: self.id,
            order_id: self.order_id,
            account_id: self.account_id,
            contract_id: self.contract_id,
            executed_at: self.creation_timestamp,
            side: order_side_from_wire(self.side)?,
            size: self.size,
            price: self.price,
            fees: self.fees,
            realized_pnl: self.profit_and_loss,
            voided: self.voided,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireQuote {
    pub symbol: String,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<WireQuote> for Quote {
    fn from(wire: WireQuote) -> Self {
        Quote {
            symbol: wire.symbol,
            last_price: wire.last_price,
            best_bid: wire.best_bid,
            best_ask: wire.best_ask,
            last_updated: wire.last_updated.or(wire.timestamp),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireContract {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub tick_value: f64,
    #[serde(default = "default_contract_size")]
    pub contract_size: i64,
    #[serde(default = "default_true")]
    pub active_contract: bool,
}

fn default_contract_size() -> i64 {
    1
}

impl From<WireContract> for Contract {
    fn from(wire: WireContract) -> Self {
        Contract {
            contract_id: wire.id,
            name: wire.name,
            symbol: wire.symbol_id.or(wire.symbol).unwrap_or_default(),
            tick_size: wire.tick_size,
            tick_value: wire.tick_value,
            contract_size: wire.contract_size,
            active_contract: wire.active_contract,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound requests / typed responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest<'a> {
    pub user_name: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest<'a> {
    pub account_id: i64,
    pub contract_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest<'a> {
    pub account_id: i64,
    pub contract_id: &'a str,
    #[serde(rename = "type")]
    pub order_type: i64,
    pub side: i64,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_tag: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_price: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOpenPositionsRequest {
    pub account_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchContractRequest<'a> {
    pub contract_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPositionsResponse {
    #[serde(default)]
    pub positions: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchContractResponse {
    pub contract: WireContract,
}
