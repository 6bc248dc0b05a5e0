//! Internal domain model shared by every subsystem.
//!
//! Everything downstream of the wire converter speaks these types; the
//! camelCase gateway payloads never leave `api::convert`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A brokerage principal being monitored. `can_trade` is the broker-side
/// permission flag that RULE-010 guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: i64,
    pub name: String,
    pub balance: f64,
    pub can_trade: bool,
    pub is_visible: bool,
    pub simulated: bool,
}

/// Contract metadata, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub name: String,
    pub symbol: String,
    pub tick_size: f64,
    pub tick_value: f64,
    pub contract_size: i64,
    pub active_contract: bool,
}

impl Contract {
    pub fn symbol_root(&self) -> &str {
        extract_symbol_root(&self.contract_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order types as the gateway codes them (wire values 0-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Unknown,
    Limit,
    Market,
    StopLimit,
    Stop,
    TrailingStop,
    JoinBid,
    JoinAsk,
}

impl OrderType {
    pub fn is_protective_stop(self) -> bool {
        matches!(
            self,
            OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop
        )
    }
}

/// Normalized order state. The gateway sends two divergent integer codings;
/// both collapse into this enum at the converter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Active,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Partial,
}

impl OrderState {
    /// Terminal orders never change again and are never touched by
    /// enforcement.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    /// Still working on the exchange (cancellable).
    pub fn is_working(self) -> bool {
        matches!(
            self,
            OrderState::Pending | OrderState::Active | OrderState::Partial
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub symbol_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub state: OrderState,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub size: i64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub filled_quantity: i64,
    pub filled_price: Option<f64>,
    pub custom_tag: Option<String>,
}

impl Order {
    /// Symbol root for per-instrument policy. Prefers `symbol_id`
    /// ("F.US.RTY" style) when present, falls back to the contract id.
    pub fn symbol_root(&self) -> &str {
        if let Some(symbol_id) = &self.symbol_id {
            if let Some(root) = symbol_id.rsplit('.').next() {
                if !root.is_empty() {
                    return root;
                }
            }
        }
        extract_symbol_root(&self.contract_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Option<i64>,
    pub account_id: i64,
    pub contract_id: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub direction: PositionDirection,
    /// Net absolute size; 0 means the position closed.
    pub size: i64,
    pub average_price: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size > 0
    }

    pub fn symbol_root(&self) -> &str {
        extract_symbol_root(&self.contract_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: i64,
    pub order_id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub side: OrderSide,
    pub size: i64,
    pub price: f64,
    pub fees: f64,
    /// `None` marks a half-turn (opening leg): counted for frequency,
    /// excluded from daily realized loss.
    pub realized_pnl: Option<f64>,
    pub voided: bool,
}

impl Trade {
    pub fn is_half_turn(&self) -> bool {
        self.realized_pnl.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockoutKind {
    Account,
    Symbol,
    Cooldown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockout {
    pub account_id: i64,
    pub kind: LockoutKind,
    pub symbol: Option<String>,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
    /// `None` means indefinite.
    pub until: Option<DateTime<Utc>>,
}

impl Lockout {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.until.map(|until| now >= until).unwrap_or(false)
    }
}

/// One append-only record per terminal enforcement outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementLogEntry {
    pub at: DateTime<Utc>,
    pub correlation_id: String,
    pub account_id: i64,
    pub rule_id: String,
    pub action: String,
    pub reason: String,
    pub observed_metrics: serde_json::Value,
}

/// Extract the symbol root from a contract id: the 4th dot-segment.
///
/// "CON.F.US.MNQ.U25" → "MNQ". Unexpected formats return the input
/// unchanged so per-symbol policy still keys on something stable.
pub fn extract_symbol_root(contract_id: &str) -> &str {
    let mut parts = contract_id.split('.');
    match parts.nth(3) {
        Some(root) if !root.is_empty() => root,
        _ => contract_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_root_extraction() {
        assert_eq!(extract_symbol_root("CON.F.US.MNQ.U25"), "MNQ");
        assert_eq!(extract_symbol_root("CON.F.US.ES.U25"), "ES");
        assert_eq!(extract_symbol_root("CON.F.US.RTY.H25"), "RTY");
        assert_eq!(extract_symbol_root("CON.F.US.BTC.Z25"), "BTC");
    }

    #[test]
    fn test_symbol_root_fallback_on_unexpected_format() {
        assert_eq!(extract_symbol_root("MNQ"), "MNQ");
        assert_eq!(extract_symbol_root("CON.F.US"), "CON.F.US");
        assert_eq!(extract_symbol_root(""), "");
    }

    #[test]
    fn test_order_symbol_root_prefers_symbol_id() {
        let order = Order {
            order_id: 1,
            account_id: 1,
            contract_id: "CON.F.US.MNQ.U25".to_string(),
            symbol_id: Some("F.US.RTY".to_string()),
            created_at: None,
            updated_at: None,
            state: OrderState::Active,
            order_type: OrderType::Limit,
            side: OrderSide::Buy,
            size: 1,
            limit_price: None,
            stop_price: None,
            filled_quantity: 0,
            filled_price: None,
            custom_tag: None,
        };
        assert_eq!(order.symbol_root(), "RTY");
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Active.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
        assert!(OrderState::Partial.is_working());
    }

    #[test]
    fn test_lockout_expiry() {
        let now = Utc::now();
        let indefinite = Lockout {
            account_id: 1,
            kind: LockoutKind::Account,
            symbol: None,
            reason: "test".to_string(),
            applied_at: now,
            until: None,
        };
        assert!(!indefinite.is_expired(now + chrono::Duration::days(365)));

        let timed = Lockout {
            until: Some(now + chrono::Duration::seconds(60)),
            ..indefinite
        };
        assert!(!timed.is_expired(now));
        assert!(timed.is_expired(now + chrono::Duration::seconds(61)));
    }
}
