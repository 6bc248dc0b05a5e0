//! Risk rule evaluators.
//!
//! Every rule implements [`RiskRule`]: event hooks that may produce a
//! [`Breach`], and an `enforce` that executes it. The router runs rules in
//! a fixed order; the first terminal breach (account-wide close) wins for
//! an event and suppresses later rules, while non-terminal actions
//! compose.

pub mod auth_loss_guard;
pub mod daily_realized_loss;
pub mod daily_unrealized_loss;
pub mod max_contracts;
pub mod max_contracts_per_instrument;
pub mod max_unrealized_profit;
pub mod session_hours;
pub mod stop_loss_grace;
pub mod symbol_blocks;
pub mod trade_frequency;
pub mod trade_management;

use crate::models::{Account, Order, OrderSide, Position, Quote, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use auth_loss_guard::AuthLossGuardRule;
pub use daily_realized_loss::DailyRealizedLossRule;
pub use daily_unrealized_loss::DailyUnrealizedLossRule;
pub use max_contracts::MaxContractsRule;
pub use max_contracts_per_instrument::MaxContractsPerInstrumentRule;
pub use max_unrealized_profit::MaxUnrealizedProfitRule;
pub use session_hours::SessionHoursRule;
pub use stop_loss_grace::StopLossGraceRule;
pub use symbol_blocks::SymbolBlocksRule;
pub use trade_frequency::TradeFrequencyRule;
pub use trade_management::TradeManagementRule;

/// What a lockout-capable enforcement installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutSpec {
    /// Close/cancel only, no lockout.
    None,
    Until(DateTime<Utc>),
    Indefinite,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreachAction {
    /// Close every open position (no order cancel, no lockout).
    CloseAll,
    /// Close all positions, cancel all working orders, optionally lock
    /// the account.
    CloseAllAndLockout { lockout: LockoutSpec },
    ClosePosition {
        contract_id: String,
    },
    ReducePosition {
        contract_id: String,
        reduce_by: i64,
    },
    CancelOrder {
        order_id: i64,
    },
    Cooldown {
        duration_secs: u64,
    },
    ClosePositionAndSymbolLockout {
        contract_id: String,
        symbol: String,
    },
    RemoveLockout,
    ApplyBreakeven {
        contract_id: String,
        stop_price: f64,
        size: i64,
        side: OrderSide,
    },
    UpdateTrailingStop {
        contract_id: String,
        stop_order_id: Option<i64>,
        new_stop_price: f64,
        size: i64,
        side: OrderSide,
    },
}

impl BreachAction {
    /// Terminal actions wipe the whole account; later rules for the same
    /// event have nothing left to act on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BreachAction::CloseAll | BreachAction::CloseAllAndLockout { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            BreachAction::CloseAll => "CLOSE_ALL",
            BreachAction::CloseAllAndLockout {
                lockout: LockoutSpec::None,
            } => "CLOSE_ALL_AND_CANCEL",
            BreachAction::CloseAllAndLockout { .. } => "CLOSE_ALL_AND_LOCKOUT",
            BreachAction::ClosePosition { .. } => "CLOSE_POSITION",
            BreachAction::ReducePosition { .. } => "REDUCE_POSITION",
            BreachAction::CancelOrder { .. } => "CANCEL_ORDER",
            BreachAction::Cooldown { .. } => "COOLDOWN",
            BreachAction::ClosePositionAndSymbolLockout { .. } => {
                "CLOSE_POSITION_AND_SYMBOL_LOCKOUT"
            }
            BreachAction::RemoveLockout => "REMOVE_LOCKOUT",
            BreachAction::ApplyBreakeven { .. } => "APPLY_BREAKEVEN",
            BreachAction::UpdateTrailingStop { .. } => "UPDATE_TRAILING_STOP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Breach {
    pub rule_id: &'static str,
    pub action: BreachAction,
    pub reason: String,
    pub observed_metrics: serde_json::Value,
}

impl Breach {
    pub fn is_terminal(&self) -> bool {
        self.action.is_terminal()
    }
}

/// One risk rule. Hooks default to no-op; rules override the triggers
/// they care about. `enforce` executes this rule's own breach and reports
/// whether every leg succeeded.
#[async_trait]
pub trait RiskRule: Send + Sync {
    fn rule_id(&self) -> &'static str;
    fn enabled(&self) -> bool;

    async fn on_trade(&self, _trade: &Trade) -> Option<Breach> {
        None
    }
    async fn on_order(&self, _order: &Order) -> Option<Breach> {
        None
    }
    async fn on_position(&self, _position: &Position) -> Option<Breach> {
        None
    }
    async fn on_account(&self, _account: &Account) -> Option<Breach> {
        None
    }
    /// Quote-driven re-evaluation, invoked once per monitored account.
    async fn on_quote(&self, _account_id: i64, _quote: &Quote) -> Option<Breach> {
        None
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool;
}

/// Helper shared by the lockout-capable rules: resolve the configured
/// "until reset" target.
pub fn lockout_until_reset(
    clock: &crate::core::SessionClock,
    now: DateTime<Utc>,
) -> LockoutSpec {
    LockoutSpec::Until(clock.next_reset(now))
}
