//! Shared in-memory state: positions/orders, quotes, contracts, P&L,
//! execution counts, lockouts, and timers.

pub mod contracts;
pub mod lockout;
pub mod pnl;
pub mod quotes;
pub mod session;
pub mod state;
pub mod timers;
pub mod trade_counter;

pub use contracts::ContractCache;
pub use lockout::LockoutManager;
pub use pnl::PnlTracker;
pub use quotes::QuoteTracker;
pub use session::SessionClock;
pub use state::StateManager;
pub use timers::TimerManager;
pub use trade_counter::{TradeCounter, TradeCounts};
