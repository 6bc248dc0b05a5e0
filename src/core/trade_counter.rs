//! Rolling execution counts per account: minute, hour, and session
//! windows.
//!
//! Voided trades are never recorded; half-turns are (they still represent
//! execution activity). The session window is anchored at the last daily
//! reset.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

const MINUTE_WINDOW_SECS: i64 = 60;
const HOUR_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeCounts {
    pub minute: usize,
    pub hour: usize,
    pub session: usize,
}

#[derive(Default)]
struct AccountWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    session_start: Option<DateTime<Utc>>,
    session_count: usize,
}

impl AccountWindow {
    fn evict(&mut self, now: DateTime<Utc>) {
        // Keep one hour of history; minute counts derive from the same deque.
        while let Some(&oldest) = self.timestamps.front() {
            if now - oldest > Duration::seconds(HOUR_WINDOW_SECS) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn counts(&self, now: DateTime<Utc>) -> TradeCounts {
        let minute_cutoff = now - Duration::seconds(MINUTE_WINDOW_SECS);
        let minute = self
            .timestamps
            .iter()
            .rev()
            .take_while(|&&ts| ts > minute_cutoff)
            .count();
        TradeCounts {
            minute,
            hour: self.timestamps.len(),
            session: self.session_count,
        }
    }
}

#[derive(Default)]
pub struct TradeCounter {
    windows: RwLock<HashMap<i64, AccountWindow>>,
}

impl TradeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed trade and return the updated counts.
    pub fn record_trade(&self, account_id: i64, at: DateTime<Utc>) -> TradeCounts {
        let mut windows = self.windows.write();
        let window = windows.entry(account_id).or_default();
        window.evict(at);
        window.timestamps.push_back(at);
        window.session_count += 1;
        window.session_start.get_or_insert(at);
        window.counts(at)
    }

    /// Non-mutating snapshot of the current counts.
    pub fn counts(&self, account_id: i64, now: DateTime<Utc>) -> TradeCounts {
        let mut windows = self.windows.write();
        let window = windows.entry(account_id).or_default();
        window.evict(now);
        window.counts(now)
    }

    /// Called at the daily reset: the session window starts over.
    pub fn reset_session(&self, account_id: i64, at: DateTime<Utc>) {
        let mut windows = self.windows.write();
        let window = windows.entry(account_id).or_default();
        window.session_start = Some(at);
        window.session_count = 0;
    }
}
