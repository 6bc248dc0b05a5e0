//! RULE-009: session hours, holidays, and session-end auto-close.
//!
//! A position opened outside the configured session (global or
//! per-instrument override, sessions may wrap midnight) or on a holiday
//! flattens the account and locks it until the next session start. An
//! optional timer closes everything at the exact session end without a
//! lockout.

use super::{Breach, BreachAction, LockoutSpec, RiskRule};
use crate::config::SessionHoursConfig;
use crate::core::session::parse_clock_time;
use crate::core::{LockoutManager, SessionClock, TimerManager};
use crate::enforcement::EnforcementActions;
use crate::models::Position;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
struct SessionWindow {
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl SessionWindow {
    /// Membership with midnight wrap: `start <= now < end` normally,
    /// `now >= start || now < end` when the session wraps.
    fn contains(&self, now: DateTime<Utc>) -> bool {
        let time = now.with_timezone(&self.tz).time();
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    fn next_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        SessionClock::new(self.start, self.tz).next_reset(now)
    }

    fn next_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        SessionClock::new(self.end, self.tz).next_reset(now)
    }
}

pub struct SessionHoursRule {
    config: SessionHoursConfig,
    global: SessionWindow,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    timers: Arc<TimerManager>,
}

impl SessionHoursRule {
    pub const RULE_ID: &'static str = "RULE-009";

    pub fn new(
        config: SessionHoursConfig,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
        timers: Arc<TimerManager>,
    ) -> anyhow::Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid session timezone {:?}: {e}", config.timezone))?;
        let start = parse_clock_time(&config.start)
            .ok_or_else(|| anyhow::anyhow!("invalid session start {:?}", config.start))?;
        let end = parse_clock_time(&config.end)
            .ok_or_else(|| anyhow::anyhow!("invalid session end {:?}", config.end))?;
        Ok(Self {
            config,
            global: SessionWindow { start, end, tz },
            actions,
            lockouts,
            timers,
        })
    }

    fn window_for(&self, symbol: &str) -> SessionWindow {
        let Some(over) = self.config.per_instrument.get(symbol) else {
            return self.global;
        };
        let tz = over
            .timezone
            .as_deref()
            .and_then(|raw| raw.parse::<Tz>().ok())
            .unwrap_or(self.global.tz);
        SessionWindow {
            start: parse_clock_time(&over.start).unwrap_or(self.global.start),
            end: parse_clock_time(&over.end).unwrap_or(self.global.end),
            tz,
        }
    }

    fn is_holiday(&self, now: DateTime<Utc>, window: &SessionWindow) -> bool {
        if self.config.holidays.is_empty() {
            return false;
        }
        let today = now
            .with_timezone(&window.tz)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();
        self.config.holidays.iter().any(|h| h == &today)
    }

    /// Install the session-end auto-close timer for one account and keep
    /// re-arming it daily.
    pub fn schedule_auto_close(self: Arc<Self>, account_id: i64) {
        if !self.config.enabled || !self.config.auto_close_at_end {
            return;
        }
        let fires_at = self.global.next_end(Utc::now());
        let key = format!("session_end:{account_id}");
        info!(account_id, %fires_at, "session-end auto-close scheduled");
        let rule = self.clone();
        self.timers.schedule(key, fires_at, async move {
            rule.run_auto_close(account_id).await;
            rule.schedule_auto_close(account_id);
        });
    }

    async fn run_auto_close(&self, account_id: i64) {
        if self.lockouts.is_locked_out(account_id) {
            return;
        }
        info!(account_id, "session end reached, auto-closing positions");
        let ok = self.actions.close_all_positions(account_id).await;
        self.actions
            .log_enforcement(
                &uuid::Uuid::new_v4().to_string(),
                account_id,
                Self::RULE_ID,
                "CLOSE_ALL",
                "session end auto-close",
                serde_json::json!({ "close_ok": ok }),
            )
            .await;
    }
}

#[async_trait]
impl RiskRule for SessionHoursRule {
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
        let now = Utc::now();
        let symbol = position.symbol_root().to_string();
        let window = self.window_for(&symbol);

        if self.is_holiday(now, &window) {
            warn!(
                account_id = position.account_id,
                symbol = %symbol,
                "position opened on a market holiday"
            );
            return Some(Breach {
                rule_id: Self::RULE_ID,
                action: BreachAction::CloseAllAndLockout {
                    lockout: LockoutSpec::Until(window.next_start(now)),
                },
                reason: "trading on market holiday".to_string(),
                observed_metrics: serde_json::json!({
                    "symbol": symbol,
                    "date": now.with_timezone(&window.tz).date_naive().to_string(),
                }),
            });
        }

        if window.contains(now) {
            return None;
        }

        let next_start = window.next_start(now);
        warn!(
            account_id = position.account_id,
            symbol = %symbol,
            next_session_start = %next_start,
            "position opened outside session hours"
        );
        Some(Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::CloseAllAndLockout {
                lockout: LockoutSpec::Until(next_start),
            },
            reason: "trading outside session hours".to_string(),
            observed_metrics: serde_json::json!({
                "symbol": symbol,
                "session_start": window.start.format("%H:%M").to_string(),
                "session_end": window.end.format("%H:%M").to_string(),
                "current_time": now.with_timezone(&window.tz).time().format("%H:%M:%S").to_string(),
            }),
        })
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        let BreachAction::CloseAllAndLockout { lockout } = &breach.action else {
            return false;
        };
        let close_ok = self.actions.close_all_positions(account_id).await;
        let cancel_ok = self.actions.cancel_all_orders(account_id).await;
        if let LockoutSpec::Until(until) = lockout {
            self.lockouts
                .set_lockout(account_id, breach.reason.clone(), Some(*until))
                .await;
        }
        close_ok && cancel_ok
    }
}
