//! Client-side rate limiting for the brokerage REST API.
//!
//! Two endpoint classes with independent budgets:
//! - `history` search endpoints: 50 requests per 30 s
//! - everything else: 200 requests per 60 s
//!
//! Each class combines a sliding window of call timestamps with a token
//! bucket refilled at `limit / window` tokens per second. `acquire` never
//! fails; it sleeps until a slot frees up and reports how long it waited.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const HISTORY_ENDPOINTS: &[&str] = &[
    "/api/Position/searchHistory",
    "/api/Order/searchHistory",
    "/api/Trade/searchHistory",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    History,
    General,
}

impl EndpointClass {
    /// Unknown endpoints default to the general budget.
    pub fn classify(endpoint: &str) -> Self {
        if HISTORY_ENDPOINTS.iter().any(|h| endpoint.contains(h)) {
            EndpointClass::History
        } else {
            EndpointClass::General
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub limit: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub history: ClassLimit,
    pub general: ClassLimit,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            history: ClassLimit {
                limit: 50,
                window: Duration::from_secs(30),
            },
            general: ClassLimit {
                limit: 200,
                window: Duration::from_secs(60),
            },
        }
    }
}

impl RateLimiterConfig {
    /// Environment overrides for operational tuning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |var: &str| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&v| v > 0)
        };
        Self {
            history: ClassLimit {
                limit: parse("RISKWARDEN_HISTORY_RATE_LIMIT")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.history.limit),
                window: parse("RISKWARDEN_HISTORY_RATE_WINDOW_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.history.window),
            },
            general: ClassLimit {
                limit: parse("RISKWARDEN_GENERAL_RATE_LIMIT")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.general.limit),
                window: parse("RISKWARDEN_GENERAL_RATE_WINDOW_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.general.window),
            },
        }
    }
}

struct ClassState {
    limit: usize,
    window: Duration,
    timestamps: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
}

impl ClassState {
    fn new(cfg: ClassLimit) -> Self {
        Self {
            limit: cfg.limit,
            window: cfg.window,
            timestamps: VecDeque::with_capacity(cfg.limit),
            tokens: cfg.limit as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let rate = self.limit as f64 / self.window.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.limit as f64);
        self.last_refill = now;
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Zero when a slot is free; otherwise time until the oldest call
    /// leaves the window.
    fn wait_needed(&self, now: Instant) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.timestamps.len() < self.limit {
            return Duration::ZERO;
        }
        match self.timestamps.front() {
            Some(&oldest) => {
                let expires_at = oldest + self.window;
                expires_at.saturating_duration_since(now)
            }
            None => Duration::ZERO,
        }
    }

    fn consume(&mut self, now: Instant) {
        self.tokens -= 1.0;
        self.timestamps.push_back(now);
    }

    fn reset(&mut self, now: Instant) {
        self.timestamps.clear();
        self.tokens = self.limit as f64;
        self.last_refill = now;
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_waits: u64,
    pub total_wait_time: f64,
    pub average_wait_time: f64,
    pub history_window_count: usize,
    pub general_window_count: usize,
    pub history_tokens: f64,
    pub general_tokens: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    total_waits: u64,
    total_wait_time: f64,
}

pub struct RateLimiter {
    history: Mutex<ClassState>,
    general: Mutex<ClassState>,
    counters: Mutex<Counters>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        debug!(
            history_limit = config.history.limit,
            history_window_s = config.history.window.as_secs(),
            general_limit = config.general.limit,
            general_window_s = config.general.window.as_secs(),
            "rate limiter initialized"
        );
        Self {
            history: Mutex::new(ClassState::new(config.history)),
            general: Mutex::new(ClassState::new(config.general)),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn class(&self, class: EndpointClass) -> &Mutex<ClassState> {
        match class {
            EndpointClass::History => &self.history,
            EndpointClass::General => &self.general,
        }
    }

    /// Acquire a slot for `endpoint`, sleeping as long as the budget
    /// requires. Returns the total time spent waiting.
    pub async fn acquire(&self, endpoint: &str) -> Duration {
        let class = EndpointClass::classify(endpoint);
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut state = self.class(class).lock();
                let now = Instant::now();
                state.refill(now);
                state.evict_expired(now);
                let wait = state.wait_needed(now);
                if wait.is_zero() {
                    state.consume(now);
                    let mut counters = self.counters.lock();
                    counters.total_requests += 1;
                    if !waited.is_zero() {
                        counters.total_waits += 1;
                        counters.total_wait_time += waited.as_secs_f64();
                    }
                    return waited;
                }
                wait
            };

            warn!(
                endpoint,
                ?class,
                wait_s = wait.as_secs_f64(),
                "rate limit reached, throttling request"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Estimated wait for the next call without consuming a slot.
    pub fn wait_hint(&self, endpoint: &str) -> Duration {
        let class = EndpointClass::classify(endpoint);
        let mut state = self.class(class).lock();
        let now = Instant::now();
        state.refill(now);
        state.evict_expired(now);
        state.wait_needed(now)
    }

    /// Requests still available in the current window.
    pub fn remaining(&self, endpoint: &str) -> usize {
        let class = EndpointClass::classify(endpoint);
        let mut state = self.class(class).lock();
        state.evict_expired(Instant::now());
        state.limit.saturating_sub(state.timestamps.len())
    }

    /// When the current window frees its oldest slot.
    pub fn reset_at(&self, endpoint: &str) -> Instant {
        let class = EndpointClass::classify(endpoint);
        let state = self.class(class).lock();
        match state.timestamps.front() {
            Some(&oldest) => oldest + state.window,
            None => Instant::now(),
        }
    }

    pub fn reset(&self) {
        let now = Instant::now();
        self.history.lock().reset(now);
        self.general.lock().reset(now);
        *self.counters.lock() = Counters::default();
    }

    pub fn statistics(&self) -> RateLimiterStats {
        let counters = self.counters.lock();
        let history = self.history.lock();
        let general = self.general.lock();
        RateLimiterStats {
            total_requests: counters.total_requests,
            total_waits: counters.total_waits,
            total_wait_time: counters.total_wait_time,
            average_wait_time: if counters.total_waits > 0 {
                counters.total_wait_time / counters.total_waits as f64
            } else {
                0.0
            },
            history_window_count: history.timestamps.len(),
            general_window_count: general.timestamps.len(),
            history_tokens: history.tokens,
            general_tokens: general.tokens,
        }
    }
}
