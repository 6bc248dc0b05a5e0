//! Connection health derived from ping results and event recency.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const PING_HISTORY: usize = 10;
const HEALTHY_SUCCESS_RATE: f64 = 0.95;
const DEGRADED_SUCCESS_RATE: f64 = 0.80;
const HEALTHY_MAX_LATENCY: Duration = Duration::from_millis(500);
const UNHEALTHY_LATENCY: Duration = Duration::from_millis(2000);
const DISCONNECTED_CONSECUTIVE_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct PingResult {
    success: bool,
    latency: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingStats {
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: f64,
    pub average_latency: Duration,
    pub consecutive_failures: usize,
}

struct Inner {
    results: VecDeque<PingResult>,
    last_event: Option<Instant>,
}

pub struct HealthMonitor {
    inner: Mutex<Inner>,
    stale_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                results: VecDeque::with_capacity(PING_HISTORY),
                last_event: None,
            }),
            stale_threshold,
        }
    }

    pub fn record_ping(&self, success: bool, latency: Duration) {
        let mut inner = self.inner.lock();
        if inner.results.len() >= PING_HISTORY {
            inner.results.pop_front();
        }
        inner.results.push_back(PingResult { success, latency });
    }

    /// Any server-originated traffic counts against staleness.
    pub fn record_event(&self) {
        self.inner.lock().last_event = Some(Instant::now());
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.results.clear();
        inner.last_event = Some(Instant::now());
    }

    pub fn ping_stats(&self) -> PingStats {
        let inner = self.inner.lock();
        if inner.results.is_empty() {
            return PingStats::default();
        }
        let success_count = inner.results.iter().filter(|r| r.success).count();
        let failure_count = inner.results.len() - success_count;
        let successes: Vec<_> = inner.results.iter().filter(|r| r.success).collect();
        let average_latency = if successes.is_empty() {
            Duration::ZERO
        } else {
            successes.iter().map(|r| r.latency).sum::<Duration>() / successes.len() as u32
        };
        let consecutive_failures = inner
            .results
            .iter()
            .rev()
            .take_while(|r| !r.success)
            .count();
        PingStats {
            success_count,
            failure_count,
            success_rate: success_count as f64 / inner.results.len() as f64,
            average_latency,
            consecutive_failures,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.inner.lock().last_event {
            Some(at) => at.elapsed() >= self.stale_threshold,
            None => false,
        }
    }

    pub fn status(&self) -> HealthStatus {
        let stats = self.ping_stats();

        if stats.consecutive_failures >= DISCONNECTED_CONSECUTIVE_FAILURES || self.is_stale() {
            return HealthStatus::Disconnected;
        }
        if stats.success_count + stats.failure_count == 0 {
            // No pings yet on a fresh connection.
            return HealthStatus::Healthy;
        }
        if stats.success_rate >= HEALTHY_SUCCESS_RATE && stats.average_latency <= HEALTHY_MAX_LATENCY
        {
            return HealthStatus::Healthy;
        }
        if stats.success_rate < DEGRADED_SUCCESS_RATE || stats.average_latency > UNHEALTHY_LATENCY {
            return HealthStatus::Unhealthy;
        }
        HealthStatus::Degraded
    }
}
