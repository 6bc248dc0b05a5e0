//! Brokerage error taxonomy, classification, and retry policy.
//!
//! Every REST response that is not a success passes through `classify`,
//! which buckets it as authentication / rate-limit / transient / permanent
//! / unknown. Only transient and rate-limit errors are retried, with
//! jittered exponential backoff capped at `max_backoff`.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const TRANSIENT_STATUS: &[u16] = &[408, 500, 502, 503, 504];
const PERMANENT_STATUS: &[u16] = &[400, 403, 404, 405, 406, 409, 410, 422];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "temporary",
    "unavailable",
    "overloaded",
    "retry",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "invalid",
    "not found",
    "forbidden",
    "unauthorized",
    "bad request",
    "conflict",
];

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("transient error (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    #[error("permanent error (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    #[error("unclassified error (status {status:?}): {message}")]
    Unknown {
        status: Option<u16>,
        message: String,
    },
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Authentication(_) => "authentication",
            ApiError::RateLimit { .. } => "rate_limit",
            ApiError::Transient { .. } => "transient",
            ApiError::Permanent { .. } => "permanent",
            ApiError::Unknown { .. } => "unknown",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Authentication(_) => Some(401),
            ApiError::RateLimit { .. } => Some(429),
            ApiError::Transient { status, .. }
            | ApiError::Permanent { status, .. }
            | ApiError::Unknown { status, .. } => *status,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient { .. } | ApiError::RateLimit { .. })
    }

    /// Network and timeout failures from the HTTP layer count as transient.
    pub fn from_network(err: &reqwest::Error) -> Self {
        ApiError::Transient {
            status: None,
            message: err.to_string(),
        }
    }
}

/// Classify a response by status code, then by body keywords when the
/// status is ambiguous.
pub fn classify(status: Option<u16>, body: &str) -> ApiError {
    if status == Some(401) {
        return ApiError::Authentication(truncate(body));
    }
    if status == Some(429) {
        return ApiError::RateLimit {
            message: truncate(body),
            retry_after: extract_retry_after(body),
        };
    }
    if let Some(code) = status {
        if TRANSIENT_STATUS.contains(&code) {
            return ApiError::Transient {
                status,
                message: truncate(body),
            };
        }
        if PERMANENT_STATUS.contains(&code) {
            return ApiError::Permanent {
                status,
                message: truncate(body),
            };
        }
    }

    let lower = body.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ApiError::Transient {
            status,
            message: truncate(body),
        };
    }
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ApiError::Permanent {
            status,
            message: truncate(body),
        };
    }

    ApiError::Unknown {
        status,
        message: truncate(body),
    }
}

/// Error messages may echo request bodies; cap their size and mask any
/// credentials before they can reach a log line.
fn truncate(body: &str) -> String {
    const MAX: usize = 500;
    let masked = crate::logging::mask_secrets(body);
    if masked.len() <= MAX {
        return masked;
    }
    let mut end = MAX;
    while !masked.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &masked[..end])
}

/// Pull a retry hint out of a 429 body. Accepts "retry-after: 30",
/// "retry after 30", "wait: 30", and "30 seconds" shapes.
pub fn extract_retry_after(body: &str) -> Option<u64> {
    let lower = body.to_lowercase();

    for key in ["retry-after", "retry after", "wait"] {
        if let Some(idx) = lower.find(key) {
            if let Some(n) = first_number(&lower[idx + key.len()..]) {
                return Some(n);
            }
        }
    }

    // "<N> seconds" with the number leading
    if let Some(idx) = lower.find("second") {
        if let Some(n) = last_number(&lower[..idx]) {
            return Some(n);
        }
    }

    None
}

fn first_number(s: &str) -> Option<u64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let digits: String = s[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn last_number(s: &str) -> Option<u64> {
    let end = s.rfind(|c: char| c.is_ascii_digit())?;
    let start = s[..=end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    s[start..=end].parse().ok()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Environment overrides for operational tuning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse_u64 = |var: &str| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&v| v > 0)
        };
        Self {
            max_retries: parse_u64("RISKWARDEN_MAX_RETRIES")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_retries),
            initial_backoff: parse_u64("RISKWARDEN_INITIAL_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: parse_u64("RISKWARDEN_MAX_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
            jitter_factor: defaults.jitter_factor,
        }
    }

    /// Retry only transient/rate-limit failures, and only while attempts
    /// remain.
    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            warn!(
                kind = error.kind(),
                attempt, "retry budget exhausted, surfacing error"
            );
            return false;
        }
        error.is_retryable()
    }

    /// Server-provided retry-after wins; otherwise exponential backoff
    /// with ±10% jitter, never negative.
    pub fn retry_delay(&self, attempt: u32, error: &ApiError) -> Duration {
        if let ApiError::RateLimit {
            retry_after: Some(secs),
            ..
        } = error
        {
            return Duration::from_secs(*secs);
        }

        let backoff = (self.initial_backoff.as_secs_f64() * 2f64.powi(attempt as i32))
            .min(self.max_backoff.as_secs_f64());
        let jitter = backoff * self.jitter_factor * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        Duration::from_secs_f64((backoff + jitter).max(0.0))
    }
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    kind: &'static str,
    status: Option<u16>,
    endpoint: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub by_kind: HashMap<String, usize>,
    pub by_status: HashMap<String, usize>,
    pub by_endpoint: HashMap<String, usize>,
}

/// Rolling window of the last 100 classified errors, for operator
/// statistics.
#[derive(Default)]
pub struct ErrorHistory {
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHistory {
    const CAPACITY: usize = 100;

    pub fn record(&self, error: &ApiError, endpoint: &str) {
        let mut records = self.records.lock();
        if records.len() >= Self::CAPACITY {
            records.pop_front();
        }
        records.push_back(ErrorRecord {
            kind: error.kind(),
            status: error.status(),
            endpoint: endpoint.to_string(),
        });
    }

    pub fn statistics(&self) -> ErrorStats {
        let records = self.records.lock();
        let mut stats = ErrorStats {
            total_errors: records.len(),
            ..Default::default()
        };
        for record in records.iter() {
            *stats.by_kind.entry(record.kind.to_string()).or_default() += 1;
            let status = record
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string());
            *stats.by_status.entry(status).or_default() += 1;
            *stats
                .by_endpoint
                .entry(record.endpoint.clone())
                .or_default() += 1;
        }
        stats
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
