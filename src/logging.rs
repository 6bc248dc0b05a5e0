//! Structured logging: stdout plus daily-rolling files per channel.
//!
//! Channels: `daemon` (everything), `enforcement` (the enforcement log
//! target), `api` (REST/stream plumbing), `error` (errors only). Log
//! records carry the per-event correlation id as a structured field, and
//! anything that might embed credentials passes through [`mask_secrets`]
//! before reaching a field.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const SENSITIVE_KEYS: &[&str] = &["token", "apikey", "api_key", "authorization"];

/// Initialize the subscriber. The returned guards must be held for the
/// process lifetime or buffered log lines are lost on shutdown.
pub fn init(log_dir: Option<&Path>) -> Result<Vec<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut guards = Vec::new();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        return Ok(guards);
    };

    std::fs::create_dir_all(dir)?;
    let mut file_layer = |name: &str| {
        let appender = tracing_appender::rolling::daily(dir, format!("{name}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
    };

    let base = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let file_layers: Vec<Box<dyn Layer<_> + Send + Sync>> = vec![
        file_layer("daemon").boxed(),
        file_layer("enforcement")
            .with_filter(filter_fn(|meta| meta.target() == "enforcement"))
            .boxed(),
        file_layer("api")
            .with_filter(filter_fn(|meta| {
                meta.target().starts_with("riskwarden::api")
                    || meta.target().starts_with("riskwarden::stream")
            }))
            .boxed(),
        file_layer("error").with_filter(LevelFilter::ERROR).boxed(),
    ];

    base.with(file_layers).init();

    Ok(guards)
}

/// Mask credential values in free-form text (JSON bodies, query strings)
/// before it is logged. `"token": "abc"` becomes `"token": "***"`, and
/// `access_token=abc` style pairs are masked too.
pub fn mask_secrets(text: &str) -> String {
    let mut out = text.to_string();
    // ASCII lowering keeps byte offsets aligned with the original.
    let lower = text.to_ascii_lowercase();

    for key in SENSITIVE_KEYS {
        let mut search_from = 0;
        while let Some(found) = lower[search_from..].find(key) {
            let key_end = search_from + found + key.len();
            if let Some(range) = value_range(&out, key_end) {
                out.replace_range(range, "***");
                // Positions shifted; the conservative move is to stop
                // scanning this key (one secret per key per message in
                // practice).
                break;
            }
            search_from = key_end;
        }
    }
    out
}

/// Locate the value following `key` at `from`, for `: "value"`, `:value`,
/// and `=value` shapes. Returns the byte range of the value itself.
fn value_range(text: &str, from: usize) -> Option<std::ops::Range<usize>> {
    let bytes = text.as_bytes();
    let mut i = from;
    // Skip quote closing the key, whitespace, then one ':' or '='.
    while i < bytes.len() && (bytes[i] == b'"' || bytes[i].is_ascii_whitespace()) {
        i += 1;
    }
    if i >= bytes.len() || (bytes[i] != b':' && bytes[i] != b'=') {
        return None;
    }
    i += 1;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    if bytes[i] == b'"' {
        let start = i + 1;
        let end = text[start..].find('"').map(|p| start + p)?;
        (end > start).then_some(start..end)
    } else {
        // Unquoted values run to the next separator; spaces stay inside
        // so "Bearer <jwt>" is masked whole.
        let start = i;
        let end = text[start..]
            .find(|c: char| c == '&' || c == ',' || c == '}' || c == '\n')
            .map(|p| start + p)
            .unwrap_or(text.len());
        (end > start).then_some(start..end)
    }
}
