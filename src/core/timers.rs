//! Keyed one-shot timers (grace periods, session-end auto-close, daily
//! resets).
//!
//! Keys are deterministic strings ("no_sl_grace:<account>:<position>") so
//! scheduling and cancellation are idempotent: re-scheduling a live key
//! replaces it, cancelling a missing key is a no-op. Timers are dropped on
//! shutdown; recurring deadlines are re-derived on the next start.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

struct TimerEntry {
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct TimerManager {
    timers: Mutex<HashMap<String, TimerEntry>>,
    // Lets fired timers deregister themselves without keeping the
    // manager alive.
    self_ref: Weak<TimerManager>,
}

impl TimerManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            timers: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    /// Schedule `callback` to run at `fires_at`. An existing timer under
    /// the same key is replaced.
    pub fn schedule<F>(&self, key: impl Into<String>, fires_at: DateTime<Utc>, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        self.cancel(&key);

        let delay = (fires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(key = %key, delay_s = delay.as_secs_f64(), "timer scheduled");

        let weak: Weak<Self> = self.self_ref.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister before running so the callback can re-schedule
            // the same key.
            if let Some(manager) = weak.upgrade() {
                manager.timers.lock().remove(&task_key);
            }
            debug!(key = %task_key, "timer fired");
            callback.await;
        });

        self.timers
            .lock()
            .insert(key, TimerEntry { fires_at, handle });
    }

    /// Cancel a timer; idempotent.
    pub fn cancel(&self, key: &str) -> bool {
        if let Some(entry) = self.timers.lock().remove(key) {
            entry.handle.abort();
            debug!(key, "timer cancelled");
            true
        } else {
            false
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.timers.lock().contains_key(key)
    }

    /// Time remaining until the timer fires, if it exists.
    pub fn remaining(&self, key: &str) -> Option<chrono::Duration> {
        self.timers
            .lock()
            .get(key)
            .map(|entry| entry.fires_at - Utc::now())
    }

    /// Drop every pending timer (shutdown path).
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock();
        for (key, entry) in timers.drain() {
            debug!(key = %key, "timer dropped at shutdown");
            entry.handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_deregisters() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule(
            "grace:1:7",
            Utc::now() + chrono::Duration::seconds(30),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(timers.has("grace:1:7"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.has("grace:1:7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule(
            "grace:1:7",
            Utc::now() + chrono::Duration::seconds(30),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(timers.cancel("grace:1:7"));
        // Cancelling again is a no-op.
        assert!(!timers.cancel("grace:1:7"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = fired.clone();
            timers.schedule(
                "auto_close:1",
                Utc::now() + chrono::Duration::seconds(10),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule(
            "late",
            Utc::now() - chrono::Duration::seconds(5),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remaining_reports_deadline() {
        let timers = TimerManager::new();
        timers.schedule(
            "x",
            Utc::now() + chrono::Duration::seconds(30),
            async move {},
        );
        let remaining = timers.remaining("x").unwrap();
        assert!(remaining.num_seconds() <= 30 && remaining.num_seconds() >= 28);
        assert!(timers.remaining("missing").is_none());
        timers.cancel_all();
        assert!(timers.is_empty());
    }
}
