//! Account lockouts, cooldowns, and per-symbol blocks.
//!
//! At most one ACCOUNT-level lockout per account (cooldowns are short
//! account lockouts and replace/get replaced the same way); unbounded
//! symbol lockouts. Everything persists so a restart cannot be used to
//! escape an active lockout.

use crate::models::{Lockout, LockoutKind};
use crate::persistence::Store;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Default)]
struct LockoutMaps {
    /// One account-level entry per account (ACCOUNT or COOLDOWN kind).
    account: HashMap<i64, Lockout>,
    /// symbol lockouts[account_id][symbol_root]
    symbols: HashMap<i64, HashMap<String, Lockout>>,
}

pub struct LockoutManager {
    maps: RwLock<LockoutMaps>,
    store: Option<Store>,
}

impl LockoutManager {
    pub fn new(store: Option<Store>) -> Self {
        Self {
            maps: RwLock::new(LockoutMaps::default()),
            store,
        }
    }

    /// Restore lockouts loaded from the store at startup (already pruned
    /// of expired entries).
    pub fn preload(&self, lockouts: Vec<Lockout>) {
        let mut maps = self.maps.write();
        for lockout in lockouts {
            match lockout.kind {
                LockoutKind::Account | LockoutKind::Cooldown => {
                    maps.account.insert(lockout.account_id, lockout);
                }
                LockoutKind::Symbol => {
                    if let Some(symbol) = lockout.symbol.clone() {
                        maps.symbols
                            .entry(lockout.account_id)
                            .or_default()
                            .insert(symbol, lockout);
                    }
                }
            }
        }
    }

    /// Set or replace the account lockout. `until = None` is indefinite.
    pub async fn set_lockout(
        &self,
        account_id: i64,
        reason: impl Into<String>,
        until: Option<DateTime<Utc>>,
    ) {
        let lockout = Lockout {
            account_id,
            kind: LockoutKind::Account,
            symbol: None,
            reason: reason.into(),
            applied_at: Utc::now(),
            until,
        };
        warn!(
            account_id,
            reason = %lockout.reason,
            until = ?lockout.until,
            "account lockout set"
        );
        self.install_account(lockout).await;
    }

    /// A cooldown is an account lockout with a short, fixed duration.
    pub async fn set_cooldown(&self, account_id: i64, reason: impl Into<String>, duration_secs: u64) {
        let lockout = Lockout {
            account_id,
            kind: LockoutKind::Cooldown,
            symbol: None,
            reason: reason.into(),
            applied_at: Utc::now(),
            until: Some(Utc::now() + Duration::seconds(duration_secs as i64)),
        };
        warn!(
            account_id,
            reason = %lockout.reason,
            duration_secs,
            "cooldown set"
        );
        self.install_account(lockout).await;
    }

    async fn install_account(&self, lockout: Lockout) {
        let previous = self
            .maps
            .write()
            .account
            .insert(lockout.account_id, lockout.clone());
        if let Some(store) = &self.store {
            // The account slot is unique: drop any previous row of the
            // other account-level kind before saving.
            if let Some(previous) = previous {
                if previous.kind != lockout.kind {
                    let _ = store
                        .delete_lockout(previous.account_id, previous.kind, None)
                        .await;
                }
            }
            if let Err(err) = store.save_lockout(&lockout).await {
                warn!(error = %err, "failed to persist lockout");
            }
        }
    }

    pub async fn set_symbol_lockout(
        &self,
        account_id: i64,
        symbol: impl Into<String>,
        reason: impl Into<String>,
        until: Option<DateTime<Utc>>,
    ) {
        let symbol = symbol.into();
        let lockout = Lockout {
            account_id,
            kind: LockoutKind::Symbol,
            symbol: Some(symbol.clone()),
            reason: reason.into(),
            applied_at: Utc::now(),
            until,
        };
        warn!(account_id, symbol = %symbol, until = ?lockout.until, "symbol lockout set");
        self.maps
            .write()
            .symbols
            .entry(account_id)
            .or_default()
            .insert(symbol, lockout.clone());
        if let Some(store) = &self.store {
            if let Err(err) = store.save_lockout(&lockout).await {
                warn!(error = %err, "failed to persist symbol lockout");
            }
        }
    }

    /// Live account lockout check; expired entries are dropped in place.
    pub fn is_locked_out(&self, account_id: i64) -> bool {
        self.active_lockout(account_id).is_some()
    }

    pub fn active_lockout(&self, account_id: i64) -> Option<Lockout> {
        let now = Utc::now();
        let mut maps = self.maps.write();
        if let Some(lockout) = maps.account.get(&account_id) {
            if lockout.is_expired(now) {
                info!(account_id, "account lockout expired");
                maps.account.remove(&account_id);
                return None;
            }
            return Some(lockout.clone());
        }
        None
    }

    pub fn is_symbol_locked(&self, account_id: i64, symbol: &str) -> bool {
        let now = Utc::now();
        let mut maps = self.maps.write();
        if let Some(symbols) = maps.symbols.get_mut(&account_id) {
            if let Some(lockout) = symbols.get(symbol) {
                if lockout.is_expired(now) {
                    symbols.remove(symbol);
                    return false;
                }
                return true;
            }
        }
        false
    }

    pub async fn remove_lockout(&self, account_id: i64) {
        let removed = self.maps.write().account.remove(&account_id);
        if let Some(removed) = removed {
            info!(account_id, "account lockout removed");
            if let Some(store) = &self.store {
                if let Err(err) = store.delete_lockout(account_id, removed.kind, None).await {
                    warn!(error = %err, "failed to delete persisted lockout");
                }
            }
        }
    }

    pub async fn remove_symbol_lockout(&self, account_id: i64, symbol: &str) {
        let removed = self
            .maps
            .write()
            .symbols
            .get_mut(&account_id)
            .and_then(|symbols| symbols.remove(symbol));
        if removed.is_some() {
            info!(account_id, symbol, "symbol lockout removed");
            if let Some(store) = &self.store {
                if let Err(err) = store
                    .delete_lockout(account_id, LockoutKind::Symbol, Some(symbol))
                    .await
                {
                    warn!(error = %err, "failed to delete persisted symbol lockout");
                }
            }
        }
    }

    pub fn symbol_lockouts(&self, account_id: i64) -> Vec<Lockout> {
        self.maps
            .read()
            .symbols
            .get(&account_id)
            .map(|symbols| symbols.values().cloned().collect())
            .unwrap_or_default()
    }
}
