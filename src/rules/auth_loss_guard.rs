//! RULE-010: broker `canTrade` guard.
//!
//! A true→false transition (or an account first seen with canTrade=false)
//! flattens the account and installs an indefinite lockout. The false→true
//! restoration removes it when auto-unlock is configured. This is the only
//! rule the router still consults while the account is locked out.

use super::{Breach, BreachAction, LockoutSpec, RiskRule};
use crate::config::AuthLossGuardConfig;
use crate::core::LockoutManager;
use crate::enforcement::EnforcementActions;
use crate::models::Account;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AuthLossGuardRule {
    config: AuthLossGuardConfig,
    actions: Arc<EnforcementActions>,
    lockouts: Arc<LockoutManager>,
    /// Last observed canTrade per account; None until first sighting.
    seen: RwLock<HashMap<i64, bool>>,
}

impl AuthLossGuardRule {
    pub const RULE_ID: &'static str = "RULE-010";

    pub fn new(
        config: AuthLossGuardConfig,
        actions: Arc<EnforcementActions>,
        lockouts: Arc<LockoutManager>,
    ) -> Self {
        Self {
            config,
            actions,
            lockouts,
            seen: RwLock::new(HashMap::new()),
        }
    }

    fn restriction_breach(&self, reason: String, previous: Option<bool>) -> Breach {
        Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::CloseAllAndLockout {
                lockout: LockoutSpec::Indefinite,
            },
            reason,
            observed_metrics: serde_json::json!({
                "previous_can_trade": previous,
                "can_trade": false,
            }),
        }
    }
}

#[async_trait]
impl RiskRule for AuthLossGuardRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_account(&self, account: &Account) -> Option<Breach> {
        let previous = self
            .seen
            .write()
            .insert(account.account_id, account.can_trade);

        match (previous, account.can_trade) {
            (Some(true), false) => {
                warn!(
                    account_id = account.account_id,
                    "broker revoked canTrade, restricting account"
                );
                Some(self.restriction_breach(
                    "account restricted by broker (canTrade=false)".to_string(),
                    previous,
                ))
            }
            // First sighting already restricted counts as a startup breach.
            (None, false) if self.config.check_on_startup => {
                warn!(
                    account_id = account.account_id,
                    "account has canTrade=false on startup"
                );
                Some(self.restriction_breach(
                    "account has canTrade=false on startup".to_string(),
                    previous,
                ))
            }
            (Some(false), true) if self.config.auto_unlock_on_restore => {
                info!(
                    account_id = account.account_id,
                    "broker restored canTrade, removing lockout"
                );
                Some(Breach {
                    rule_id: Self::RULE_ID,
                    action: BreachAction::RemoveLockout,
                    reason: "broker restored trading (canTrade=true)".to_string(),
                    observed_metrics: serde_json::json!({
                        "previous_can_trade": previous,
                        "can_trade": true,
                    }),
                })
            }
            _ => None,
        }
    }

    async fn enforce(&self, account_id: i64, breach: &Breach) -> bool {
        match &breach.action {
            BreachAction::CloseAllAndLockout { .. } => {
                let close_ok = self.actions.close_all_positions(account_id).await;
                let cancel_ok = self.actions.cancel_all_orders(account_id).await;
                self.lockouts
                    .set_lockout(account_id, breach.reason.clone(), None)
                    .await;
                close_ok && cancel_ok
            }
            BreachAction::RemoveLockout => {
                self.lockouts.remove_lockout(account_id).await;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StateManager;

    fn fixture(config: AuthLossGuardConfig) -> (Arc<LockoutManager>, AuthLossGuardRule) {
        let lockouts = Arc::new(LockoutManager::new(None));
        let actions = Arc::new(EnforcementActions::new(
            crate::testing::dry_run_rest_client(),
            Arc::new(StateManager::new()),
            None,
        ));
        let rule = AuthLossGuardRule::new(config, actions, lockouts.clone());
        (lockouts, rule)
    }

    fn account(can_trade: bool) -> Account {
        Account {
            account_id: 12345,
            name: "EXPRESS-1".to_string(),
            balance: 50_000.0,
            can_trade,
            is_visible: true,
            simulated: false,
        }
    }

    #[tokio::test]
    async fn test_revocation_locks_indefinitely() {
        let (lockouts, rule) = fixture(AuthLossGuardConfig::default());

        assert!(rule.on_account(&account(true)).await.is_none());
        let breach = rule.on_account(&account(false)).await.unwrap();
        assert!(breach.is_terminal());

        assert!(rule.enforce(12345, &breach).await);
        let lockout = lockouts.active_lockout(12345).unwrap();
        assert!(lockout.until.is_none());
    }

    #[tokio::test]
    async fn test_startup_false_breaches() {
        let (_, rule) = fixture(AuthLossGuardConfig::default());
        let breach = rule.on_account(&account(false)).await.unwrap();
        assert!(breach.reason.contains("startup"));
    }

    #[tokio::test]
    async fn test_startup_check_disabled() {
        let (_, rule) = fixture(AuthLossGuardConfig {
            check_on_startup: false,
            ..AuthLossGuardConfig::default()
        });
        assert!(rule.on_account(&account(false)).await.is_none());
    }

    #[tokio::test]
    async fn test_restore_removes_lockout() {
        let (lockouts, rule) = fixture(AuthLossGuardConfig::default());

        rule.on_account(&account(true)).await;
        let breach = rule.on_account(&account(false)).await.unwrap();
        rule.enforce(12345, &breach).await;
        assert!(lockouts.is_locked_out(12345));

        let restore = rule.on_account(&account(true)).await.unwrap();
        assert_eq!(restore.action, BreachAction::RemoveLockout);
        assert!(rule.enforce(12345, &restore).await);
        assert!(!lockouts.is_locked_out(12345));
    }

    #[tokio::test]
    async fn test_no_auto_unlock_when_disabled() {
        let (_, rule) = fixture(AuthLossGuardConfig {
            auto_unlock_on_restore: false,
            ..AuthLossGuardConfig::default()
        });
        rule.on_account(&account(true)).await;
        rule.on_account(&account(false)).await;
        assert!(rule.on_account(&account(true)).await.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_state_is_quiet() {
        let (_, rule) = fixture(AuthLossGuardConfig::default());
        rule.on_account(&account(true)).await;
        assert!(rule.on_account(&account(true)).await.is_none());
    }
}
