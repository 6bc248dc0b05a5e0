//! RULE-001: account-wide open contract cap.
//!
//! Position events recompute the total open contract count; exceeding the
//! limit closes everything. No lockout: the trader may re-enter within the
//! limit.

use super::{Breach, BreachAction, RiskRule};
use crate::config::MaxContractsConfig;
use crate::core::StateManager;
use crate::enforcement::EnforcementActions;
use crate::models::Position;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct MaxContractsRule {
    config: MaxContractsConfig,
    state: Arc<StateManager>,
    actions: Arc<EnforcementActions>,
}

impl MaxContractsRule {
    pub const RULE_ID: &'static str = "RULE-001";

    pub fn new(
        config: MaxContractsConfig,
        state: Arc<StateManager>,
        actions: Arc<EnforcementActions>,
    ) -> Self {
        Self {
            config,
            state,
            actions,
        }
    }
}

#[async_trait]
impl RiskRule for MaxContractsRule {
    fn rule_id(&self) -> &'static str {
        Self::RULE_ID
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn on_position(&self, position: &Position) -> Option<Breach> {
        let total = self.state.total_contract_count(position.account_id);
        if total <= self.config.limit {
            return None;
        }
        warn!(
            account_id = position.account_id,
            total,
            limit = self.config.limit,
            "account contract limit exceeded"
        );
        Some(Breach {
            rule_id: Self::RULE_ID,
            action: BreachAction::CloseAll,
            reason: format!(
                "total open contracts {total} exceed limit {}",
                self.config.limit
            ),
            observed_metrics: serde_json::json!({
                "total_contracts": total,
                "limit": self.config.limit,
            }),
        })
    }

    async fn enforce(&self, account_id: i64, _breach: &Breach) -> bool {
        self.actions.close_all_positions(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionDirection;

    fn position(contract: &str, size: i64) -> Position {
        Position {
            position_id: Some(1),
            account_id: 1,
            contract_id: contract.to_string(),
            opened_at: None,
            direction: PositionDirection::Long,
            size,
            average_price: 21000.0,
        }
    }

    fn rule_with(limit: i64, sizes: &[(&str, i64)]) -> (Arc<StateManager>, MaxContractsRule) {
        let state = Arc::new(StateManager::new());
        for (contract, size) in sizes {
            state.apply_position(position(contract, *size));
        }
        let actions = Arc::new(EnforcementActions::new(
            crate::testing::dry_run_rest_client(),
            state.clone(),
            None,
        ));
        let rule = MaxContractsRule::new(
            MaxContractsConfig {
                enabled: true,
                limit,
            },
            state.clone(),
            actions,
        );
        (state, rule)
    }

    #[tokio::test]
    async fn test_at_limit_is_not_a_breach() {
        let (_, rule) = rule_with(
            5,
            &[("CON.F.US.MNQ.U25", 3), ("CON.F.US.ES.U25", 2)],
        );
        assert!(rule
            .on_position(&position("CON.F.US.ES.U25", 2))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_over_limit_breaches_terminally() {
        let (_, rule) = rule_with(
            5,
            &[("CON.F.US.MNQ.U25", 4), ("CON.F.US.ES.U25", 2)],
        );
        let breach = rule
            .on_position(&position("CON.F.US.ES.U25", 2))
            .await
            .unwrap();
        assert!(breach.is_terminal());
        assert_eq!(breach.action, BreachAction::CloseAll);
        assert_eq!(breach.observed_metrics["total_contracts"], 6);
        assert_eq!(breach.observed_metrics["limit"], 5);
    }

    #[tokio::test]
    async fn test_enforce_closes_every_position_without_lockout() {
        let (state, rule) = rule_with(
            5,
            &[("CON.F.US.MNQ.U25", 4), ("CON.F.US.ES.U25", 2)],
        );
        let breach = rule
            .on_position(&position("CON.F.US.ES.U25", 2))
            .await
            .unwrap();

        assert!(rule.enforce(1, &breach).await);
        assert!(state.open_positions(1).is_empty());
    }

    #[tokio::test]
    async fn test_count_spans_all_contracts() {
        // A single-contract account under the limit stays quiet even when
        // one position alone is large.
        let (_, rule) = rule_with(5, &[("CON.F.US.MNQ.U25", 5)]);
        assert!(rule
            .on_position(&position("CON.F.US.MNQ.U25", 5))
            .await
            .is_none());
    }
}
