//! Event router: the single ingress for both hubs.
//!
//! Per event: convert, de-duplicate, mutate shared state, then run the
//! rule set in fixed order (001, 002, 003, 004, 005, 006, 008, 009, 010,
//! 011, 012). The first terminal breach for an event wins and suppresses
//! the remaining rules; non-terminal actions compose. While an account is
//! locked out only RULE-010 (restoration path) still runs, although state
//! bookkeeping always proceeds.
//!
//! Events are processed strictly in receive order; an event's enforcement
//! completes before the next event is picked up, so later events observe
//! the lockouts earlier ones installed.

use crate::api::RestClient;
use crate::core::{
    ContractCache, LockoutManager, PnlTracker, QuoteTracker, StateManager, TradeCounter,
};
use crate::enforcement::EnforcementActions;
use crate::models::{Account, Order, Position, Quote, Trade};
use crate::rules::{AuthLossGuardRule, Breach, RiskRule};
use crate::stream::{GatewayEvent, StreamManager, StreamSignal, Subscription};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SEEN_CAPACITY: usize = 10_000;

/// Bounded insertion-ordered seen-set for stream replay de-duplication.
struct SeenSet<T: std::hash::Hash + Eq + Clone> {
    set: HashSet<T>,
    order: VecDeque<T>,
}

impl<T: std::hash::Hash + Eq + Clone> SeenSet<T> {
    fn new() -> Self {
        Self {
            set: HashSet::with_capacity(SEEN_CAPACITY),
            order: VecDeque::with_capacity(SEEN_CAPACITY),
        }
    }

    /// Returns false when the key was already present.
    fn insert(&mut self, key: T) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Clone, Copy)]
enum EventRef<'e> {
    Trade(&'e Trade),
    Order(&'e Order),
    Position(&'e Position),
    Quote(i64, &'e Quote),
}

pub struct EventRouter {
    accounts: Vec<i64>,
    rules: Vec<Arc<dyn RiskRule>>,
    state: Arc<StateManager>,
    quotes: Arc<QuoteTracker>,
    contracts: Arc<ContractCache>,
    pnl: Arc<PnlTracker>,
    counter: Arc<TradeCounter>,
    lockouts: Arc<LockoutManager>,
    rest: Arc<RestClient>,
    actions: Arc<EnforcementActions>,
    store: Option<crate::persistence::Store>,
    /// Market hub handle for on-demand quote subscriptions.
    market: Mutex<Option<Arc<StreamManager>>>,
    seen_trades: Mutex<SeenSet<i64>>,
    seen_orders: Mutex<SeenSet<(i64, i64)>>,
}

pub struct RouterDeps {
    pub accounts: Vec<i64>,
    pub rules: Vec<Arc<dyn RiskRule>>,
    pub state: Arc<StateManager>,
    pub quotes: Arc<QuoteTracker>,
    pub contracts: Arc<ContractCache>,
    pub pnl: Arc<PnlTracker>,
    pub counter: Arc<TradeCounter>,
    pub lockouts: Arc<LockoutManager>,
    pub rest: Arc<RestClient>,
    pub actions: Arc<EnforcementActions>,
    pub store: Option<crate::persistence::Store>,
}

impl EventRouter {
    pub fn new(deps: RouterDeps) -> Self {
        Self {
            accounts: deps.accounts,
            rules: deps.rules,
            state: deps.state,
            quotes: deps.quotes,
            contracts: deps.contracts,
            pnl: deps.pnl,
            counter: deps.counter,
            lockouts: deps.lockouts,
            rest: deps.rest,
            actions: deps.actions,
            store: deps.store,
            market: Mutex::new(None),
            seen_trades: Mutex::new(SeenSet::new()),
            seen_orders: Mutex::new(SeenSet::new()),
        }
    }

    pub fn attach_market_stream(&self, market: Arc<StreamManager>) {
        *self.market.lock() = Some(market);
    }

    pub fn monitors(&self, account_id: i64) -> bool {
        self.accounts.contains(&account_id)
    }

    /// Consume stream signals until every sender is gone.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<StreamSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle_signal(signal).await;
        }
        info!("event router stopped");
    }

    pub async fn handle_signal(&self, signal: StreamSignal) {
        match signal {
            StreamSignal::Event(event) => self.handle_event(event).await,
            StreamSignal::Reconnected => {
                if let Err(err) = self.reconcile_state().await {
                    error!(error = %err, "post-reconnect reconciliation failed");
                }
            }
            StreamSignal::PermanentlyDisconnected => {
                error!("a stream is permanently disconnected; state may go stale");
            }
        }
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        match event {
            GatewayEvent::UserTrade(wire) => match wire.into_trade() {
                Ok(trade) => self.on_trade(trade, &correlation_id).await,
                Err(err) => warn!(correlation_id, error = %err, "dropping unparseable trade event"),
            },
            GatewayEvent::UserOrder(wire) => match wire.into_order() {
                Ok(order) => self.on_order(order, &correlation_id).await,
                Err(err) => warn!(correlation_id, error = %err, "dropping unparseable order event"),
            },
            GatewayEvent::UserPosition(wire) => match wire.into_position() {
                Ok(position) => self.on_position(position, &correlation_id).await,
                Err(err) => {
                    warn!(correlation_id, error = %err, "dropping unparseable position event")
                }
            },
            GatewayEvent::UserAccount(wire) => {
                self.on_account(wire.into(), &correlation_id).await
            }
            GatewayEvent::Quote(wire) => self.on_quote(wire.into(), &correlation_id).await,
        }
    }

    async fn on_trade(&self, trade: Trade, correlation_id: &str) {
        if !self.monitors(trade.account_id) {
            return;
        }
        if !self.seen_trades.lock().insert(trade.trade_id) {
            debug!(correlation_id, trade_id = trade.trade_id, "duplicate trade dropped");
            return;
        }
        if let Some(store) = &self.store {
            match store.has_trade(trade.trade_id).await {
                Ok(true) => {
                    debug!(
                        correlation_id,
                        trade_id = trade.trade_id,
                        "trade already persisted, dropping replay"
                    );
                    return;
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "trade dedup lookup failed"),
            }
            if let Err(err) = store.insert_trade(&trade).await {
                warn!(error = %err, "failed to persist trade");
            }
        }

        // State mutation before any rule reads.
        if !trade.voided {
            self.counter
                .record_trade(trade.account_id, trade.executed_at.unwrap_or_else(chrono::Utc::now));
            if let Some(pnl) = trade.realized_pnl {
                self.pnl.add_trade_pnl(trade.account_id, pnl).await;
            }
        } else {
            debug!(correlation_id, trade_id = trade.trade_id, "voided trade, state untouched");
            return;
        }

        if self.gate_locked(trade.account_id, correlation_id) {
            return;
        }
        self.run_rules(trade.account_id, correlation_id, EventRef::Trade(&trade))
            .await;
    }

    async fn on_order(&self, order: Order, correlation_id: &str) {
        if !self.monitors(order.account_id) {
            return;
        }
        if let Some(updated_at) = order.updated_at {
            let key = (order.order_id, updated_at.timestamp_millis());
            if !self.seen_orders.lock().insert(key) {
                debug!(correlation_id, order_id = order.order_id, "duplicate order event dropped");
                return;
            }
        }

        self.state.apply_order(order.clone());

        if self.gate_locked(order.account_id, correlation_id) {
            return;
        }
        self.run_rules(order.account_id, correlation_id, EventRef::Order(&order))
            .await;
    }

    async fn on_position(&self, position: Position, correlation_id: &str) {
        if !self.monitors(position.account_id) {
            return;
        }
        self.state.apply_position(position.clone());

        // First reference to a contract: cache its metadata and start
        // quote flow so P&L rules can price the position.
        if position.size > 0 {
            if let Err(err) = self
                .contracts
                .get_or_fetch(&self.rest, &position.contract_id)
                .await
            {
                warn!(
                    correlation_id,
                    contract_id = %position.contract_id,
                    error = %err,
                    "contract fetch failed, P&L rules will skip this position"
                );
            }
            if let Some(market) = self.market.lock().clone() {
                market.subscribe(Subscription::SubscribeContractQuotes {
                    contract_id: position.contract_id.clone(),
                });
            }
        }

        if self.gate_locked(position.account_id, correlation_id) {
            return;
        }
        self.run_rules(
            position.account_id,
            correlation_id,
            EventRef::Position(&position),
        )
        .await;
    }

    async fn on_account(&self, account: Account, correlation_id: &str) {
        if !self.monitors(account.account_id) {
            return;
        }
        self.state
            .set_can_trade(account.account_id, account.can_trade);

        // RULE-010 runs even while locked out (restoration path); the
        // other rules obey the gate.
        let locked = self.lockouts.is_locked_out(account.account_id);
        let account_ref = &account;
        for rule in &self.rules {
            if !rule.enabled() {
                continue;
            }
            if locked && rule.rule_id() != AuthLossGuardRule::RULE_ID {
                continue;
            }
            if let Some(breach) = rule.on_account(account_ref).await {
                let terminal = breach.is_terminal();
                self.execute(rule.as_ref(), account.account_id, &breach, correlation_id)
                    .await;
                if terminal {
                    break;
                }
            }
        }
    }

    async fn on_quote(&self, quote: Quote, correlation_id: &str) {
        self.quotes.on_quote(&quote);

        // Quote-driven rules are re-evaluated per monitored account.
        for &account_id in &self.accounts {
            if self.lockouts.is_locked_out(account_id) {
                continue;
            }
            self.run_rules(account_id, correlation_id, EventRef::Quote(account_id, &quote))
                .await;
        }
    }

    fn gate_locked(&self, account_id: i64, correlation_id: &str) -> bool {
        if self.lockouts.is_locked_out(account_id) {
            debug!(
                correlation_id,
                account_id, "account locked out, rule evaluation suppressed"
            );
            return true;
        }
        false
    }

    /// Run the rule set in order; first terminal breach wins.
    async fn run_rules(&self, account_id: i64, correlation_id: &str, event: EventRef<'_>) {
        for rule in &self.rules {
            if !rule.enabled() {
                continue;
            }
            let breach = match event {
                EventRef::Trade(trade) => rule.on_trade(trade).await,
                EventRef::Order(order) => rule.on_order(order).await,
                EventRef::Position(position) => rule.on_position(position).await,
                EventRef::Quote(account, quote) => rule.on_quote(account, quote).await,
            };
            if let Some(breach) = breach {
                let terminal = breach.is_terminal();
                self.execute(rule.as_ref(), account_id, &breach, correlation_id)
                    .await;
                if terminal {
                    debug!(
                        correlation_id,
                        rule_id = rule.rule_id(),
                        "terminal breach, suppressing remaining rules for this event"
                    );
                    break;
                }
            }
        }
    }

    async fn execute(
        &self,
        rule: &dyn RiskRule,
        account_id: i64,
        breach: &Breach,
        correlation_id: &str,
    ) {
        info!(
            correlation_id,
            account_id,
            rule_id = breach.rule_id,
            action = breach.action.name(),
            reason = %breach.reason,
            "rule breach, enforcing"
        );
        let ok = rule.enforce(account_id, breach).await;
        if !ok {
            // Partial failure still leaves the lockout in place (set in
            // the rule's enforce); log loudly and carry on.
            error!(
                correlation_id,
                account_id,
                rule_id = breach.rule_id,
                "enforcement reported partial or total failure"
            );
        }
        self.actions
            .log_enforcement(
                correlation_id,
                account_id,
                breach.rule_id,
                breach.action.name(),
                &breach.reason,
                serde_json::json!({
                    "metrics": breach.observed_metrics,
                    "success": ok,
                }),
            )
            .await;
    }

    /// Post-reconnect reconciliation: fetch brokerage truth and replace
    /// the in-memory position set. Trades and orders are re-delivered by
    /// the stream after resubscribe and de-duplicated on arrival.
    pub async fn reconcile_state(&self) -> anyhow::Result<()> {
        for &account_id in &self.accounts {
            let truth = self
                .rest
                .search_open_positions(account_id)
                .await
                .map_err(|err| anyhow::anyhow!("position search for {account_id}: {err}"))?;
            info!(
                account_id,
                positions = truth.len(),
                "reconciling positions against brokerage truth"
            );
            self.state.replace_positions(account_id, truth);
        }
        Ok(())
    }
}
