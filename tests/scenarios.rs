//! End-to-end scenarios: gateway events in, enforcement out.
//!
//! The REST side runs against an in-process HTTP stub (auth + search
//! endpoints; mutations run in dry-run mode), the push side against a
//! scripted in-memory transport. Scenarios follow the daemon's real
//! wiring: stream signal → router → rules → enforcement → store.

use chrono::Utc;
use riskwarden::api::{
    ErrorHistory, GatewayAuthenticator, RateLimiter, RestClient, RestConfig, RetryPolicy,
    TokenManager, TokenManagerConfig,
};
use riskwarden::config::{
    DailyRealizedLossConfig, MaxContractsConfig, RulesConfig, StopLossGraceConfig, StreamConfig,
    SymbolBlocksConfig, TradeManagementConfig, TrailingStopConfig,
};
use riskwarden::core::{
    ContractCache, LockoutManager, PnlTracker, QuoteTracker, SessionClock, StateManager,
    TimerManager, TradeCounter,
};
use riskwarden::enforcement::EnforcementActions;
use riskwarden::models::{Contract, LockoutKind};
use riskwarden::persistence::Store;
use riskwarden::router::{EventRouter, RouterDeps};
use riskwarden::rules::*;
use riskwarden::stream::{
    GatewayEvent, StreamConnection, StreamManager, StreamSignal, StreamTransport, Subscription,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

const ACCOUNT: i64 = 12345;
const MNQ: &str = "CON.F.US.MNQ.U25";
const ES: &str = "CON.F.US.ES.U25";
const BTC: &str = "CON.F.US.BTC.U25";

// ---------------------------------------------------------------------------
// In-process gateway REST stub
// ---------------------------------------------------------------------------

/// Minimal HTTP/1.1 responder: fixed JSON body per path.
async fn spawn_gateway_stub(routes: HashMap<String, serde_json::Value>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    // Read one request (headers + content-length body).
                    let mut chunk = [0u8; 4096];
                    let header_end = loop {
                        if let Some(pos) = find_header_end(&buf) {
                            break pos;
                        }
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    let total = header_end + 4 + content_length;
                    while buf.len() < total {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let path = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    buf.drain(..total);

                    let (status, body) = match routes.get(&path) {
                        Some(body) => ("200 OK", body.to_string()),
                        None => ("404 Not Found", "{\"success\":false}".to_string()),
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    if socket.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("http://{addr}")
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn auth_route() -> (String, serde_json::Value) {
    (
        "/api/Auth/loginKey".to_string(),
        serde_json::json!({ "token": "stub-session-token", "success": true }),
    )
}

// ---------------------------------------------------------------------------
// Shared fixture
// ---------------------------------------------------------------------------

struct Harness {
    router: Arc<EventRouter>,
    state: Arc<StateManager>,
    pnl: Arc<PnlTracker>,
    lockouts: Arc<LockoutManager>,
    store: Store,
    clock: SessionClock,
    tokens: Arc<TokenManager>,
}

fn mnq_contract() -> Contract {
    Contract {
        contract_id: MNQ.to_string(),
        name: "MNQ".to_string(),
        symbol: "F.US.MNQ".to_string(),
        tick_size: 0.25,
        tick_value: 0.5,
        contract_size: 1,
        active_contract: true,
    }
}

fn es_contract() -> Contract {
    Contract {
        contract_id: ES.to_string(),
        name: "ES".to_string(),
        symbol: "F.US.ES".to_string(),
        tick_size: 0.25,
        tick_value: 12.5,
        contract_size: 1,
        active_contract: true,
    }
}

async fn harness(rules_config: RulesConfig, extra_routes: Vec<(String, serde_json::Value)>) -> Harness {
    let mut routes: HashMap<String, serde_json::Value> = HashMap::new();
    let (auth_path, auth_body) = auth_route();
    routes.insert(auth_path, auth_body);
    routes.insert(
        "/api/Position/searchOpen".to_string(),
        serde_json::json!({ "positions": [] }),
    );
    for (path, body) in extra_routes {
        routes.insert(path, body);
    }
    let base_url = spawn_gateway_stub(routes).await;

    let rest_config = RestConfig {
        base_url,
        username: "trader".to_string(),
        api_key: "key".to_string(),
        request_timeout: Duration::from_secs(5),
        dry_run: true,
    };
    let authenticator = Arc::new(GatewayAuthenticator::new(&rest_config).unwrap());
    let tokens = Arc::new(TokenManager::new(
        authenticator,
        None,
        TokenManagerConfig::default(),
    ));
    let rest = Arc::new(
        RestClient::new(
            &rest_config,
            Arc::new(RateLimiter::default()),
            tokens.clone(),
            RetryPolicy::default(),
            Arc::new(ErrorHistory::default()),
        )
        .unwrap(),
    );

    let store = Store::open_in_memory().unwrap();
    let clock = SessionClock::from_config("17:00", "America/New_York").unwrap();
    let state = Arc::new(StateManager::new());
    let quotes = Arc::new(QuoteTracker::new());
    let contracts = Arc::new(ContractCache::new());
    contracts.insert(mnq_contract());
    contracts.insert(es_contract());
    let pnl = Arc::new(PnlTracker::new(
        state.clone(),
        quotes.clone(),
        contracts.clone(),
        Some(store.clone()),
        clock,
    ));
    let counter = Arc::new(TradeCounter::new());
    let lockouts = Arc::new(LockoutManager::new(Some(store.clone())));
    let timers = TimerManager::new();
    let actions = Arc::new(EnforcementActions::new(
        rest.clone(),
        state.clone(),
        Some(store.clone()),
    ));

    let session_rule = Arc::new(
        SessionHoursRule::new(
            rules_config.session_hours.clone(),
            actions.clone(),
            lockouts.clone(),
            timers.clone(),
        )
        .unwrap(),
    );
    let rules: Vec<Arc<dyn RiskRule>> = vec![
        Arc::new(MaxContractsRule::new(
            rules_config.max_contracts.clone(),
            state.clone(),
            actions.clone(),
        )),
        Arc::new(MaxContractsPerInstrumentRule::new(
            rules_config.max_contracts_per_instrument.clone(),
            state.clone(),
            actions.clone(),
        )),
        Arc::new(DailyRealizedLossRule::new(
            rules_config.daily_realized_loss.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(DailyUnrealizedLossRule::new(
            rules_config.daily_unrealized_loss.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(MaxUnrealizedProfitRule::new(
            rules_config.max_unrealized_profit.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(TradeFrequencyRule::new(
            rules_config.trade_frequency.clone(),
            counter.clone(),
            lockouts.clone(),
        )),
        Arc::new(StopLossGraceRule::new(
            rules_config.stop_loss_grace.clone(),
            state.clone(),
            actions.clone(),
            lockouts.clone(),
            timers.clone(),
        )),
        session_rule,
        Arc::new(AuthLossGuardRule::new(
            rules_config.auth_loss_guard.clone(),
            actions.clone(),
            lockouts.clone(),
        )),
        Arc::new(SymbolBlocksRule::new(
            rules_config.symbol_blocks.clone(),
            actions.clone(),
            lockouts.clone(),
        )),
        Arc::new(TradeManagementRule::new(
            rules_config.trade_management.clone(),
            state.clone(),
            contracts.clone(),
            actions.clone(),
        )),
    ];

    let router = Arc::new(EventRouter::new(RouterDeps {
        accounts: vec![ACCOUNT],
        rules,
        state: state.clone(),
        quotes,
        contracts,
        pnl: pnl.clone(),
        counter,
        lockouts: lockouts.clone(),
        rest: rest.clone(),
        actions,
        store: Some(store.clone()),
    }));

    Harness {
        router,
        state,
        pnl,
        lockouts,
        store,
        clock,
        tokens,
    }
}

fn trade_event(trade_id: i64, pnl: Option<f64>) -> GatewayEvent {
    serde_json::from_value(serde_json::json!({
        "type": "GatewayUserTrade",
        "data": {
            "id": trade_id,
            "orderId": 9000 + trade_id,
            "accountId": ACCOUNT,
            "contractId": MNQ,
            "creationTimestamp": Utc::now().to_rfc3339(),
            "price": 21000.0,
            "profitAndLoss": pnl,
            "fees": 0.37,
            "side": 1,
            "size": 1,
            "voided": false
        }
    }))
    .unwrap()
}

fn position_event(contract_id: &str, size: i64, price: f64) -> GatewayEvent {
    serde_json::from_value(serde_json::json!({
        "type": "GatewayUserPosition",
        "data": {
            "id": 1,
            "accountId": ACCOUNT,
            "contractId": contract_id,
            "creationTimestamp": Utc::now().to_rfc3339(),
            "type": 1,
            "size": size,
            "averagePrice": price
        }
    }))
    .unwrap()
}

fn quote_event(symbol: &str, price: f64) -> GatewayEvent {
    serde_json::from_value(serde_json::json!({
        "type": "GatewayQuote",
        "data": {
            "symbol": symbol,
            "lastPrice": price,
            "lastUpdated": Utc::now().to_rfc3339()
        }
    }))
    .unwrap()
}

fn order_event(order_id: i64, contract_id: &str) -> GatewayEvent {
    serde_json::from_value(serde_json::json!({
        "type": "GatewayUserOrder",
        "data": {
            "id": order_id,
            "accountId": ACCOUNT,
            "contractId": contract_id,
            "updateTimestamp": Utc::now().to_rfc3339(),
            "status": 1,
            "type": 1,
            "side": 0,
            "size": 1,
            "limitPrice": 20990.0
        }
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Daily realized loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn daily_loss_breach_flattens_and_locks_until_reset() {
    let harness = harness(
        RulesConfig {
            daily_realized_loss: DailyRealizedLossConfig {
                enabled: true,
                limit: -500.0,
                lockout_until_reset: true,
            },
            ..RulesConfig::default()
        },
        vec![],
    )
    .await;

    harness.pnl.preload_daily(ACCOUNT, -450.0);
    harness.router.handle_event(trade_event(1, Some(-75.5))).await;

    assert!((harness.pnl.daily_realized(ACCOUNT) + 525.5).abs() < 1e-9);
    let lockout = harness.lockouts.active_lockout(ACCOUNT).expect("lockout set");
    assert_eq!(lockout.kind, LockoutKind::Account);
    assert_eq!(
        lockout.until.unwrap(),
        harness.clock.next_reset(Utc::now())
    );

    let entries = harness.store.recent_enforcements(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].rule_id, "RULE-003");
    assert_eq!(entries[0].action, "CLOSE_ALL_AND_LOCKOUT");

    // A subsequent order event is bookkept but produces no enforcement.
    harness.router.handle_event(order_event(500, MNQ)).await;
    let entries = harness.store.recent_enforcements(10).await.unwrap();
    assert_eq!(entries.len(), 1);
}

// ---------------------------------------------------------------------------
// Account-wide contract cap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn contract_cap_breach_closes_everything_without_lockout() {
    let harness = harness(
        RulesConfig {
            max_contracts: MaxContractsConfig {
                enabled: true,
                limit: 5,
            },
            ..RulesConfig::default()
        },
        vec![],
    )
    .await;

    harness.router.handle_event(position_event(MNQ, 4, 21000.0)).await;
    assert_eq!(harness.state.total_contract_count(ACCOUNT), 4);

    harness.router.handle_event(position_event(ES, 2, 5400.0)).await;

    // Both positions closed (via dry-run close), no lockout.
    assert!(harness.state.open_positions(ACCOUNT).is_empty());
    assert!(!harness.lockouts.is_locked_out(ACCOUNT));

    let entries = harness.store.recent_enforcements(10).await.unwrap();
    assert_eq!(entries[0].rule_id, "RULE-001");
    assert_eq!(entries[0].action, "CLOSE_ALL");
}

// ---------------------------------------------------------------------------
// Symbol blacklist
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocked_symbol_position_closed_and_symbol_locked() {
    let harness = harness(
        RulesConfig {
            symbol_blocks: SymbolBlocksConfig {
                enabled: true,
                blocked_symbols: vec!["BTC".to_string(), "ETH".to_string(), "GC".to_string()],
            },
            ..RulesConfig::default()
        },
        vec![(
            "/api/Contract/searchById".to_string(),
            serde_json::json!({
                "contract": {
                    "id": BTC,
                    "name": "BTC",
                    "symbolId": "F.US.BTC",
                    "tickSize": 5.0,
                    "tickValue": 5.0
                }
            }),
        )],
    )
    .await;

    harness.router.handle_event(position_event(BTC, 1, 65000.0)).await;

    assert!(harness.state.open_positions(ACCOUNT).is_empty());
    assert!(harness.lockouts.is_symbol_locked(ACCOUNT, "BTC"));
    let symbol_lockouts = harness.lockouts.symbol_lockouts(ACCOUNT);
    assert_eq!(symbol_lockouts.len(), 1);
    assert!(symbol_lockouts[0].until.is_none(), "permanent lockout");
    // The account itself is not locked.
    assert!(!harness.lockouts.is_locked_out(ACCOUNT));
}

// ---------------------------------------------------------------------------
// Stop-loss grace period
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unprotected_position_grace_expiry_flattens_and_locks() {
    let harness = harness(
        RulesConfig {
            stop_loss_grace: StopLossGraceConfig {
                enabled: true,
                grace_period_seconds: 30,
                lockout_duration_seconds: 3600,
            },
            ..RulesConfig::default()
        },
        vec![],
    )
    .await;

    harness.router.handle_event(position_event(MNQ, 2, 21000.0)).await;
    assert!(!harness.lockouts.is_locked_out(ACCOUNT));

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }

    assert!(harness.state.open_positions(ACCOUNT).is_empty());
    let lockout = harness.lockouts.active_lockout(ACCOUNT).expect("lockout set");
    let until = lockout.until.unwrap();
    let expected = Utc::now() + chrono::Duration::seconds(3600);
    assert!((until - expected).num_seconds().abs() <= 35);

    let entries = harness.store.recent_enforcements(10).await.unwrap();
    assert_eq!(entries[0].rule_id, "RULE-008");
    assert_eq!(entries[0].action, "CLOSE_ALL_AND_LOCKOUT");
}

// ---------------------------------------------------------------------------
// Trailing stop management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trailing_stop_advances_on_favourable_quotes() {
    let harness = harness(
        RulesConfig {
            trade_management: TradeManagementConfig {
                enabled: true,
                trailing_stop: TrailingStopConfig {
                    enabled: true,
                    activation_ticks: 0.0,
                    trail_distance_ticks: 10.0,
                },
                ..TradeManagementConfig::default()
            },
            ..RulesConfig::default()
        },
        vec![],
    )
    .await;

    harness.router.handle_event(position_event(MNQ, 2, 21000.0)).await;
    harness.router.handle_event(quote_event("F.US.MNQ", 21005.0)).await;
    harness.router.handle_event(quote_event("F.US.MNQ", 21010.0)).await;

    let entries = harness.store.recent_enforcements(10).await.unwrap();
    assert_eq!(entries.len(), 2);
    // Most recent first: 21002.50 → 21007.50 on the second quote.
    assert_eq!(entries[0].action, "UPDATE_TRAILING_STOP");
    assert_eq!(entries[0].observed_metrics["metrics"]["new_stop"], 21007.5);
    assert_eq!(entries[0].observed_metrics["metrics"]["old_stop"], 21002.5);
    assert_eq!(entries[1].observed_metrics["metrics"]["new_stop"], 21002.5);
}

// ---------------------------------------------------------------------------
// Reconnect, resubscribe, reconcile, dedup
// ---------------------------------------------------------------------------

struct FakeHubInner {
    connections: usize,
    subscriptions: Vec<(usize, Subscription)>,
    current_tx: Option<mpsc::UnboundedSender<GatewayEvent>>,
}

struct FakeHub {
    inner: parking_lot::Mutex<FakeHubInner>,
}

impl FakeHub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(FakeHubInner {
                connections: 0,
                subscriptions: Vec::new(),
                current_tx: None,
            }),
        })
    }

    fn drop_connection(&self) {
        self.inner.lock().current_tx = None;
    }

    fn send(&self, event: GatewayEvent) {
        if let Some(tx) = &self.inner.lock().current_tx {
            let _ = tx.send(event);
        }
    }

    fn connection_count(&self) -> usize {
        self.inner.lock().connections
    }

    fn subscriptions_for(&self, connection: usize) -> Vec<Subscription> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

struct FakeTransport(Arc<FakeHub>);

struct FakeConnection {
    hub: Arc<FakeHub>,
    index: usize,
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

#[async_trait::async_trait]
impl StreamTransport for FakeTransport {
    async fn connect(
        &self,
        _url: &str,
        _token: &str,
    ) -> Result<Box<dyn StreamConnection>, riskwarden::api::ApiError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut inner = self.0.inner.lock();
            inner.connections += 1;
            inner.current_tx = Some(tx);
            inner.connections
        };
        Ok(Box::new(FakeConnection {
            hub: self.0.clone(),
            index,
            rx,
        }))
    }
}

#[async_trait::async_trait]
impl StreamConnection for FakeConnection {
    async fn subscribe(
        &mut self,
        subscription: &Subscription,
    ) -> Result<(), riskwarden::api::ApiError> {
        self.hub
            .inner
            .lock()
            .subscriptions
            .push((self.index, subscription.clone()));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    async fn ping(&mut self) -> Result<Duration, riskwarden::api::ApiError> {
        Ok(Duration::from_millis(1))
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn reconnect_replays_subscriptions_reconciles_and_dedups() {
    let harness = harness(
        RulesConfig::default(),
        vec![(
            "/api/Position/searchOpen".to_string(),
            serde_json::json!({
                "positions": [{
                    "id": 7,
                    "accountId": ACCOUNT,
                    "contractId": MNQ,
                    "type": 1,
                    "size": 3,
                    "averagePrice": 21000.0
                }]
            }),
        )],
    )
    .await;

    let hub = FakeHub::new();
    let (signal_tx, mut signal_rx) = mpsc::channel::<StreamSignal>(256);
    let manager = StreamManager::spawn(
        "user",
        "fake://hub".to_string(),
        StreamConfig::default(),
        Arc::new(FakeTransport(hub.clone())),
        harness.tokens.clone(),
        signal_tx,
    );

    manager.subscribe(Subscription::SubscribeTrades { account_id: ACCOUNT });
    manager.subscribe(Subscription::SubscribePositions { account_id: ACCOUNT });
    manager.subscribe(Subscription::SubscribeOrders { account_id: ACCOUNT });
    manager.subscribe(Subscription::SubscribeContractQuotes {
        contract_id: MNQ.to_string(),
    });

    // Drive router from the stream signals in the background.
    let router = harness.router.clone();
    let pump = tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            router.handle_signal(signal).await;
        }
    });

    // Wait for the first connection and its subscription replay.
    for _ in 0..100 {
        if hub.connection_count() >= 1 && hub.subscriptions_for(1).len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // One trade arrives before the disconnect.
    hub.send(serde_json::from_value(serde_json::json!({
        "type": "GatewayUserTrade",
        "data": {
            "id": 55, "orderId": 9001, "accountId": ACCOUNT, "contractId": MNQ,
            "price": 21000.0, "profitAndLoss": -75.5, "fees": 0.37,
            "side": 1, "size": 1, "voided": false
        }
    })).unwrap());

    // Force an unintentional disconnect; the manager reconnects with a
    // 0s then 2s ladder, so the second connection appears quickly.
    hub.drop_connection();
    for _ in 0..200 {
        if hub.connection_count() >= 2 && hub.subscriptions_for(2).len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // All four subscriptions replayed in the original order.
    let replayed = hub.subscriptions_for(2);
    assert_eq!(replayed.len(), 4);
    assert_eq!(
        replayed,
        vec![
            Subscription::SubscribeTrades { account_id: ACCOUNT },
            Subscription::SubscribePositions { account_id: ACCOUNT },
            Subscription::SubscribeOrders { account_id: ACCOUNT },
            Subscription::SubscribeContractQuotes {
                contract_id: MNQ.to_string()
            },
        ]
    );

    // The stream replays the same trade after reconnect; dedup by id
    // keeps the daily P&L single-counted.
    hub.send(serde_json::from_value(serde_json::json!({
        "type": "GatewayUserTrade",
        "data": {
            "id": 55, "orderId": 9001, "accountId": ACCOUNT, "contractId": MNQ,
            "price": 21000.0, "profitAndLoss": -75.5, "fees": 0.37,
            "side": 1, "size": 1, "voided": false
        }
    })).unwrap());

    // Give the pump time to process the trade, its replay, and the
    // reconciliations.
    for _ in 0..200 {
        let pnl_done = (harness.pnl.daily_realized(ACCOUNT) + 75.5).abs() < 1e-9;
        if pnl_done && !harness.state.open_positions(ACCOUNT).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Reconciliation synced positions to REST truth.
    let positions = harness.state.open_positions(ACCOUNT);
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].contract_id, MNQ);
    assert_eq!(positions[0].size, 3);

    // Trade counted exactly once.
    assert!((harness.pnl.daily_realized(ACCOUNT) + 75.5).abs() < 1e-9);

    manager.shutdown().await;
    pump.abort();
}
