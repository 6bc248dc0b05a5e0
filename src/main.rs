//! Daemon entry point: configuration, startup sequence, shutdown.
//!
//! Startup: config → logging → persistence → token store → REST auth →
//! core services → rules → streams → subscriptions → recovery (P&L,
//! lockouts) → reconciliation → running. Exit codes: 0 normal, 1 startup
//! failure, 2 auth failure, 3 persistence corruption.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use riskwarden::api::{
    ApiError, ErrorHistory, GatewayAuthenticator, RateLimiter, RestClient, RestConfig,
    RetryPolicy, TokenManager, TokenManagerConfig, TokenStore, TokenStoreError,
};
use riskwarden::config::Config;
use riskwarden::core::{
    ContractCache, LockoutManager, PnlTracker, QuoteTracker, SessionClock, StateManager,
    TimerManager, TradeCounter,
};
use riskwarden::enforcement::EnforcementActions;
use riskwarden::persistence::Store;
use riskwarden::router::{EventRouter, RouterDeps};
use riskwarden::rules::{
    AuthLossGuardRule, DailyRealizedLossRule, DailyUnrealizedLossRule, MaxContractsPerInstrumentRule,
    MaxContractsRule, MaxUnrealizedProfitRule, RiskRule, SessionHoursRule, StopLossGraceRule,
    SymbolBlocksRule, TradeFrequencyRule, TradeManagementRule,
};
use riskwarden::stream::{StreamManager, StreamSignal, Subscription, WebSocketTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "riskwarden", about = "Real-time trading risk enforcement daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Directory for rotating log files (defaults to <data_dir>/logs).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Evaluate rules but never send mutating REST calls.
    #[arg(long)]
    dry_run: bool,

    /// Monitor only this account, overriding the configured list.
    #[arg(long)]
    single_account: Option<i64>,

    /// Force a daily P&L / session reset at startup (testing aid).
    #[arg(long)]
    reset_now: bool,
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<TokenStoreError>() {
            if matches!(store_err, TokenStoreError::Corrupt) {
                return 3;
            }
        }
        if let Some(api_err) = cause.downcast_ref::<ApiError>() {
            if matches!(api_err, ApiError::Authentication(_)) {
                return 2;
            }
        }
        if cause.to_string().contains("schema version") {
            return 3;
        }
    }
    1
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            error!(error = ?err, "daemon failed");
            eprintln!("riskwarden: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(&cli.config)?;
    if let Some(account) = cli.single_account {
        config.accounts = vec![account];
    }
    anyhow::ensure!(
        !config.accounts.is_empty(),
        "no accounts configured (set accounts = [...] or pass --single-account)"
    );

    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config.data_dir.join("logs"));
    let _log_guards = riskwarden::logging::init(Some(&log_dir))?;
    info!(
        accounts = ?config.accounts,
        dry_run = cli.dry_run,
        data_dir = %config.data_dir.display(),
        "riskwarden starting"
    );

    // Persistence first: schema mismatch must stop the daemon before any
    // enforcement state is touched.
    let store = Store::open(&config.data_dir.join("riskwarden.db"))?;

    // Encrypted token recovery. A corrupt blob is quarantined (removed)
    // and the daemon refuses to start.
    let token_store = Arc::new(TokenStore::new(
        config.data_dir.join("tokens.enc"),
        config.token.memory_only,
    )?);
    let recovered = token_store
        .load()
        .context("stored token failed integrity check")?;

    let rest_config = RestConfig {
        base_url: config.gateway.base_url.clone(),
        username: config.gateway.resolved_username()?,
        api_key: config.gateway.resolved_api_key()?,
        request_timeout: RestConfig::request_timeout_from_env(),
        dry_run: cli.dry_run,
    };
    let authenticator = Arc::new(GatewayAuthenticator::new(&rest_config)?);
    let tokens = Arc::new(TokenManager::new(
        authenticator,
        Some(token_store.clone()),
        TokenManagerConfig {
            refresh_buffer: Duration::from_secs(config.token.refresh_buffer_seconds),
            max_refresh_retries: config.token.max_retries,
            max_queue_depth: config.token.max_queue_depth,
            ..TokenManagerConfig::default()
        },
    ));
    if let Some((token, expires_at)) = recovered {
        tokens.seed(token, expires_at);
    }

    let rate_limiter = Arc::new(RateLimiter::new(
        riskwarden::api::RateLimiterConfig::from_env(),
    ));
    let errors = Arc::new(ErrorHistory::default());
    let rest = Arc::new(RestClient::new(
        &rest_config,
        rate_limiter,
        tokens.clone(),
        RetryPolicy::from_env(),
        errors,
    )?);
    rest.authenticate()
        .await
        .context("initial gateway authentication failed")?;

    // Core shared services.
    let clock = SessionClock::from_config(&config.daily.reset_time, &config.daily.timezone)?;
    let state = Arc::new(StateManager::new());
    let quotes = Arc::new(QuoteTracker::new());
    let contracts = Arc::new(ContractCache::new());
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

    // Recovery: current session P&L and live lockouts.
    let now = Utc::now();
    for (account_id, realized) in store.load_daily_pnl(clock.session_date(now)).await? {
        if config.accounts.contains(&account_id) {
            pnl.preload_daily(account_id, realized);
        }
    }
    lockouts.preload(store.load_lockouts(now).await?);

    if cli.reset_now {
        warn!("--reset-now: forcing daily reset for all monitored accounts");
        for &account_id in &config.accounts {
            pnl.reset_daily(account_id).await;
            counter.reset_session(account_id, now);
        }
    }

    // Rule set in evaluation order.
    let session_rule = Arc::new(SessionHoursRule::new(
        config.rules.session_hours.clone(),
        actions.clone(),
        lockouts.clone(),
        timers.clone(),
    )?);
    let rules: Vec<Arc<dyn RiskRule>> = vec![
        Arc::new(MaxContractsRule::new(
            config.rules.max_contracts.clone(),
            state.clone(),
            actions.clone(),
        )),
        Arc::new(MaxContractsPerInstrumentRule::new(
            config.rules.max_contracts_per_instrument.clone(),
            state.clone(),
            actions.clone(),
        )),
        Arc::new(DailyRealizedLossRule::new(
            config.rules.daily_realized_loss.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(DailyUnrealizedLossRule::new(
            config.rules.daily_unrealized_loss.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(MaxUnrealizedProfitRule::new(
            config.rules.max_unrealized_profit.clone(),
            pnl.clone(),
            actions.clone(),
            lockouts.clone(),
            clock,
        )),
        Arc::new(TradeFrequencyRule::new(
            config.rules.trade_frequency.clone(),
            counter.clone(),
            lockouts.clone(),
        )),
        Arc::new(StopLossGraceRule::new(
            config.rules.stop_loss_grace.clone(),
            state.clone(),
            actions.clone(),
            lockouts.clone(),
            timers.clone(),
        )),
        session_rule.clone(),
        Arc::new(AuthLossGuardRule::new(
            config.rules.auth_loss_guard.clone(),
            actions.clone(),
            lockouts.clone(),
        )),
        Arc::new(SymbolBlocksRule::new(
            config.rules.symbol_blocks.clone(),
            actions.clone(),
            lockouts.clone(),
        )),
        Arc::new(TradeManagementRule::new(
            config.rules.trade_management.clone(),
            state.clone(),
            contracts.clone(),
            actions.clone(),
        )),
    ];

    let router = Arc::new(EventRouter::new(RouterDeps {
        accounts: config.accounts.clone(),
        rules,
        state: state.clone(),
        quotes,
        contracts,
        pnl: pnl.clone(),
        counter: counter.clone(),
        lockouts,
        rest: rest.clone(),
        actions,
        store: Some(store.clone()),
    }));

    // Push streams: user hub (trades/positions/orders/accounts) and
    // market hub (quotes), both feeding the router's single channel.
    let (signal_tx, signal_rx) = mpsc::channel::<StreamSignal>(4096);
    let transport = Arc::new(WebSocketTransport);
    let user_stream = StreamManager::spawn(
        "user",
        config.gateway.user_hub_url.clone(),
        config.stream.clone(),
        transport.clone(),
        tokens.clone(),
        signal_tx.clone(),
    );
    let market_stream = StreamManager::spawn(
        "market",
        config.gateway.market_hub_url.clone(),
        config.stream.clone(),
        transport,
        tokens,
        signal_tx,
    );
    router.attach_market_stream(market_stream.clone());

    for &account_id in &config.accounts {
        user_stream.subscribe(Subscription::SubscribeTrades { account_id });
        user_stream.subscribe(Subscription::SubscribePositions { account_id });
        user_stream.subscribe(Subscription::SubscribeOrders { account_id });
    }

    // Startup reconciliation against REST truth, then quote flow for any
    // recovered positions.
    router
        .reconcile_state()
        .await
        .context("startup position reconciliation failed")?;
    for &account_id in &config.accounts {
        for position in state.open_positions(account_id) {
            market_stream.subscribe(Subscription::SubscribeContractQuotes {
                contract_id: position.contract_id,
            });
        }
    }

    // Timed housekeeping: daily resets and session-end auto-close.
    for &account_id in &config.accounts {
        schedule_daily_reset(&timers, clock, pnl.clone(), counter.clone(), account_id);
        session_rule.clone().schedule_auto_close(account_id);
    }

    let router_task = tokio::spawn(router.clone().run(signal_rx));
    info!("riskwarden running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    // Intentional stream stop (no reconnection), drop timers, abandon
    // in-flight work. Daily resets are re-derived on the next start.
    user_stream.shutdown().await;
    market_stream.shutdown().await;
    timers.cancel_all();
    router_task.abort();
    info!("riskwarden stopped");
    Ok(())
}

/// Re-arm the per-account daily reset at every boundary.
fn schedule_daily_reset(
    timers: &Arc<TimerManager>,
    clock: SessionClock,
    pnl: Arc<PnlTracker>,
    counter: Arc<TradeCounter>,
    account_id: i64,
) {
    let fires_at = clock.next_reset(Utc::now());
    let timers_again = timers.clone();
    timers.schedule(format!("daily_reset:{account_id}"), fires_at, async move {
        info!(account_id, "daily reset boundary reached");
        pnl.reset_daily(account_id).await;
        counter.reset_session(account_id, Utc::now());
        schedule_daily_reset(&timers_again, clock, pnl.clone(), counter.clone(), account_id);
    });
}
