//! Daemon configuration: TOML file plus environment fallbacks.
//!
//! Credentials may live in the file or come from `RISKWARDEN_USERNAME` /
//! `RISKWARDEN_API_KEY` (dotenv is loaded before parsing). Every rule
//! block carries its own `enabled` flag; a missing block means the rule
//! runs with defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    /// Accounts to monitor. `--single-account` narrows this at startup.
    #[serde(default)]
    pub accounts: Vec<i64>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub daily: DailyConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub user_hub_url: String,
    pub market_hub_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl GatewayConfig {
    pub fn resolved_username(&self) -> Result<String> {
        self.username
            .clone()
            .or_else(|| std::env::var("RISKWARDEN_USERNAME").ok())
            .context("gateway username not configured (set gateway.username or RISKWARDEN_USERNAME)")
    }

    pub fn resolved_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("RISKWARDEN_API_KEY").ok())
            .context("gateway api key not configured (set gateway.api_key or RISKWARDEN_API_KEY)")
    }
}

/// Daily reset boundary, in the broker's timezone.
#[derive(Debug, Clone, Deserialize)]
pub struct DailyConfig {
    #[serde(default = "default_reset_time")]
    pub reset_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for DailyConfig {
    fn default() -> Self {
        Self {
            reset_time: default_reset_time(),
            timezone: default_timezone(),
        }
    }
}

fn default_reset_time() -> String {
    "17:00".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub memory_only: bool,
    pub refresh_buffer_seconds: u64,
    pub max_retries: u32,
    pub max_queue_depth: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            memory_only: false,
            refresh_buffer_seconds: 7200,
            max_retries: 4,
            max_queue_depth: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub retry_delays_secs: Vec<u64>,
    pub max_attempts: u32,
    pub max_reconnect_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub stale_threshold_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_delays_secs: vec![0, 2, 10, 30, 60],
            max_attempts: 10,
            max_reconnect_secs: 300,
            ping_interval_secs: 30,
            ping_timeout_secs: 5,
            stale_threshold_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub max_contracts: MaxContractsConfig,
    pub max_contracts_per_instrument: MaxContractsPerInstrumentConfig,
    pub daily_realized_loss: DailyRealizedLossConfig,
    pub daily_unrealized_loss: DailyUnrealizedLossConfig,
    pub max_unrealized_profit: MaxUnrealizedProfitConfig,
    pub trade_frequency: TradeFrequencyConfig,
    pub stop_loss_grace: StopLossGraceConfig,
    pub session_hours: SessionHoursConfig,
    pub auth_loss_guard: AuthLossGuardConfig,
    pub symbol_blocks: SymbolBlocksConfig,
    pub trade_management: TradeManagementConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxContractsConfig {
    pub enabled: bool,
    pub limit: i64,
}

impl Default for MaxContractsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentEnforcement {
    ReduceToLimit,
    CloseAll,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxContractsPerInstrumentConfig {
    pub enabled: bool,
    /// symbol root → max contracts
    pub limits: HashMap<String, i64>,
    pub enforcement: InstrumentEnforcement,
    /// "block", "allow_unlimited", or "allow_with_limit:N"
    pub unknown_symbol_action: String,
}

impl Default for MaxContractsPerInstrumentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limits: HashMap::new(),
            enforcement: InstrumentEnforcement::ReduceToLimit,
            unknown_symbol_action: "block".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownSymbolAction {
    Block,
    AllowWithLimit(i64),
    AllowUnlimited,
}

impl MaxContractsPerInstrumentConfig {
    pub fn unknown_symbol_policy(&self) -> UnknownSymbolAction {
        let raw = self.unknown_symbol_action.as_str();
        if raw == "allow_unlimited" {
            return UnknownSymbolAction::AllowUnlimited;
        }
        if let Some(limit) = raw.strip_prefix("allow_with_limit:") {
            if let Ok(limit) = limit.parse::<i64>() {
                return UnknownSymbolAction::AllowWithLimit(limit);
            }
        }
        UnknownSymbolAction::Block
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DailyRealizedLossConfig {
    pub enabled: bool,
    /// Negative threshold; breach when daily P&L drops strictly below it.
    pub limit: f64,
    pub lockout_until_reset: bool,
}

impl Default for DailyRealizedLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: -500.0,
            lockout_until_reset: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlScope {
    Total,
    PerPosition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DailyUnrealizedLossConfig {
    pub enabled: bool,
    /// Positive magnitude; breach at unrealized ≤ -loss_limit.
    pub loss_limit: f64,
    pub scope: PnlScope,
    pub lockout: bool,
}

impl Default for DailyUnrealizedLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            loss_limit: 300.0,
            scope: PnlScope::Total,
            lockout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitMode {
    ProfitTarget,
    Breakeven,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxUnrealizedProfitConfig {
    pub enabled: bool,
    pub mode: ProfitMode,
    pub profit_target: f64,
    pub scope: PnlScope,
    pub lockout: bool,
}

impl Default for MaxUnrealizedProfitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ProfitMode::ProfitTarget,
            profit_target: 1000.0,
            scope: PnlScope::Total,
            lockout: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradeFrequencyConfig {
    pub enabled: bool,
    pub per_minute: Option<usize>,
    pub per_hour: Option<usize>,
    pub per_session: Option<usize>,
    pub per_minute_cooldown_secs: u64,
    pub per_hour_cooldown_secs: u64,
    pub per_session_cooldown_secs: u64,
}

impl Default for TradeFrequencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_minute: None,
            per_hour: None,
            per_session: None,
            per_minute_cooldown_secs: 60,
            per_hour_cooldown_secs: 1800,
            per_session_cooldown_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopLossGraceConfig {
    pub enabled: bool,
    pub grace_period_seconds: u64,
    pub lockout_duration_seconds: u64,
}

impl Default for StopLossGraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_period_seconds: 30,
            lockout_duration_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionOverride {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionHoursConfig {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub timezone: String,
    pub per_instrument: HashMap<String, SessionOverride>,
    /// ISO dates ("2025-12-25") in the session timezone.
    pub holidays: Vec<String>,
    pub auto_close_at_end: bool,
}

impl Default for SessionHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "09:30".to_string(),
            end: "16:00".to_string(),
            timezone: default_timezone(),
            per_instrument: HashMap::new(),
            holidays: Vec::new(),
            auto_close_at_end: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthLossGuardConfig {
    pub enabled: bool,
    pub auto_unlock_on_restore: bool,
    pub check_on_startup: bool,
}

impl Default for AuthLossGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_unlock_on_restore: true,
            check_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SymbolBlocksConfig {
    pub enabled: bool,
    pub blocked_symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoBreakevenConfig {
    pub enabled: bool,
    pub profit_trigger_ticks: f64,
    pub offset_ticks: f64,
    pub respect_manual_stops: bool,
}

impl Default for AutoBreakevenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            profit_trigger_ticks: 10.0,
            offset_ticks: 0.0,
            respect_manual_stops: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    pub activation_ticks: f64,
    pub trail_distance_ticks: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            activation_ticks: 20.0,
            trail_distance_ticks: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TradeManagementConfig {
    pub enabled: bool,
    pub auto_breakeven: AutoBreakevenConfig,
    pub trailing_stop: TrailingStopConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(config)
    }
}
