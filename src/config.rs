// src/config.rs

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Backoff multiplier applied to errors of unknown class.
    pub unknown_delay_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            unknown_delay_multiplier: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub recv_window_ms: u64,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    pub min_interval_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            base_url: "https://api.bybit.com".to_string(),
            recv_window_ms: 5_000,
            timeout_secs: 10,
            max_concurrent: 5,
            min_interval_ms: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// Thresholds for the guard battery.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GuardSettings {
    /// Price beyond the stop by more than this fraction counts as a breach.
    pub sl_breach_tolerance: Decimal,
    /// Unrealized P&L / initial margin at or below this closes the position.
    pub pnl_emergency_threshold: Decimal,
    /// Account-wide unrealized P&L / margin at or below this closes everything.
    pub account_drawdown_threshold: Decimal,
    pub correlated_loss_enabled: bool,
    pub time_exit_enabled: bool,
    pub time_exit_hours: i64,
    pub repair_max_attempts: u32,
    pub repair_cooldown_minutes: i64,
    /// Immediate retries allowed when protection vanishes after a partial close.
    pub urgent_repair_attempts: u32,
    /// Unprotected positions younger than this are not force-closed.
    pub repair_grace_secs: i64,
    /// Relative quantity difference tolerated before a drift sync.
    pub quantity_tolerance: Decimal,
    pub capitulation_threshold: u32,
    pub capitulation_ban_hours: i64,
    pub repair_ban_hours: i64,
    pub close_verify_attempts: u32,
    pub close_verify_delay_ms: u64,
    pub confirmation_window_secs: i64,
    pub opening_lock_ttl_secs: i64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            sl_breach_tolerance: Decimal::new(2, 2),
            pnl_emergency_threshold: Decimal::new(-50, 2),
            account_drawdown_threshold: Decimal::new(-70, 2),
            correlated_loss_enabled: true,
            time_exit_enabled: false,
            time_exit_hours: 48,
            repair_max_attempts: 3,
            repair_cooldown_minutes: 10,
            urgent_repair_attempts: 5,
            repair_grace_secs: 60,
            quantity_tolerance: Decimal::new(1, 3),
            capitulation_threshold: 3,
            capitulation_ban_hours: 24,
            repair_ban_hours: 12,
            close_verify_attempts: 3,
            close_verify_delay_ms: 500,
            confirmation_window_secs: 30,
            opening_lock_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlPolicy {
    Breakeven,
    Trailing,
    NoChange,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LadderSettings {
    /// Percent of the remaining quantity closed at each level; the last level closes everything.
    pub close_pcts: Vec<Decimal>,
    pub sl_policy: SlPolicy,
    pub trailing_distance_pct: Decimal,
}

impl Default for LadderSettings {
    fn default() -> Self {
        Self {
            close_pcts: vec![Decimal::from(50), Decimal::from(30), Decimal::from(100)],
            sl_policy: SlPolicy::Breakeven,
            trailing_distance_pct: Decimal::new(1, 2),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReversePolicy {
    Reject,
    MarketReversal,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePolicy {
    Reject,
    TrackConfirmation,
    Upgrade,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SameDirectionPolicy {
    Reject,
    TrackConfirmation,
    Ignore,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConflictSettings {
    pub reverse_policy: ReversePolicy,
    pub reversal_min_strength: f64,
    /// Emergency-tier alerts may not reverse a position.
    pub block_emergency_reversal: bool,
    /// P&L / margin the existing position needs before a lower tier may reverse it.
    pub override_min_profit_pct: Decimal,
    pub upgrade_policy: UpgradePolicy,
    pub same_direction_policy: SameDirectionPolicy,
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            reverse_policy: ReversePolicy::Reject,
            reversal_min_strength: 0.7,
            block_emergency_reversal: true,
            override_min_profit_pct: Decimal::new(5, 3),
            upgrade_policy: UpgradePolicy::TrackConfirmation,
            same_direction_policy: SameDirectionPolicy::Ignore,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TradingSettings {
    /// Margin committed per new position, in quote currency.
    pub margin_per_trade: Decimal,
    pub default_leverage: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            margin_per_trade: Decimal::from(50),
            default_leverage: 10,
        }
    }
}

/// Runtime settings served by the ledger each cycle.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub guard: GuardSettings,
    pub ladder: LadderSettings,
    pub conflict: ConflictSettings,
    pub trading: TradingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub live_trading: bool,
    pub monitor_interval_secs: u64,
    pub ledger_path: String,
    /// Audit entries and settled positions the ledger file keeps.
    pub ledger_retention: usize,
    pub log_dir: String,
    pub engine: EngineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            live_trading: false,
            monitor_interval_secs: 10,
            ledger_path: "ledger.json".to_string(),
            ledger_retention: crate::storage::json::DEFAULT_RETENTION,
            log_dir: "logs".to_string(),
            engine: EngineSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}
