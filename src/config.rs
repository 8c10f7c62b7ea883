use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::models::TradeDirection;
use crate::risk::TrailingStopConfig;
use crate::strategy::signals::IndicatorConfig;
use crate::Result;

const DEFAULT_CONFIG_NAME: &str = "leverbot";
const ENV_PREFIX: &str = "LEVERBOT";

/// Longest high/low window one 1-minute kline request can cover
pub const MAX_HIGH_LOW_WINDOW_MINUTES: u32 = 1000;

/// Complete runtime configuration.
///
/// Loaded once at startup; later changes are published as a fresh
/// `Arc<Settings>` snapshot instead of mutating a shared instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub trading: TradingSettings,
    pub trailing: TrailingStopConfig,
    pub indicators: IndicatorConfig,
    pub entry: EntrySettings,
    pub schedule: ScheduleSettings,
    pub alerts: AlertSettings,
    pub exchange: ExchangeSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingSettings {
    /// Symbol traded on the exchange (e.g. "BTCUSDT")
    pub symbol: String,
    /// Symbol used for candles when they come from Binance spot
    pub candle_symbol: String,
    pub leverage: u32,
    pub order_size: f64,
    /// Initial trigger for every new tracker, in PnL%
    pub default_stop_loss: f64,
    /// Absolute price target; take-profit or stop-loss depending on the entry side
    pub stop_loss_price: Option<f64>,
    pub trade_direction: TradeDirection,
    pub auto_open: bool,
    pub auto_close: bool,
    /// Symbol prefixes that are never closed at a loss
    pub ignore_stop_loss: Vec<String>,
    /// Symbol prefixes that are never closed at a profit
    pub ignore_take_profit: Vec<String>,
    /// Taker fee per side, in percent
    pub fee_rate_per_side: f64,
    pub margin_calls: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            candle_symbol: "BTCUSDT".to_string(),
            leverage: 20,
            order_size: 0.001,
            default_stop_loss: -3.5,
            stop_loss_price: None,
            trade_direction: TradeDirection::Both,
            auto_open: false,
            auto_close: true,
            ignore_stop_loss: Vec::new(),
            ignore_take_profit: Vec::new(),
            fee_rate_per_side: 0.06,
            margin_calls: 0,
        }
    }
}

impl TradingSettings {
    pub fn ignores_stop_loss(&self, symbol: &str) -> bool {
        matches_prefix(&self.ignore_stop_loss, symbol)
    }

    pub fn ignores_take_profit(&self, symbol: &str) -> bool {
        matches_prefix(&self.ignore_take_profit, symbol)
    }
}

fn matches_prefix(prefixes: &[String], symbol: &str) -> bool {
    prefixes
        .iter()
        .map(|p| p.trim())
        .any(|p| !p.is_empty() && symbol.starts_with(p))
}

/// Parse a comma-separated prefix list such as "TRUMP, DOGE,"
pub fn parse_prefix_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EntrySettings {
    /// Consecutive empty polls required before watching for an entry
    pub empty_count_threshold: u32,
    pub confirmation_secs: u64,
    pub signal_check_secs: u64,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            empty_count_threshold: 3,
            confirmation_secs: 30,
            signal_check_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleSettings {
    pub positions_secs: u64,
    pub auto_close_secs: u64,
    pub indicators_secs: u64,
    pub high_low_secs: u64,
    pub balance_secs: u64,
    pub high_low_window_minutes: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            positions_secs: 1,
            auto_close_secs: 1,
            indicators_secs: 5,
            high_low_secs: 60,
            balance_secs: 60,
            high_low_window_minutes: 60,
        }
    }
}

/// Price alert thresholds; 0 disables a side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AlertSettings {
    pub price_above: f64,
    pub price_below: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Bybit,
    BinanceMargin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CandleSourceKind {
    /// Candles from the trading exchange itself
    Exchange,
    #[default]
    BinanceSpot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExchangeSettings {
    pub kind: ExchangeKind,
    pub testnet: bool,
    pub candle_source: CandleSourceKind,
    pub rate_limit_per_sec: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Bybit,
            testnet: false,
            candle_source: CandleSourceKind::BinanceSpot,
            rate_limit_per_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    pub path: PathBuf,
    pub redis_key: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::File,
            path: PathBuf::from("position_trackers.json"),
            redis_key: "leverbot:trackers".to_string(),
        }
    }
}

/// API credentials, read from the environment (after `.env` is loaded)
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env(kind: ExchangeKind) -> Result<Self> {
        let (key_var, secret_var) = match kind {
            ExchangeKind::Bybit => ("BYBIT_API_KEY", "BYBIT_API_SECRET"),
            ExchangeKind::BinanceMargin => ("BINANCE_API_KEY", "BINANCE_API_SECRET"),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| BotError::Config(format!("{} not found in environment", key_var)))?;
        let api_secret = std::env::var(secret_var)
            .map_err(|_| BotError::Config(format!("{} not found in environment", secret_var)))?;
        Ok(Self { api_key, api_secret })
    }
}

impl Settings {
    /// Load settings from an optional file, then environment overrides.
    ///
    /// Without an explicit path, `leverbot.{toml,json,yaml}` in the working
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("trading.ignore_stop_loss")
                    .with_list_parse_key("trading.ignore_take_profit")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbol.trim().is_empty() {
            return Err(BotError::Config("trading.symbol must not be empty".into()));
        }
        if self.trading.leverage == 0 {
            return Err(BotError::Config("trading.leverage must be at least 1".into()));
        }
        if self.trading.order_size <= 0.0 {
            return Err(BotError::Config("trading.order_size must be positive".into()));
        }
        if self.trading.fee_rate_per_side < 0.0 {
            return Err(BotError::Config(
                "trading.fee_rate_per_side must not be negative".into(),
            ));
        }
        if let Some(price) = self.trading.stop_loss_price {
            if price <= 0.0 {
                return Err(BotError::Config(
                    "trading.stop_loss_price must be positive when set".into(),
                ));
            }
        }

        self.indicators.validate()?;
        self.trailing.validate()?;

        let s = &self.schedule;
        if [
            s.positions_secs,
            s.auto_close_secs,
            s.indicators_secs,
            s.high_low_secs,
            s.balance_secs,
            self.entry.signal_check_secs,
        ]
        .contains(&0)
        {
            return Err(BotError::Config("schedule intervals must be at least 1s".into()));
        }
        if !(1..=MAX_HIGH_LOW_WINDOW_MINUTES).contains(&s.high_low_window_minutes) {
            return Err(BotError::Config(format!(
                "schedule.high_low_window_minutes must be between 1 and {}",
                MAX_HIGH_LOW_WINDOW_MINUTES
            )));
        }
        if self.exchange.rate_limit_per_sec == 0 {
            return Err(BotError::Config(
                "exchange.rate_limit_per_sec must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
