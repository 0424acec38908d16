use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::domain::CandleInterval;
use crate::strategy::{ChiloRsiParams, EmaMicroParams, FixedParams, HiLoParams};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Run every instrument's cycle under one global lock (shared account)
    #[serde(default = "default_true")]
    pub serialize_instruments: bool,
    /// Trade against the paper venue instead of a live gateway
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            serialize_instruments: true,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Root directory for the file backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/state")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestConfig {
    /// Starting quote balance
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Number of most recent candles replayed
    #[serde(default = "default_backtest_periods")]
    pub periods: usize,
    /// Re-run the strategy verbosely on every executed signal
    #[serde(default)]
    pub verbose: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            periods: default_backtest_periods(),
            verbose: false,
        }
    }
}

fn default_initial_balance() -> Decimal {
    dec!(100)
}

fn default_backtest_periods() -> usize {
    24 * 90
}

/// One traded instrument and everything that drives its controller
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    pub base: String,
    pub quote: String,
    /// Base quantity bought on every entry
    pub traded_quantity: Decimal,
    #[serde(default)]
    pub interval: CandleInterval,
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

fn default_candle_limit() -> usize {
    1000
}

impl InstrumentConfig {
    /// Create an instrument entry with default strategy, risk and execution settings
    pub fn new(base: &str, quote: &str, traded_quantity: Decimal) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
            traded_quantity,
            interval: CandleInterval::default(),
            candle_limit: default_candle_limit(),
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn symbol(&self) -> String {
        format!("{}{}", self.base.to_uppercase(), self.quote.to_uppercase())
    }
}

/// Strategy selection for one instrument
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_primary")]
    pub primary: StrategySpec,
    #[serde(default = "default_fallback")]
    pub fallback: Option<StrategySpec>,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
            fallback_enabled: true,
        }
    }
}

fn default_primary() -> StrategySpec {
    StrategySpec::ChiloRsi(ChiloRsiParams::default())
}

fn default_fallback() -> Option<StrategySpec> {
    Some(StrategySpec::EmaMicro(EmaMicroParams::default()))
}

/// Strategy kind plus its parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySpec {
    ChiloRsi(ChiloRsiParams),
    Hilo(HiLoParams),
    EmaMicro(EmaMicroParams),
    Fixed(FixedParams),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Stop-loss distance below the last buy, in percent
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Consecutive closes that must sit below the stop (current included)
    #[serde(default = "default_confirm_candles")]
    pub stop_loss_confirm_candles: usize,
    /// Lowest limit sell price, as a percent below the last buy. Negative
    /// values demand a profit.
    #[serde(default = "default_acceptable_loss_pct")]
    pub acceptable_loss_pct: Decimal,
    #[serde(default = "default_true")]
    pub trailing_stop_enabled: bool,
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: Decimal,
    /// Gain thresholds of each take-profit rung, in percent
    #[serde(default = "default_take_profit_at")]
    pub take_profit_at_pct: Vec<Decimal>,
    /// Share of the holding sold at each rung, in percent
    #[serde(default = "default_take_profit_amount")]
    pub take_profit_amount_pct: Vec<Decimal>,
    #[serde(default)]
    pub pause_after_stop_loss: bool,
    #[serde(default)]
    pub pause_after_trailing_stop: bool,
    #[serde(default)]
    pub pause_after_take_profit: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            stop_loss_confirm_candles: default_confirm_candles(),
            acceptable_loss_pct: default_acceptable_loss_pct(),
            trailing_stop_enabled: true,
            trailing_stop_pct: default_trailing_stop_pct(),
            take_profit_at_pct: default_take_profit_at(),
            take_profit_amount_pct: default_take_profit_amount(),
            pause_after_stop_loss: false,
            pause_after_trailing_stop: false,
            pause_after_take_profit: false,
        }
    }
}

fn default_stop_loss_pct() -> Decimal {
    dec!(3.5)
}

fn default_confirm_candles() -> usize {
    2
}

fn default_acceptable_loss_pct() -> Decimal {
    dec!(0.5)
}

fn default_trailing_stop_pct() -> Decimal {
    dec!(2)
}

fn default_take_profit_at() -> Vec<Decimal> {
    Vec::new()
}

fn default_take_profit_amount() -> Vec<Decimal> {
    Vec::new()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Market orders for strategy entries/exits (forced exits are always market)
    #[serde(default = "default_true")]
    pub market_orders: bool,
    /// Sleep between cycles while holding
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Cooldown after any executed order
    #[serde(default = "default_post_order_delay")]
    pub post_order_delay_secs: u64,
    /// Pause after cancelling orders before the next exchange call
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// How many past orders are scanned for the last fill prices
    #[serde(default = "default_history_limit")]
    pub order_history_limit: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            market_orders: true,
            cycle_interval_secs: default_cycle_interval(),
            post_order_delay_secs: default_post_order_delay(),
            settle_delay_ms: default_settle_delay(),
            order_history_limit: default_history_limit(),
        }
    }
}

fn default_cycle_interval() -> u64 {
    30
}

fn default_post_order_delay() -> u64 {
    60
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_history_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from `config/default.toml` and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file, then apply `ROBO__*` overrides
    pub fn load_from<P: AsRef<Path>>(config_file: P) -> Result<Self, ConfigError> {
        let config_file = config_file.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("runtime.serialize_instruments", true)?
            .set_default("runtime.dry_run", true)?
            .add_source(File::from(config_file).required(false))
            // Override with environment variables (ROBO__RUNTIME__DRY_RUN, etc.)
            .add_source(
                Environment::with_prefix("ROBO")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a single-instrument configuration for CLI usage
    pub fn default_config(base: &str, quote: &str, traded_quantity: Decimal) -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            backtest: BacktestConfig::default(),
            instruments: vec![InstrumentConfig::new(base, quote, traded_quantity)],
        }
    }

    /// Find an instrument by symbol (`SOLUSDT`)
    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentConfig> {
        let wanted = symbol.to_uppercase();
        self.instruments.iter().find(|i| i.symbol() == wanted)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.instruments.is_empty() {
            errors.push("at least one [[instruments]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        for inst in &self.instruments {
            let symbol = inst.symbol();
            if !seen.insert(symbol.clone()) {
                errors.push(format!("{symbol}: instrument listed more than once"));
            }
            inst.validate_into(&symbol, &mut errors);
        }

        if self.backtest.initial_balance <= Decimal::ZERO {
            errors.push("backtest.initial_balance must be positive".to_string());
        }
        if self.backtest.periods < 2 {
            errors.push("backtest.periods must be at least 2".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl InstrumentConfig {
    fn validate_into(&self, symbol: &str, errors: &mut Vec<String>) {
        if self.base.trim().is_empty() || self.quote.trim().is_empty() {
            errors.push(format!("{symbol}: base and quote must be set"));
        }
        if self.traded_quantity <= Decimal::ZERO {
            errors.push(format!("{symbol}: traded_quantity must be positive"));
        }
        if self.candle_limit < 2 {
            errors.push(format!("{symbol}: candle_limit must be at least 2"));
        }

        let risk = &self.risk;
        if !in_open_pct_range(risk.stop_loss_pct) {
            errors.push(format!("{symbol}: stop_loss_pct must be between 0 and 100"));
        }
        if risk.stop_loss_confirm_candles == 0 {
            errors.push(format!("{symbol}: stop_loss_confirm_candles must be at least 1"));
        }
        if risk.acceptable_loss_pct <= -Decimal::ONE_HUNDRED || risk.acceptable_loss_pct >= Decimal::ONE_HUNDRED {
            errors.push(format!("{symbol}: acceptable_loss_pct must be in (-100, 100)"));
        }
        if risk.trailing_stop_enabled && !in_open_pct_range(risk.trailing_stop_pct) {
            errors.push(format!("{symbol}: trailing_stop_pct must be between 0 and 100"));
        }
        if risk.take_profit_at_pct.len() != risk.take_profit_amount_pct.len() {
            errors.push(format!(
                "{symbol}: take_profit_at_pct has {} rungs but take_profit_amount_pct has {}",
                risk.take_profit_at_pct.len(),
                risk.take_profit_amount_pct.len()
            ));
        }
        if risk.take_profit_at_pct.iter().any(|p| *p <= Decimal::ZERO) {
            errors.push(format!("{symbol}: take_profit_at_pct values must be positive"));
        }
        if risk
            .take_profit_amount_pct
            .iter()
            .any(|p| *p <= Decimal::ZERO || *p > Decimal::ONE_HUNDRED)
        {
            errors.push(format!("{symbol}: take_profit_amount_pct values must be in (0, 100]"));
        }

        validate_strategy(symbol, "primary", &self.strategy.primary, errors);
        if let Some(fallback) = &self.strategy.fallback {
            validate_strategy(symbol, "fallback", fallback, errors);
        }
    }
}

fn validate_strategy(symbol: &str, slot: &str, spec: &StrategySpec, errors: &mut Vec<String>) {
    match spec {
        StrategySpec::ChiloRsi(p) => {
            if p.rsi_period == 0 || p.rsi_sma_period == 0 || p.hilo_length == 0 {
                errors.push(format!("{symbol}: {slot} chilo_rsi periods must be positive"));
            }
            if p.use_atr_filter && (p.atr_period == 0 || p.atr_min_pct > p.atr_max_pct) {
                errors.push(format!("{symbol}: {slot} chilo_rsi ATR band is invalid"));
            }
        }
        StrategySpec::Hilo(p) => {
            if p.length == 0 {
                errors.push(format!("{symbol}: {slot} hilo length must be positive"));
            }
        }
        StrategySpec::EmaMicro(p) => {
            if p.window == 0 {
                errors.push(format!("{symbol}: {slot} ema_micro window must be positive"));
            }
            if p.profit_target_pct <= 0.0 {
                errors.push(format!("{symbol}: {slot} ema_micro profit_target_pct must be positive"));
            }
        }
        StrategySpec::Fixed(_) => {}
    }
}

fn in_open_pct_range(value: Decimal) -> bool {
    value > Decimal::ZERO && value < Decimal::ONE_HUNDRED
}
