use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backtest::{load_candles, BacktestReplayEngine, BacktestReport};
use crate::config::{AppConfig, InstrumentConfig};
use crate::coordination::{install_signal_handlers, Shutdown, ShutdownSignal, TradingRunner};
use crate::domain::{Candle, Instrument, InstrumentRules};
use crate::error::{Result, RoboError};
use crate::exchange::{ExchangeGateway, PaperExchange};
use crate::persistence::open_store;
use crate::trader::PositionController;

#[derive(Parser)]
#[command(name = "robo")]
#[command(version)]
#[command(about = "Single-position spot trading bot with layered risk control", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trade every configured instrument against the paper venue
    Run {
        /// Candle history: one JSON file for all instruments, or a directory
        /// holding `<SYMBOL>.json` per instrument
        #[arg(long)]
        candles: PathBuf,
        /// Candles visible before the first cycle
        #[arg(long, default_value = "200")]
        warmup: usize,
        /// Starting free balance of every quote asset
        #[arg(long, default_value = "1000")]
        quote_balance: Decimal,
        /// Price granularity of the paper venue
        #[arg(long, default_value = "0.01")]
        price_tick: Decimal,
        /// Quantity granularity of the paper venue
        #[arg(long, default_value = "0.001")]
        qty_step: Decimal,
    },
    /// Replay an instrument's strategy over a candle file
    Backtest {
        #[arg(long)]
        candles: PathBuf,
        /// Instrument symbol, e.g. SOLUSDT
        #[arg(long)]
        instrument: String,
        /// Override `backtest.periods`
        #[arg(long)]
        periods: Option<usize>,
        /// Override `backtest.initial_balance`
        #[arg(long)]
        initial_balance: Option<Decimal>,
        /// Log strategy diagnostics on every executed signal
        #[arg(long)]
        verbose: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

/// Venue settings for `robo run`
#[derive(Debug, Clone)]
pub struct PaperOptions {
    pub candles: PathBuf,
    pub warmup: usize,
    pub quote_balance: Decimal,
    pub rules: InstrumentRules,
}

impl Default for PaperOptions {
    fn default() -> Self {
        Self {
            candles: PathBuf::from("data/candles"),
            warmup: 200,
            quote_balance: dec!(1000),
            rules: InstrumentRules {
                price_tick: dec!(0.01),
                qty_step: dec!(0.001),
            },
        }
    }
}

/// Load the config and fail with every validation problem at once
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)?;
    config
        .validate()
        .map_err(|errors| RoboError::InvalidConfig(errors.join("; ")))?;
    Ok(config)
}

pub fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("\x1b[32m✓ {} is valid\x1b[0m", path.display());
    for inst in &config.instruments {
        println!(
            "  {:<10} qty {:<8} {:<4} strategy {:?} fallback {}",
            inst.symbol(),
            inst.traded_quantity,
            inst.interval.as_str(),
            inst.strategy.primary,
            if inst.strategy.fallback_enabled && inst.strategy.fallback.is_some() {
                "on"
            } else {
                "off"
            }
        );
    }
    Ok(())
}

fn candles_for(source: &Path, symbol: &str) -> Result<Vec<Candle>> {
    if source.is_dir() {
        load_candles(source.join(format!("{symbol}.json")))
    } else {
        load_candles(source)
    }
}

/// Build the paper venue with one market per configured instrument
pub fn build_paper_exchange(instruments: &[InstrumentConfig], options: &PaperOptions) -> Result<PaperExchange> {
    let mut paper = PaperExchange::new();
    let mut quotes = Vec::new();
    for inst in instruments {
        let candles = candles_for(&options.candles, &inst.symbol())?;
        info!(instrument = %inst.symbol(), candles = candles.len(), "paper market loaded");
        paper = paper.with_market(Instrument::new(&inst.base, &inst.quote, options.rules), candles);
        if !quotes.contains(&inst.quote) {
            quotes.push(inst.quote.clone());
        }
    }
    for quote in &quotes {
        paper = paper.with_balance(quote, options.quote_balance);
    }
    Ok(paper.with_auto_advance(options.warmup))
}

/// `robo run`: every instrument on the paper venue until Ctrl-C or until the
/// candle history runs out.
pub async fn run_trading(config: &AppConfig, options: &PaperOptions) -> Result<()> {
    if !config.runtime.dry_run {
        return Err(RoboError::InvalidConfig(
            "no live exchange gateway is configured; set runtime.dry_run = true".to_string(),
        ));
    }

    let paper = Arc::new(build_paper_exchange(&config.instruments, options)?);
    let gateway: Arc<dyn ExchangeGateway> = paper.clone();
    let store = open_store(&config.store)?;

    let mut controllers = Vec::with_capacity(config.instruments.len());
    for inst in &config.instruments {
        controllers.push(PositionController::connect(gateway.clone(), store.clone(), inst.clone()).await?);
    }

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone());

    let watcher = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = watcher.wait() => return,
            }
            if paper.exhausted().await {
                info!("paper candle history exhausted");
                watcher.request_shutdown(ShutdownSignal::Internal);
                return;
            }
        }
    });

    let summaries = TradingRunner::new(config.runtime.serialize_instruments)
        .run(controllers, shutdown)
        .await?;
    for summary in &summaries {
        println!(
            "{:<10} cycles {:>6}  orders {:>4}  errors {:>4}",
            summary.symbol, summary.cycles, summary.orders, summary.errors
        );
    }
    Ok(())
}

/// `robo backtest`
pub async fn run_backtest(
    config: &AppConfig,
    candles: &Path,
    symbol: &str,
    json: bool,
) -> Result<BacktestReport> {
    let inst = config
        .instrument(symbol)
        .ok_or_else(|| RoboError::UnknownInstrument(symbol.to_string()))?;
    let series = load_candles(candles)?;
    if series.len() < config.backtest.periods {
        warn!(
            instrument = %inst.symbol(),
            available = series.len(),
            periods = config.backtest.periods,
            "candle file is shorter than the requested window"
        );
    }

    let report = BacktestReplayEngine::from_config(inst, &config.backtest)
        .run(&series)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report)
}

fn print_report(report: &BacktestReport) {
    println!("Backtest {} ({})", report.symbol, report.strategy);
    println!("  candles          {}", report.candles);
    println!("  initial balance  {:.2}", report.initial_balance);
    println!("  final balance    {:.2}", report.final_balance);
    println!("  return           {:.2}%", report.return_pct);
    println!("  trades           {}", report.trades);
    if let Some(exit) = &report.forced_exit {
        println!(
            "  closed at end    {:.4} on {} (profit {:.2})",
            exit.price, exit.open_time, exit.profit
        );
    }
}
