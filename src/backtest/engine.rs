//! Candle-by-candle replay of the strategy decision contract.
//!
//! The replay never talks to an exchange. Fills happen at the close of the
//! candle whose causal prefix produced the signal, and the only state the
//! strategies can touch lives in the engine's own store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BacktestConfig, InstrumentConfig};
use crate::domain::{Candle, OrderSide, Signal};
use crate::error::{Result, RoboError};
use crate::persistence::{Document, MemoryStateStore, StateSnapshot, StateStore, StrategyLockState};
use crate::strategy::{StrategyEngine, StrategyView};

/// Strategies need some history before their first reading; never replay
/// fewer candles than this.
pub const MIN_REPLAY_WINDOW: usize = 60;

// ============================================================================
// Results
// ============================================================================

/// One simulated execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestFill {
    /// Index of the candle inside the replay window
    pub index: usize,
    pub open_time: DateTime<Utc>,
    pub side: OrderSide,
    pub price: Decimal,
    /// Quote balance after the fill (unchanged by buys)
    pub balance: Decimal,
}

/// Liquidation of a position still open when the series ran out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedExit {
    pub open_time: DateTime<Utc>,
    pub price: Decimal,
    pub profit: Decimal,
}

/// Backtest summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub symbol: String,
    pub strategy: String,
    /// Candles in the replay window
    pub candles: usize,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub return_pct: Decimal,
    /// Executed buys plus executed sells
    pub trades: u64,
    pub forced_exit: Option<ForcedExit>,
    pub fills: Vec<BacktestFill>,
}

// ============================================================================
// Engine
// ============================================================================

/// Replays one instrument's strategy over a historical series.
pub struct BacktestReplayEngine {
    engine: StrategyEngine,
    symbol: String,
    initial_balance: Decimal,
    periods: usize,
    verbose: bool,
}

impl BacktestReplayEngine {
    pub fn new(engine: StrategyEngine, symbol: impl Into<String>, config: &BacktestConfig) -> Self {
        Self {
            engine,
            symbol: symbol.into(),
            initial_balance: config.initial_balance,
            periods: config.periods,
            verbose: config.verbose,
        }
    }

    /// Build the instrument's strategy stack over a private in-memory store,
    /// so a replay can never write into live lock flags.
    pub fn from_config(instrument: &InstrumentConfig, config: &BacktestConfig) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let engine = StrategyEngine::from_config(&instrument.strategy, store);
        Self::new(engine, instrument.symbol(), config)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    /// Replay the last `max(periods, MIN_REPLAY_WINDOW)` candles of `series`.
    pub async fn run(&self, series: &[Candle]) -> Result<BacktestReport> {
        let window_len = self.periods.max(MIN_REPLAY_WINDOW).min(series.len());
        let window = &series[series.len() - window_len..];
        if window.len() < 2 {
            return Err(RoboError::InsufficientData(format!(
                "{}: backtest needs at least 2 candles, got {}",
                self.symbol,
                window.len()
            )));
        }

        info!(
            instrument = %self.symbol,
            strategy = self.engine.primary_name(),
            candles = window.len(),
            initial_balance = %self.initial_balance,
            "backtest started"
        );

        // every run starts from the flags the engine had before it
        let store = self.engine.store().as_ref();
        let snapshot = StateSnapshot::capture(store, &[(StrategyLockState::COLLECTION, &self.symbol)]).await?;
        let replayed = self.replay(window).await;
        snapshot.restore(store).await?;
        replayed
    }

    async fn replay(&self, window: &[Candle]) -> Result<BacktestReport> {
        let mut balance = self.initial_balance;
        let mut is_long = false;
        let mut entry_price = Decimal::ZERO;
        let mut last_signal: Option<Signal> = None;
        let mut trades = 0u64;
        let mut fills = Vec::new();

        for i in 1..window.len() {
            let prefix = &window[..=i];
            let candle = &window[i];
            let view = StrategyView {
                key: &self.symbol,
                is_long,
                last_buy_price: entry_price,
                verbose: false,
            };

            let signal = self.engine.evaluate(prefix, view).await?;
            let side = match signal {
                Signal::Buy if !is_long && last_signal != Some(Signal::Buy) => OrderSide::Buy,
                Signal::Sell if is_long && last_signal != Some(Signal::Sell) => OrderSide::Sell,
                _ => continue,
            };

            if self.verbose {
                self.explain(prefix, view, candle, side).await?;
            }

            match side {
                OrderSide::Buy => {
                    is_long = true;
                    entry_price = candle.close;
                    last_signal = Some(Signal::Buy);
                }
                OrderSide::Sell => {
                    balance += profit(entry_price, candle.close, balance);
                    is_long = false;
                    last_signal = Some(Signal::Sell);
                }
            }
            trades += 1;
            fills.push(BacktestFill {
                index: i,
                open_time: candle.open_time,
                side,
                price: candle.close,
                balance,
            });
        }

        let forced_exit = match window.last() {
            Some(last) if is_long => {
                let profit = profit(entry_price, last.close, balance);
                balance += profit;
                Some(ForcedExit {
                    open_time: last.open_time,
                    price: last.close,
                    profit,
                })
            }
            _ => None,
        };

        let return_pct = (balance - self.initial_balance)
            .checked_div(self.initial_balance)
            .unwrap_or(Decimal::ZERO)
            * Decimal::ONE_HUNDRED;

        info!(
            instrument = %self.symbol,
            final_balance = %balance.round_dp(2),
            return_pct = %return_pct.round_dp(2),
            trades,
            forced_exit = forced_exit.is_some(),
            "backtest finished"
        );

        Ok(BacktestReport {
            symbol: self.symbol.clone(),
            strategy: self.engine.primary_name().to_string(),
            candles: window.len(),
            initial_balance: self.initial_balance,
            final_balance: balance,
            return_pct,
            trades,
            forced_exit,
            fills,
        })
    }

    /// Re-run the strategy with diagnostics on, then put the lock document
    /// back exactly as the authoritative evaluation left it.
    async fn explain(
        &self,
        prefix: &[Candle],
        view: StrategyView<'_>,
        candle: &Candle,
        side: OrderSide,
    ) -> Result<()> {
        debug!(
            instrument = %self.symbol,
            %side,
            close = %candle.close,
            open_time = %candle.open_time,
            "backtest signal"
        );
        let store = self.engine.store().as_ref();
        let snapshot = StateSnapshot::capture(store, &[(StrategyLockState::COLLECTION, &self.symbol)]).await?;
        let rerun = self
            .engine
            .evaluate(prefix, StrategyView { verbose: true, ..view })
            .await;
        snapshot.restore(store).await?;
        rerun.map(|_| ())
    }
}

/// P&L of moving the whole `balance` from `entry` to `exit`
fn profit(entry: Decimal, exit: Decimal, balance: Decimal) -> Decimal {
    (exit - entry).checked_div(entry).unwrap_or(Decimal::ZERO) * balance
}
