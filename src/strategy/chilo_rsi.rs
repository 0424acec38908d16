//! HiLo trend + RSI momentum strategy with persisted re-entry flags.
//!
//! Buys when the HiLo activator is on, RSI sits below the buy ceiling and
//! above its own moving average, and the optional trend/volatility filters
//! pass. Exits on a HiLo flip, on a pullback after an overbought excursion,
//! or when RSI drops back under the re-entry level after crossing the buy
//! ceiling while long. Every exit locks re-entry until RSI cools off.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::hilo::{hilo_state, MaType};
use super::indicators::{self, closes, highs, lows};
use super::traits::{LockFlag, LockUpdate, Strategy, StrategyContext, StrategyLockState, StrategyOutput};
use crate::domain::{Candle, Signal};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChiloRsiParams {
    // RSI
    pub rsi_period: usize,
    pub rsi_sma_period: usize,
    /// Buy only below this RSI
    pub rsi_buy_max: f64,
    pub rsi_overbought: f64,
    /// Re-entry unlocks (and partial-threshold exits fire) below this RSI
    pub rsi_reentry: f64,

    // HiLo
    pub hilo_length: usize,
    pub hilo_offset: usize,
    pub hilo_ma_type: MaType,

    // Trend filter (close above EMA)
    pub ema_trend_length: usize,
    pub use_trend_filter: bool,

    // Volatility filter (ATR / close inside a band)
    pub atr_period: usize,
    pub atr_min_pct: f64,
    pub atr_max_pct: f64,
    pub use_atr_filter: bool,
}

impl Default for ChiloRsiParams {
    fn default() -> Self {
        Self {
            rsi_period: 9,
            rsi_sma_period: 14,
            rsi_buy_max: 65.0,
            rsi_overbought: 75.0,
            rsi_reentry: 60.0,
            hilo_length: 21,
            hilo_offset: 1,
            hilo_ma_type: MaType::Sma,
            ema_trend_length: 20,
            use_trend_filter: false,
            atr_period: 14,
            atr_min_pct: 0.0025,
            atr_max_pct: 0.015,
            use_atr_filter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChiloRsi {
    params: ChiloRsiParams,
}

impl ChiloRsi {
    pub fn new(params: ChiloRsiParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChiloRsiParams {
        &self.params
    }
}

/// Indicator readings on the last usable candle
#[derive(Debug, Clone, Copy)]
struct Readings {
    rsi: f64,
    rsi_sma: f64,
    hilo: bool,
    trend_ok: bool,
    atr_ok: bool,
    atr_pct: f64,
}

impl ChiloRsi {
    /// Compute the readings on the rows where both RSI and its average are
    /// defined. `None` when no such row exists.
    fn readings(&self, series: &[Candle]) -> Option<Readings> {
        let p = &self.params;
        let rsi = indicators::rsi(&closes(series), p.rsi_period);
        let rsi_sma = indicators::sma(&rsi, p.rsi_sma_period);

        let rows: Vec<usize> = (0..series.len())
            .filter(|&i| !rsi[i].is_nan() && !rsi_sma[i].is_nan())
            .collect();
        let &last_row = rows.last()?;

        let kept: Vec<Candle> = rows.iter().map(|&i| series[i].clone()).collect();
        let close = closes(&kept);
        let high = highs(&kept);
        let low = lows(&kept);
        let last_close = indicators::last(&close);

        // Too few rows for the bands reads as "HiLo says sell".
        let hilo = hilo_state(&close, &high, &low, p.hilo_length, p.hilo_offset, p.hilo_ma_type)
            .unwrap_or(false);

        let trend_ok = !p.use_trend_filter
            || last_close > indicators::last(&indicators::ema(&close, p.ema_trend_length));

        let (atr_ok, atr_pct) = if p.use_atr_filter {
            let atr = indicators::last(&indicators::atr(&high, &low, &close, p.atr_period));
            let pct = if last_close != 0.0 { atr / last_close } else { 0.0 };
            (p.atr_min_pct <= pct && pct <= p.atr_max_pct, pct)
        } else {
            (true, f64::NAN)
        };

        Some(Readings {
            rsi: rsi[last_row],
            rsi_sma: rsi_sma[last_row],
            hilo,
            trend_ok,
            atr_ok,
            atr_pct,
        })
    }
}

impl Strategy for ChiloRsi {
    fn name(&self) -> &str {
        "chilo_rsi"
    }

    fn evaluate(&self, series: &[Candle], ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
        let p = &self.params;
        let Some(r) = self.readings(series) else {
            if ctx.verbose {
                debug!(instrument = ctx.symbol, candles = series.len(), "chilo_rsi: not enough data for RSI");
            }
            return Ok(StrategyOutput::hold());
        };

        let mut locks = ctx.locks;
        let mut updates = Vec::new();
        let mut push = |locks: &mut StrategyLockState, update: LockUpdate| {
            locks.apply(update);
            updates.push(update);
        };

        if ctx.is_long && !locks.was_overbought && r.rsi >= p.rsi_overbought {
            push(&mut locks, LockUpdate::set(LockFlag::WasOverbought));
        }
        if locks.reentry_locked && r.rsi < p.rsi_reentry {
            push(&mut locks, LockUpdate::clear(LockFlag::ReentryLocked));
        }
        if ctx.is_long && !locks.took_partial_at_threshold && r.rsi >= p.rsi_buy_max {
            push(&mut locks, LockUpdate::set(LockFlag::TookPartialAtThreshold));
        }

        let buy = r.hilo
            && r.rsi < p.rsi_buy_max
            && r.rsi > r.rsi_sma
            && r.trend_ok
            && r.atr_ok
            && !locks.reentry_locked;

        let overbought_pullback = locks.was_overbought && r.rsi < r.rsi_sma;
        let threshold_drop = locks.took_partial_at_threshold && r.rsi < p.rsi_reentry;
        let sell = !r.hilo || overbought_pullback || threshold_drop;

        if ctx.verbose {
            debug!(
                instrument = ctx.symbol,
                rsi = r.rsi,
                rsi_sma = r.rsi_sma,
                hilo = r.hilo,
                trend_ok = r.trend_ok,
                atr_ok = r.atr_ok,
                atr_pct = r.atr_pct,
                reentry_locked = locks.reentry_locked,
                buy,
                overbought_pullback,
                threshold_drop,
                sell,
                "chilo_rsi conditions"
            );
        }

        let signal = if ctx.is_long && sell {
            push(&mut locks, LockUpdate::set(LockFlag::ReentryLocked));
            push(&mut locks, LockUpdate::clear(LockFlag::TookPartialAtThreshold));
            push(&mut locks, LockUpdate::clear(LockFlag::WasOverbought));
            Signal::Sell
        } else if !ctx.is_long && buy {
            Signal::Buy
        } else {
            // No strict condition: keep the current position.
            Signal::from_bool(ctx.is_long)
        };

        Ok(StrategyOutput::with_updates(signal, updates))
    }

    fn exit_updates(&self) -> Vec<LockUpdate> {
        vec![
            LockUpdate::set(LockFlag::ReentryLocked),
            LockUpdate::clear(LockFlag::TookPartialAtThreshold),
            LockUpdate::clear(LockFlag::WasOverbought),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn series(closes: &[f64]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let close = Decimal::from_f64(c).unwrap();
                let spread = Decimal::from_f64(c * 0.002).unwrap();
                Candle {
                    open_time: t0 + Duration::minutes(5 * i as i64),
                    open: close,
                    high: close + spread,
                    low: close - spread,
                    close,
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    fn no_filters() -> ChiloRsiParams {
        ChiloRsiParams {
            rsi_period: 3,
            rsi_sma_period: 3,
            hilo_length: 3,
            hilo_offset: 0,
            use_atr_filter: false,
            ..ChiloRsiParams::default()
        }
    }

    #[test]
    fn too_little_data_holds() {
        let strategy = ChiloRsi::new(ChiloRsiParams::default());
        let ctx = StrategyContext::new("SOLUSDT", false);
        let out = strategy.evaluate(&series(&[100.0; 10]), &ctx).unwrap();
        assert_eq!(out.signal, Signal::Hold);
        assert!(out.updates.is_empty());
    }

    #[test]
    fn flat_without_conditions_stays_out() {
        // steadily falling: HiLo off, nothing to buy
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let strategy = ChiloRsi::new(no_filters());
        let ctx = StrategyContext::new("SOLUSDT", false);
        let out = strategy.evaluate(&series(&closes), &ctx).unwrap();
        assert_eq!(out.signal, Signal::Sell);
        assert!(out.updates.is_empty());
    }

    #[test]
    fn long_exit_locks_reentry_and_clears_flags() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let strategy = ChiloRsi::new(no_filters());
        let mut ctx = StrategyContext::new("SOLUSDT", true);
        ctx.locks = StrategyLockState {
            reentry_locked: false,
            took_partial_at_threshold: true,
            was_overbought: true,
        };
        let out = strategy.evaluate(&series(&closes), &ctx).unwrap();
        assert_eq!(out.signal, Signal::Sell);

        let mut after = ctx.locks;
        for u in &out.updates {
            after.apply(*u);
        }
        assert!(after.reentry_locked);
        assert!(!after.took_partial_at_threshold);
        assert!(!after.was_overbought);
    }

    #[test]
    fn reentry_lock_blocks_buy_while_rsi_is_high() {
        // strong rally: RSI pinned at 100, above every threshold
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let strategy = ChiloRsi::new(no_filters());
        let mut ctx = StrategyContext::new("SOLUSDT", false);
        ctx.locks.reentry_locked = true;
        let out = strategy.evaluate(&series(&closes), &ctx).unwrap();
        // RSI above the buy ceiling and lock still held: stay out, lock kept
        assert_eq!(out.signal, Signal::Sell);
        assert!(out.updates.is_empty());
    }

    #[test]
    fn long_in_overbought_rally_marks_flags_and_holds() {
        // drift down, then a steady rally that flips HiLo on
        let closes: Vec<f64> = (0..40)
            .map(|i| if i < 20 { 100.0 - 0.5 * i as f64 } else { 90.5 + (i - 19) as f64 })
            .collect();
        let strategy = ChiloRsi::new(no_filters());
        let ctx = StrategyContext::new("SOLUSDT", true);
        let out = strategy.evaluate(&series(&closes), &ctx).unwrap();
        assert_eq!(out.signal, Signal::Buy);
        assert!(out.updates.contains(&LockUpdate::set(LockFlag::WasOverbought)));
        assert!(out.updates.contains(&LockUpdate::set(LockFlag::TookPartialAtThreshold)));
    }

    #[test]
    fn forced_exit_updates_lock_reentry() {
        let updates = ChiloRsi::new(ChiloRsiParams::default()).exit_updates();
        assert_eq!(updates[0], LockUpdate::set(LockFlag::ReentryLocked));
        assert_eq!(updates.len(), 3);
    }
}
