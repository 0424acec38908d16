use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::{self, closes, highs, lows};
use super::traits::{Strategy, StrategyContext, StrategyOutput};
use crate::domain::{Candle, Signal};
use crate::error::Result;

/// Moving average used for the HiLo bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaType {
    #[default]
    Sma,
    Ema,
}

impl MaType {
    pub fn apply(&self, series: &[f64], period: usize) -> Vec<f64> {
        match self {
            MaType::Sma => indicators::sma(series, period),
            MaType::Ema => indicators::ema(series, period),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiLoParams {
    pub length: usize,
    pub offset: usize,
    pub ma_type: MaType,
}

impl Default for HiLoParams {
    fn default() -> Self {
        Self {
            length: 34,
            offset: 0,
            ma_type: MaType::Sma,
        }
    }
}

/// HiLo activator state on the last candle.
///
/// The bands are moving averages of highs (`hima`) and lows (`loma`), shifted
/// back by `offset`. A close crossing above the high band turns the state on,
/// a close crossing below the low band turns it off, and it is carried
/// otherwise. `None` when the series is too short.
pub fn hilo_state(
    closes: &[f64],
    highs: &[f64],
    lows: &[f64],
    length: usize,
    offset: usize,
    ma_type: MaType,
) -> Option<bool> {
    let n = closes.len();
    if length == 0 || n < length + offset + 1 {
        return None;
    }
    let hima = ma_type.apply(highs, length);
    let loma = ma_type.apply(lows, length);

    let band = |bands: &[f64], i: usize| -> f64 {
        if i >= offset {
            bands[i - offset]
        } else {
            f64::NAN
        }
    };
    let buy_arith = |i: usize| indicators::sign(closes[i] - band(&hima, i));
    let sell_arith = |i: usize| indicators::sign(closes[i] - band(&loma, i));

    let mut state = false;
    for i in 1..n {
        let (prev_buy, cur_buy) = (buy_arith(i - 1), buy_arith(i));
        let (prev_sell, cur_sell) = (sell_arith(i - 1), sell_arith(i));
        if prev_buy <= 0.5 && cur_buy > 0.5 {
            state = true;
        } else if prev_sell >= -0.5 && cur_sell < -0.5 {
            state = false;
        }
    }
    Some(state)
}

/// HiLo activator on candles
pub fn hilo_signal(series: &[Candle], params: &HiLoParams) -> Option<bool> {
    hilo_state(
        &closes(series),
        &highs(series),
        &lows(series),
        params.length,
        params.offset,
        params.ma_type,
    )
}

/// Plain HiLo crossover strategy: Buy while the activator is on, Sell while off
#[derive(Debug, Clone)]
pub struct HiLo {
    params: HiLoParams,
}

impl HiLo {
    pub fn new(params: HiLoParams) -> Self {
        Self { params }
    }
}

impl Strategy for HiLo {
    fn name(&self) -> &str {
        "hilo"
    }

    fn evaluate(&self, series: &[Candle], ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
        let Some(state) = hilo_signal(series, &self.params) else {
            if ctx.verbose {
                debug!(instrument = ctx.symbol, candles = series.len(), "hilo: not enough candles");
            }
            return Ok(StrategyOutput::hold());
        };
        if ctx.verbose {
            debug!(instrument = ctx.symbol, state, "hilo evaluated");
        }
        Ok(StrategyOutput::signal(Signal::from_bool(state)))
    }
}
