use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::{self, closes};
use super::traits::{Strategy, StrategyContext, StrategyOutput};
use crate::domain::{Candle, Signal};
use crate::error::Result;

/// Tolerance above the local minimum that still counts as "at the bottom"
const BUY_TOLERANCE: f64 = 1.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaMicroParams {
    /// Look-back for the local minimum (and the EMA span)
    pub window: usize,
    /// Sell once the close is this many percent above the local minimum
    pub profit_target_pct: f64,
}

impl Default for EmaMicroParams {
    fn default() -> Self {
        Self {
            window: 3,
            profit_target_pct: 1.0,
        }
    }
}

/// Micro-trade strategy: buy at a local minimum, sell at a small profit over
/// it, no opinion in between.
#[derive(Debug, Clone)]
pub struct EmaMicro {
    params: EmaMicroParams,
}

impl EmaMicro {
    pub fn new(params: EmaMicroParams) -> Self {
        Self { params }
    }
}

impl Strategy for EmaMicro {
    fn name(&self) -> &str {
        "ema_micro"
    }

    fn evaluate(&self, series: &[Candle], ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
        let window = self.params.window;
        if window == 0 || series.len() < window {
            return Ok(StrategyOutput::hold());
        }
        let close = closes(series);
        let current = indicators::last(&close);
        let recent_min = close[close.len() - window..]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let target = recent_min * (1.0 + self.params.profit_target_pct / 100.0);

        let signal = if current <= recent_min * BUY_TOLERANCE {
            Signal::Buy
        } else if current >= target {
            Signal::Sell
        } else {
            Signal::Hold
        };

        if ctx.verbose {
            let ema = indicators::last(&indicators::ema(&close, window));
            debug!(
                instrument = ctx.symbol,
                ema,
                close = current,
                recent_min,
                target,
                %signal,
                "ema_micro evaluated"
            );
        }
        Ok(StrategyOutput::signal(signal))
    }
}
