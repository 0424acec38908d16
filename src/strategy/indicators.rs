//! Indicator helpers over `f64` series.
//!
//! Undefined leading values are `NaN`, and every comparison against `NaN` is
//! false, so callers can compare freely without unwrapping.

use crate::domain::Candle;

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::close_f64).collect()
}

pub fn highs(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::high_f64).collect()
}

pub fn lows(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::low_f64).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::volume_f64).collect()
}

/// Last element, `NaN` when empty
pub fn last(series: &[f64]) -> f64 {
    series.last().copied().unwrap_or(f64::NAN)
}

/// Rolling mean; `NaN` until `period` values are available or when the
/// window holds a `NaN`.
pub fn sma(series: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..series.len() {
        let window = &series[i + 1 - period..=i];
        if window.iter().all(|v| !v.is_nan()) {
            out[i] = window.iter().sum::<f64>() / period as f64;
        }
    }
    out
}

/// Exponential moving average seeded with the first value
/// (`alpha = 2 / (span + 1)`, no bias adjustment).
pub fn ema(series: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    smooth(series, alpha, 1)
}

/// Recursive smoothing `y = (1 - alpha) * y_prev + alpha * x`, starting at the
/// first non-`NaN` value and reported once `min_periods` observations were seen.
fn smooth(series: &[f64], alpha: f64, min_periods: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    let mut acc: Option<f64> = None;
    let mut seen = 0usize;
    for (i, &x) in series.iter().enumerate() {
        if x.is_nan() {
            if seen >= min_periods {
                out[i] = acc.unwrap_or(f64::NAN);
            }
            continue;
        }
        seen += 1;
        let next = match acc {
            Some(prev) => (1.0 - alpha) * prev + alpha * x,
            None => x,
        };
        acc = Some(next);
        if seen >= min_periods {
            out[i] = next;
        }
    }
    out
}

/// Wilder RSI: gains and losses smoothed with `alpha = 1 / period`.
///
/// First defined at index `period`. A flat window (no gains, no losses) is
/// undefined; a window without losses is 100.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || n == 0 {
        return vec![f64::NAN; n];
    }
    let mut gains = vec![f64::NAN; n];
    let mut losses = vec![f64::NAN; n];
    for i in 1..n {
        let delta = closes[i] - closes[i - 1];
        if !delta.is_nan() {
            gains[i] = delta.max(0.0);
            losses[i] = (-delta).max(0.0);
        }
    }
    let alpha = 1.0 / period as f64;
    let avg_gain = smooth(&gains, alpha, period);
    let avg_loss = smooth(&losses, alpha, period);

    avg_gain
        .iter()
        .zip(&avg_loss)
        .map(|(&g, &l)| {
            if g.is_nan() || l.is_nan() || (g == 0.0 && l == 0.0) {
                f64::NAN
            } else if l == 0.0 {
                100.0
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

/// True range; the first bar has no previous close and uses `high - low`.
pub fn true_range(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    (0..highs.len())
        .map(|i| {
            let hl = highs[i] - lows[i];
            if i == 0 {
                return hl;
            }
            let prev = closes[i - 1];
            hl.max((highs[i] - prev).abs()).max((lows[i] - prev).abs())
        })
        .collect()
}

/// Average true range as a plain rolling mean of the true range
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    sma(&true_range(highs, lows, closes), period)
}

/// Sign as used by crossover detection; `NaN` stays `NaN`
pub fn sign(x: f64) -> f64 {
    if x.is_nan() {
        f64::NAN
    } else if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
