use rust_decimal::Decimal;

use crate::domain::Candle;

/// Stateless stop-loss check.
///
/// Fires only when the last `confirm_candles` closes all sit below
/// `last_buy_price * (1 - pct/100)`, so a single noisy print cannot force a
/// liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopLoss {
    pct: Decimal,
    confirm_candles: usize,
}

impl StopLoss {
    pub fn new(pct: Decimal, confirm_candles: usize) -> Self {
        Self {
            pct,
            confirm_candles: confirm_candles.max(1),
        }
    }

    pub fn threshold(&self, last_buy_price: Decimal) -> Decimal {
        last_buy_price * (Decimal::ONE - self.pct / Decimal::ONE_HUNDRED)
    }

    pub fn is_triggered(&self, candles: &[Candle], last_buy_price: Decimal) -> bool {
        if last_buy_price <= Decimal::ZERO || candles.len() < self.confirm_candles {
            return false;
        }
        let threshold = self.threshold(last_buy_price);
        candles[candles.len() - self.confirm_candles..]
            .iter()
            .all(|c| c.close < threshold)
    }
}
