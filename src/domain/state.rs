use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position view derived from the exchange at the start of every cycle.
///
/// Nothing here is trusted across cycles: the controller rebuilds it from
/// balances and order history each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Holding at least one quantity step of the base asset
    pub is_long: bool,
    /// Base asset balance (free + locked)
    pub account_balance: Decimal,
    pub last_buy_price: Decimal,
    pub last_sell_price: Decimal,
    /// Fill time of the most recent filled buy, if any
    pub last_buy_time: Option<DateTime<Utc>>,
    /// Quantity already executed on still-open orders
    pub partial_fill_carry: Decimal,
}

impl PositionState {
    /// Long/flat is decided against the minimum tradable unit, never from memory.
    pub fn derive_is_long(balance: Decimal, qty_step: Decimal) -> bool {
        balance >= qty_step && balance > Decimal::ZERO
    }

    /// Unrealized gain of `close` over the last buy, in percent
    pub fn gain_pct(&self, close: Decimal) -> Option<Decimal> {
        if self.last_buy_price <= Decimal::ZERO {
            return None;
        }
        Some((close - self.last_buy_price) / self.last_buy_price * Decimal::ONE_HUNDRED)
    }
}

/// Strategy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    /// Inconclusive: the strategy has no opinion this candle
    Hold,
}

impl Signal {
    pub fn from_bool(buy: bool) -> Self {
        if buy {
            Signal::Buy
        } else {
            Signal::Sell
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Signal::Hold)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
            Signal::Hold => write!(f, "hold"),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickAction {
    Hold,
    Buy,
    Sell,
}

/// Which branch of the cycle produced the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickReason {
    Paused,
    StopLoss,
    TrailingStop,
    TakeProfit,
    Strategy,
    /// Strategy agreed with the current position, or had no opinion
    NoChange,
    /// The cycle failed and was skipped
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub action: TickAction,
    pub reason: TickReason,
    pub sleep: Duration,
}

impl TickOutcome {
    pub fn hold(reason: TickReason, sleep: Duration) -> Self {
        Self {
            action: TickAction::Hold,
            reason,
            sleep,
        }
    }

    pub fn traded(&self) -> bool {
        self.action != TickAction::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_requires_one_full_step() {
        assert!(PositionState::derive_is_long(dec!(0.001), dec!(0.001)));
        assert!(!PositionState::derive_is_long(dec!(0.0009), dec!(0.001)));
        assert!(!PositionState::derive_is_long(Decimal::ZERO, Decimal::ZERO));
    }

    #[test]
    fn gain_pct_needs_a_buy_price() {
        let mut state = PositionState::default();
        assert_eq!(state.gain_pct(dec!(105)), None);
        state.last_buy_price = dec!(100);
        assert_eq!(state.gain_pct(dec!(105)), Some(dec!(5)));
    }
}
