use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{highest_high_since, quantize, Candle};
use crate::persistence::TrailingStopState;

/// What one trailing-stop evaluation did to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingDecision {
    /// Freshly armed for a new (or re-observed) buy; never sells this cycle
    Armed,
    /// High-water mark or stop moved up
    Raised,
    /// Nothing changed
    Holding,
    /// Close fell to the stop; state was cleared and the position must be sold
    Triggered,
}

impl TrailingDecision {
    /// Whether the state must be written back
    pub fn is_dirty(&self) -> bool {
        matches!(self, TrailingDecision::Armed | TrailingDecision::Raised)
    }
}

/// Trailing stop that sits `pct` percent below the highest high since entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingStop {
    pct: Decimal,
    price_tick: Decimal,
}

impl TrailingStop {
    pub fn new(pct: Decimal, price_tick: Decimal) -> Self {
        Self { pct, price_tick }
    }

    pub fn stop_for(&self, max_price: Decimal) -> Decimal {
        quantize(
            max_price * (Decimal::ONE - self.pct / Decimal::ONE_HUNDRED),
            self.price_tick,
        )
    }

    /// Advance the trailing state machine for a long position.
    ///
    /// `fallback_buy_time` is the fill time of the live last buy; it seeds the
    /// high-water window whenever the stop is (re)armed.
    pub fn evaluate(
        &self,
        state: &mut TrailingStopState,
        candles: &[Candle],
        last_buy_price: Decimal,
        fallback_buy_time: Option<DateTime<Utc>>,
    ) -> TrailingDecision {
        let Some(close) = candles.last().map(|c| c.close) else {
            return TrailingDecision::Holding;
        };

        // A stale document (different buy) is re-armed from observations.
        let needs_arm = !state.is_armed || state.reference_buy_price != last_buy_price;
        let buy_time = if needs_arm {
            fallback_buy_time
        } else {
            state.last_buy_time.or(fallback_buy_time)
        };
        let high_since_buy = buy_time
            .and_then(|t| highest_high_since(candles, t))
            .unwrap_or_else(|| close.max(last_buy_price));

        if needs_arm {
            *state = TrailingStopState {
                max_price_since_buy: high_since_buy,
                trailing_stop_price: self.stop_for(high_since_buy),
                reference_buy_price: last_buy_price,
                is_armed: true,
                last_buy_time: buy_time,
            };
            return TrailingDecision::Armed;
        }

        let mut decision = TrailingDecision::Holding;
        if high_since_buy > state.max_price_since_buy {
            state.max_price_since_buy = high_since_buy;
            decision = TrailingDecision::Raised;
        }
        // Also picks up a changed percentage without a new high.
        let stop = self.stop_for(state.max_price_since_buy);
        if stop != state.trailing_stop_price {
            state.trailing_stop_price = stop;
            decision = TrailingDecision::Raised;
        }

        if close <= state.trailing_stop_price {
            *state = TrailingStopState::default();
            return TrailingDecision::Triggered;
        }
        decision
    }
}
