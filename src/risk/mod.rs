//! Forced-exit triggers, evaluated in strict order before any strategy
//! decision: stop-loss, trailing stop, then take-profit.

mod stop_loss;
mod take_profit;
mod trailing_stop;

pub use stop_loss::StopLoss;
pub use take_profit::{TakeProfitLadder, TakeProfitRung};
pub use trailing_stop::{TrailingDecision, TrailingStop};
