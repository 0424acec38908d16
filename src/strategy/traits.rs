//! Core strategy traits and types
//!
//! A strategy is a pure function of the candle series and a read-only view of
//! the controller. Cross-cycle memory goes through the persisted lock flags:
//! the strategy returns the flag transitions it wants and the engine applies
//! them, nothing is mutated in place.

use rust_decimal::Decimal;

use crate::domain::{Candle, Signal};
use crate::error::Result;
pub use crate::persistence::{LockFlag, LockUpdate, StrategyLockState};

// ============================================================================
// Strategy Trait
// ============================================================================

/// Uniform interface every signal strategy implements
pub trait Strategy: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Decide on the causal prefix `series` (the last candle is "now").
    fn evaluate(&self, series: &[Candle], ctx: &StrategyContext<'_>) -> Result<StrategyOutput>;

    /// Flag transitions to apply when the position is closed by a forced exit
    /// (stop-loss or trailing stop) rather than by this strategy.
    fn exit_updates(&self) -> Vec<LockUpdate> {
        Vec::new()
    }
}

// ============================================================================
// Evaluation context
// ============================================================================

/// Read-only controller view handed to a strategy
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub symbol: &'a str,
    pub is_long: bool,
    pub last_buy_price: Decimal,
    /// Flags as persisted before this evaluation
    pub locks: StrategyLockState,
    /// Emit condition breakdowns at debug level
    pub verbose: bool,
}

impl<'a> StrategyContext<'a> {
    pub fn new(symbol: &'a str, is_long: bool) -> Self {
        Self {
            symbol,
            is_long,
            last_buy_price: Decimal::ZERO,
            locks: StrategyLockState::default(),
            verbose: false,
        }
    }
}

// ============================================================================
// Evaluation result
// ============================================================================

/// Decision plus the flag transitions the engine must persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOutput {
    pub signal: Signal,
    pub updates: Vec<LockUpdate>,
}

impl StrategyOutput {
    pub fn signal(signal: Signal) -> Self {
        Self {
            signal,
            updates: Vec::new(),
        }
    }

    pub fn hold() -> Self {
        Self::signal(Signal::Hold)
    }

    pub fn with_updates(signal: Signal, updates: Vec<LockUpdate>) -> Self {
        Self { signal, updates }
    }
}
