//! Strategy module
//!
//! Signal strategies and the engine that composes them.
//!
//! ## Architecture
//!
//! - `traits` - the uniform `Strategy` interface and its context/output types
//! - `indicators` - `f64` indicator helpers (RSI, SMA, EMA, ATR)
//! - `chilo_rsi`, `hilo`, `ema_micro`, `fixed` - concrete strategies
//! - `engine` - primary + fallback composition and lock-flag persistence

// =============================================================================
// Strategy trait and core types
// =============================================================================

pub mod traits;

pub use traits::{LockFlag, LockUpdate, Strategy, StrategyContext, StrategyLockState, StrategyOutput};

// =============================================================================
// Strategies
// =============================================================================

pub mod chilo_rsi;
pub mod ema_micro;
pub mod fixed;
pub mod hilo;
pub mod indicators;

pub use chilo_rsi::{ChiloRsi, ChiloRsiParams};
pub use ema_micro::{EmaMicro, EmaMicroParams};
pub use fixed::{Fixed, FixedParams};
pub use hilo::{hilo_signal, HiLo, HiLoParams, MaType};

// =============================================================================
// Composition
// =============================================================================

pub mod engine;
pub mod factory;

pub use engine::{StrategyEngine, StrategyView};
pub use factory::build_strategy;
