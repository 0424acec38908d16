//! Runtime coordination: one task per instrument plus cooperative shutdown.

pub mod runner;
pub mod shutdown;

pub use runner::{RunSummary, TradingRunner};
pub use shutdown::{install_signal_handlers, Shutdown, ShutdownSignal};
