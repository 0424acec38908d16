//! Historical replay of the strategy stack.

mod engine;

pub use engine::{BacktestFill, BacktestReplayEngine, BacktestReport, ForcedExit, MIN_REPLAY_WINDOW};

use std::fs;
use std::path::Path;

use crate::domain::Candle;
use crate::error::{Result, RoboError};

/// Load a candle file: a JSON array of candles, oldest first.
pub fn load_candles<P: AsRef<Path>>(path: P) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    let mut candles: Vec<Candle> = serde_json::from_str(&raw)?;
    if candles.is_empty() {
        return Err(RoboError::InsufficientData(format!("{}: no candles", path.display())));
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}
