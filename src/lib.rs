pub mod backtest;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod trader;

pub use backtest::{BacktestReplayEngine, BacktestReport};
pub use config::AppConfig;
pub use coordination::{Shutdown, ShutdownSignal, TradingRunner};
pub use error::{Result, RoboError};
pub use exchange::{ExchangeGateway, PaperExchange};
pub use persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
pub use strategy::{Strategy, StrategyEngine};
pub use trader::PositionController;
