//! Multi-instrument trading runtime.
//!
//! One tokio task per controller. With `serialize_instruments` every cycle
//! runs under a single global lock, so instruments sharing an account never
//! interleave their exchange calls.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::shutdown::Shutdown;
use crate::domain::TickReason;
use crate::error::{Result, RoboError};
use crate::trader::PositionController;

/// Per-instrument totals reported when a task stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub symbol: String,
    pub cycles: u64,
    pub orders: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct TradingRunner {
    serialize: bool,
    max_cycles: Option<u64>,
}

impl TradingRunner {
    pub fn new(serialize: bool) -> Self {
        Self {
            serialize,
            max_cycles: None,
        }
    }

    /// Stop each task after `cycles` ticks
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Drive every controller until shutdown (or the cycle cap) and return
    /// one summary per instrument, in completion order.
    pub async fn run(&self, controllers: Vec<PositionController>, shutdown: Shutdown) -> Result<Vec<RunSummary>> {
        if controllers.is_empty() {
            return Err(RoboError::InvalidConfig("no instruments to trade".to_string()));
        }

        let cycle_lock = self.serialize.then(|| Arc::new(Mutex::new(())));
        info!(
            instruments = controllers.len(),
            serialized = self.serialize,
            "trading runner started"
        );

        let mut tasks = JoinSet::new();
        for controller in controllers {
            tasks.spawn(drive(
                controller,
                shutdown.clone(),
                cycle_lock.clone(),
                self.max_cycles,
            ));
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => {
                    info!(
                        instrument = %summary.symbol,
                        cycles = summary.cycles,
                        orders = summary.orders,
                        errors = summary.errors,
                        "trading task stopped"
                    );
                    summaries.push(summary);
                }
                Err(e) => error!(error = %e, "trading task panicked"),
            }
        }
        Ok(summaries)
    }
}

async fn drive(
    mut controller: PositionController,
    shutdown: Shutdown,
    cycle_lock: Option<Arc<Mutex<()>>>,
    max_cycles: Option<u64>,
) -> RunSummary {
    let mut summary = RunSummary {
        symbol: controller.symbol().to_string(),
        ..RunSummary::default()
    };

    while !shutdown.is_shutdown_requested() {
        if max_cycles.is_some_and(|max| summary.cycles >= max) {
            break;
        }

        let outcome = match &cycle_lock {
            Some(lock) => {
                let _guard = lock.lock().await;
                controller.tick().await
            }
            None => controller.tick().await,
        };
        summary.cycles += 1;
        if outcome.traded() {
            summary.orders += 1;
        }
        if outcome.reason == TickReason::Error {
            summary.errors += 1;
        }
        debug!(
            instrument = %summary.symbol,
            action = ?outcome.action,
            reason = ?outcome.reason,
            sleep_secs = outcome.sleep.as_secs(),
            "cycle finished"
        );

        tokio::select! {
            _ = tokio::time::sleep(outcome.sleep) => {}
            _ = shutdown.wait() => break,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstrumentConfig, StrategySpec};
    use crate::coordination::ShutdownSignal;
    use crate::domain::{Candle, Instrument, InstrumentRules, Signal};
    use crate::exchange::{ExchangeGateway, PaperExchange};
    use crate::persistence::{MemoryStateStore, StateStore};
    use crate::strategy::FixedParams;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn history() -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..10)
            .map(|i| Candle {
                open_time: t0 + Duration::minutes(5 * i),
                open: dec!(100),
                high: dec!(100),
                low: dec!(100),
                close: dec!(100),
                volume: dec!(1),
            })
            .collect()
    }

    async fn controllers() -> Vec<PositionController> {
        let rules = InstrumentRules {
            price_tick: dec!(0.01),
            qty_step: dec!(0.001),
        };
        let gateway: Arc<dyn ExchangeGateway> = Arc::new(
            PaperExchange::new()
                .with_balance("USDT", dec!(1000))
                .with_market(Instrument::new("SOL", "USDT", rules), history())
                .with_market(Instrument::new("ETH", "USDT", rules), history()),
        );
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let mut out = Vec::new();
        for base in ["SOL", "ETH"] {
            let mut config = InstrumentConfig::new(base, "USDT", dec!(1));
            config.strategy.primary = StrategySpec::Fixed(FixedParams { decision: Signal::Hold });
            config.strategy.fallback_enabled = false;
            config.execution.cycle_interval_secs = 0;
            out.push(
                PositionController::connect(gateway.clone(), store.clone(), config)
                    .await
                    .unwrap(),
            );
        }
        out
    }

    #[tokio::test]
    async fn every_instrument_runs_its_own_cycles() {
        let summaries = TradingRunner::new(true)
            .with_max_cycles(3)
            .run(controllers().await, Shutdown::new())
            .await
            .unwrap();

        assert_eq!(summaries.len(), 2);
        for summary in &summaries {
            assert_eq!(summary.cycles, 3);
            assert_eq!(summary.orders, 0);
            assert_eq!(summary.errors, 0);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_tasks_before_the_next_cycle() {
        let shutdown = Shutdown::new();
        shutdown.request_shutdown(ShutdownSignal::Internal);
        let summaries = TradingRunner::new(false)
            .run(controllers().await, shutdown)
            .await
            .unwrap();
        assert!(summaries.iter().all(|s| s.cycles == 0));
    }

    #[tokio::test]
    async fn empty_runtime_is_a_config_error() {
        let err = TradingRunner::new(true).run(Vec::new(), Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, RoboError::InvalidConfig(_)));
    }
}
