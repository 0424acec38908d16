use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use super::factory::build_strategy;
use super::traits::{LockUpdate, Strategy, StrategyContext, StrategyLockState};
use crate::config::StrategyConfig;
use crate::domain::{Candle, Signal};
use crate::error::Result;
use crate::persistence::{load_document, Document, StateStore};

/// Controller state the engine forwards to strategies
#[derive(Debug, Clone, Copy)]
pub struct StrategyView<'a> {
    /// Instrument symbol, also the lock document key
    pub key: &'a str,
    pub is_long: bool,
    pub last_buy_price: Decimal,
    pub verbose: bool,
}

impl<'a> StrategyView<'a> {
    pub fn new(key: &'a str, is_long: bool) -> Self {
        Self {
            key,
            is_long,
            last_buy_price: Decimal::ZERO,
            verbose: false,
        }
    }
}

/// Primary strategy with an optional fallback, plus the lock-flag bookkeeping.
///
/// The primary runs first; only when it has no opinion (Hold) does the
/// fallback run, seeing the flags as the primary left them. Flag updates are
/// persisted as partial documents so unrelated fields are never clobbered.
pub struct StrategyEngine {
    primary: Box<dyn Strategy>,
    fallback: Option<Box<dyn Strategy>>,
    store: Arc<dyn StateStore>,
}

impl StrategyEngine {
    pub fn new(
        primary: Box<dyn Strategy>,
        fallback: Option<Box<dyn Strategy>>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            primary,
            fallback,
            store,
        }
    }

    pub fn from_config(config: &StrategyConfig, store: Arc<dyn StateStore>) -> Self {
        let primary = build_strategy(&config.primary);
        let fallback = if config.fallback_enabled {
            config.fallback.as_ref().map(build_strategy)
        } else {
            None
        };
        Self::new(primary, fallback, store)
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> Option<&str> {
        self.fallback.as_deref().map(|s| s.name())
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Decide on `series` for the instrument behind `view`.
    pub async fn evaluate(&self, series: &[Candle], view: StrategyView<'_>) -> Result<Signal> {
        let mut locks = self.lock_state(view.key).await;

        let signal = self.run(self.primary.as_ref(), series, view, &mut locks).await?;
        if !signal.is_hold() {
            return Ok(signal);
        }

        match &self.fallback {
            Some(fallback) => {
                let signal = self.run(fallback.as_ref(), series, view, &mut locks).await?;
                debug!(
                    instrument = view.key,
                    strategy = fallback.name(),
                    %signal,
                    "primary had no opinion, fallback decided"
                );
                Ok(signal)
            }
            None => Ok(signal),
        }
    }

    /// Apply the forced-exit flag transitions of every configured strategy.
    pub async fn record_exit(&self, key: &str) -> Result<()> {
        let mut updates: Vec<LockUpdate> = self.primary.exit_updates();
        if let Some(fallback) = &self.fallback {
            updates.extend(fallback.exit_updates());
        }
        let locks = self.lock_state(key).await;
        self.persist(key, &locks, &updates).await
    }

    /// Current persisted flags; missing or corrupt documents read as cleared.
    pub async fn lock_state(&self, key: &str) -> StrategyLockState {
        load_document::<StrategyLockState>(self.store.as_ref(), key).await
    }

    async fn run(
        &self,
        strategy: &dyn Strategy,
        series: &[Candle],
        view: StrategyView<'_>,
        locks: &mut StrategyLockState,
    ) -> Result<Signal> {
        let ctx = StrategyContext {
            symbol: view.key,
            is_long: view.is_long,
            last_buy_price: view.last_buy_price,
            locks: *locks,
            verbose: view.verbose,
        };
        let output = strategy.evaluate(series, &ctx)?;
        self.persist(view.key, locks, &output.updates).await?;
        for update in &output.updates {
            locks.apply(*update);
        }
        debug!(
            instrument = view.key,
            strategy = strategy.name(),
            signal = %output.signal,
            is_long = view.is_long,
            "strategy evaluated"
        );
        Ok(output.signal)
    }

    async fn persist(&self, key: &str, locks: &StrategyLockState, updates: &[LockUpdate]) -> Result<()> {
        let fields = locks.diff(updates);
        if fields.is_empty() {
            return Ok(());
        }
        info!(instrument = key, changes = ?fields, "strategy flags updated");
        self.store.upsert(StrategyLockState::COLLECTION, key, fields).await
    }
}
