use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::StateStore;
use crate::error::{Result, RoboError};

/// A typed document living in one collection, keyed by instrument symbol
pub trait Document: Serialize + DeserializeOwned + Default + Send + Sync {
    const COLLECTION: &'static str;
}

/// Load a document, falling back to its default when it is missing or unreadable.
///
/// A corrupt or missing document means "never armed / flags cleared"; it must
/// never take the cycle down.
pub async fn load_document<T: Document>(store: &dyn StateStore, key: &str) -> T {
    match store.get(T::COLLECTION, key).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(collection = T::COLLECTION, key, error = %e, "corrupt document, using defaults");
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            warn!(collection = T::COLLECTION, key, error = %e, "document read failed, using defaults");
            T::default()
        }
    }
}

/// Write every field of `doc`
pub async fn save_document<T: Document>(store: &dyn StateStore, key: &str, doc: &T) -> Result<()> {
    match serde_json::to_value(doc)? {
        Value::Object(fields) => store.upsert(T::COLLECTION, key, fields).await,
        _ => Err(RoboError::Internal(format!(
            "{} documents must serialize to an object",
            T::COLLECTION
        ))),
    }
}

pub async fn delete_document<T: Document>(store: &dyn StateStore, key: &str) -> Result<()> {
    store.delete(T::COLLECTION, key).await
}

// ============================================================================
// Trailing stop
// ============================================================================

/// Persisted trailing-stop state for one instrument.
///
/// While armed, `trailing_stop_price` is the quantized stop derived from
/// `max_price_since_buy`, and the max never decreases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopState {
    pub max_price_since_buy: Decimal,
    pub trailing_stop_price: Decimal,
    /// Buy price the stop was armed for
    pub reference_buy_price: Decimal,
    pub is_armed: bool,
    pub last_buy_time: Option<DateTime<Utc>>,
}

impl Document for TrailingStopState {
    const COLLECTION: &'static str = "trailing_stop";
}

// ============================================================================
// Take-profit ladder
// ============================================================================

/// Persisted take-profit cursor for one instrument.
///
/// Only written after a rung's sell filled; removed once the position is flat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitState {
    pub next_index: usize,
}

impl Document for TakeProfitState {
    const COLLECTION: &'static str = "take_profit";
}

// ============================================================================
// Strategy lock flags
// ============================================================================

/// One of the three persisted strategy flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockFlag {
    /// Blocks re-entry right after an exit
    ReentryLocked,
    /// Momentum crossed the partial-profit threshold while long
    TookPartialAtThreshold,
    /// Momentum crossed the overbought threshold while long
    WasOverbought,
}

impl LockFlag {
    pub fn field_name(&self) -> &'static str {
        match self {
            LockFlag::ReentryLocked => "reentry_locked",
            LockFlag::TookPartialAtThreshold => "took_partial_at_threshold",
            LockFlag::WasOverbought => "was_overbought",
        }
    }
}

/// A requested flag transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockUpdate {
    pub flag: LockFlag,
    pub value: bool,
}

impl LockUpdate {
    pub fn set(flag: LockFlag) -> Self {
        Self { flag, value: true }
    }

    pub fn clear(flag: LockFlag) -> Self {
        Self { flag, value: false }
    }
}

/// Persisted strategy flags for one instrument
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyLockState {
    pub reentry_locked: bool,
    pub took_partial_at_threshold: bool,
    pub was_overbought: bool,
}

impl Document for StrategyLockState {
    const COLLECTION: &'static str = "strategy_locks";
}

impl StrategyLockState {
    pub fn get(&self, flag: LockFlag) -> bool {
        match flag {
            LockFlag::ReentryLocked => self.reentry_locked,
            LockFlag::TookPartialAtThreshold => self.took_partial_at_threshold,
            LockFlag::WasOverbought => self.was_overbought,
        }
    }

    pub fn apply(&mut self, update: LockUpdate) {
        match update.flag {
            LockFlag::ReentryLocked => self.reentry_locked = update.value,
            LockFlag::TookPartialAtThreshold => self.took_partial_at_threshold = update.value,
            LockFlag::WasOverbought => self.was_overbought = update.value,
        }
    }

    /// Partial-field document holding only the updates that change something
    pub fn diff(&self, updates: &[LockUpdate]) -> Map<String, Value> {
        let mut next = *self;
        let mut fields = Map::new();
        for update in updates {
            if next.get(update.flag) != update.value {
                next.apply(*update);
                fields.insert(update.flag.field_name().to_string(), Value::Bool(update.value));
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStateStore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[tokio::test]
    async fn missing_or_corrupt_documents_load_as_default() {
        let store = MemoryStateStore::new();
        let state: TrailingStopState = load_document(&store, "SOLUSDT").await;
        assert!(!state.is_armed);

        let mut junk = Map::new();
        junk.insert("is_armed".into(), json!("definitely"));
        store.upsert(TrailingStopState::COLLECTION, "SOLUSDT", junk).await.unwrap();
        let state: TrailingStopState = load_document(&store, "SOLUSDT").await;
        assert_eq!(state, TrailingStopState::default());
    }

    #[tokio::test]
    async fn partial_documents_fill_missing_fields() {
        let store = MemoryStateStore::new();
        let mut fields = Map::new();
        fields.insert("was_overbought".into(), json!(true));
        store.upsert(StrategyLockState::COLLECTION, "SOLUSDT", fields).await.unwrap();
        let locks: StrategyLockState = load_document(&store, "SOLUSDT").await;
        assert!(locks.was_overbought);
        assert!(!locks.reentry_locked);
    }

    #[tokio::test]
    async fn trailing_state_round_trips_through_store() {
        let store = MemoryStateStore::new();
        let state = TrailingStopState {
            max_price_since_buy: dec!(110),
            trailing_stop_price: dec!(107.8),
            reference_buy_price: dec!(100),
            is_armed: true,
            last_buy_time: None,
        };
        save_document(&store, "SOLUSDT", &state).await.unwrap();
        let loaded: TrailingStopState = load_document(&store, "SOLUSDT").await;
        assert_eq!(loaded, state);

        delete_document::<TrailingStopState>(&store, "SOLUSDT").await.unwrap();
        let loaded: TrailingStopState = load_document(&store, "SOLUSDT").await;
        assert!(!loaded.is_armed);
    }

    #[tokio::test]
    async fn take_profit_cursor_survives_reload() {
        let store = MemoryStateStore::new();
        save_document(&store, "SOLUSDT", &TakeProfitState { next_index: 2 }).await.unwrap();
        let loaded: TakeProfitState = load_document(&store, "SOLUSDT").await;
        assert_eq!(loaded.next_index, 2);

        let other: TakeProfitState = load_document(&store, "ETHUSDT").await;
        assert_eq!(other.next_index, 0);
    }

    #[test]
    fn diff_skips_no_op_updates() {
        let locks = StrategyLockState {
            reentry_locked: true,
            ..Default::default()
        };
        let fields = locks.diff(&[
            LockUpdate::set(LockFlag::ReentryLocked),
            LockUpdate::set(LockFlag::WasOverbought),
            LockUpdate::set(LockFlag::WasOverbought),
        ]);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("was_overbought"), Some(&json!(true)));
    }
}
