//! Persisted per-instrument state.
//!
//! Only the trailing-stop document and the strategy lock flags outlive a
//! cycle; everything else is re-derived from the exchange.

pub mod documents;
pub mod snapshot;
pub mod store;

pub use documents::{
    delete_document, load_document, save_document, Document, LockFlag, LockUpdate, StrategyLockState,
    TakeProfitState, TrailingStopState,
};
pub use snapshot::StateSnapshot;
pub use store::{JsonFileStateStore, MemoryStateStore, StateStore};

use std::sync::Arc;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

/// Open the configured backing store
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!(backend = "memory", "state store opened");
            Ok(Arc::new(MemoryStateStore::new()))
        }
        StoreBackend::File => {
            let store = JsonFileStateStore::open(&config.path)?;
            info!(backend = "file", path = %store.root().display(), "state store opened");
            Ok(Arc::new(store))
        }
    }
}
