use serde_json::{Map, Value};

use super::StateStore;
use crate::error::Result;

/// Point-in-time copy of specific documents.
///
/// Wraps diagnostic re-evaluations so they cannot leave lasting writes behind:
/// capture the touched keys, run, then restore.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct SnapshotEntry {
    collection: String,
    key: String,
    value: Option<Value>,
}

impl StateSnapshot {
    /// Copy the listed `(collection, key)` documents
    pub async fn capture(store: &dyn StateStore, keys: &[(&str, &str)]) -> Result<Self> {
        let mut entries = Vec::with_capacity(keys.len());
        for (collection, key) in keys {
            entries.push(SnapshotEntry {
                collection: (*collection).to_string(),
                key: (*key).to_string(),
                value: store.get(collection, key).await?,
            });
        }
        Ok(Self { entries })
    }

    /// Put every captured document back exactly as it was
    pub async fn restore(&self, store: &dyn StateStore) -> Result<()> {
        for entry in &self.entries {
            store.delete(&entry.collection, &entry.key).await?;
            if let Some(value) = &entry.value {
                let fields = match value {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other.clone());
                        map
                    }
                };
                store.upsert(&entry.collection, &entry.key, fields).await?;
            }
        }
        Ok(())
    }
}
