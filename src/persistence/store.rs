use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, RoboError};

/// Key/value document store partitioned by `(collection, key)`.
///
/// Writes are atomic per key, and writers on different keys never wait on
/// each other.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current document, if any
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Merge `fields` into the document, creating it when missing
    async fn upsert(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()>;

    /// Remove the document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;
}

fn merge(existing: Option<Value>, fields: Map<String, Value>) -> Value {
    match existing {
        Some(Value::Object(mut doc)) => {
            doc.extend(fields);
            Value::Object(doc)
        }
        _ => Value::Object(fields),
    }
}

// ============================================================================
// In-memory backing
// ============================================================================

/// Process-local store, used by backtests and tests
#[derive(Default)]
pub struct MemoryStateStore {
    docs: DashMap<(String, String), Value>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .docs
            .get(&(collection.to_string(), key.to_string()))
            .map(|doc| doc.value().clone()))
    }

    async fn upsert(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self
            .docs
            .entry((collection.to_string(), key.to_string()))
            .or_insert_with(|| Value::Object(Map::new()));
        let current = std::mem::take(entry.value_mut());
        *entry.value_mut() = merge(Some(current), fields);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.docs.remove(&(collection.to_string(), key.to_string()));
        Ok(())
    }
}

// ============================================================================
// File backing
// ============================================================================

/// One JSON file per document at `<root>/<collection>/<key>.json`.
///
/// Files are replaced through a temp file + rename so a crash never leaves a
/// half-written document behind.
pub struct JsonFileStateStore {
    root: PathBuf,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JsonFileStateStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            key_locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str, key: &str) -> Result<PathBuf> {
        validate_segment(collection)?;
        validate_segment(key)?;
        Ok(self.root.join(collection).join(format!("{key}.json")))
    }

    fn lock_for(&self, collection: &str, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(format!("{collection}/{key}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let ok = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(RoboError::Store(format!("invalid document path segment '{segment}'")))
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(collection, key)?;
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        self.read(&path).await
    }

    async fn upsert(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()> {
        let path = self.path_for(collection, key)?;
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;

        // An unreadable document is replaced rather than blocking every write.
        let existing = self.read(&path).await.unwrap_or(None);
        let doc = merge(existing, fields);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(collection, key, "document written");
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let path = self.path_for(collection, key)?;
        let lock = self.lock_for(collection, key);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn memory_upsert_merges_fields() {
        let store = MemoryStateStore::new();
        store.upsert("locks", "SOLUSDT", fields(json!({"a": true}))).await.unwrap();
        store.upsert("locks", "SOLUSDT", fields(json!({"b": false}))).await.unwrap();
        let doc = store.get("locks", "SOLUSDT").await.unwrap().unwrap();
        assert_eq!(doc, json!({"a": true, "b": false}));

        store.delete("locks", "SOLUSDT").await.unwrap();
        assert!(store.get("locks", "SOLUSDT").await.unwrap().is_none());
        store.delete("locks", "SOLUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStateStore::open(dir.path()).unwrap();
            store.upsert("trailing", "SOLUSDT", fields(json!({"is_armed": true}))).await.unwrap();
            store.upsert("trailing", "SOLUSDT", fields(json!({"max": "110"}))).await.unwrap();
        }
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        let doc = store.get("trailing", "SOLUSDT").await.unwrap().unwrap();
        assert_eq!(doc, json!({"is_armed": true, "max": "110"}));
        assert!(store.get("trailing", "BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        assert!(store.get("trailing", "../etc").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        std::fs::write(dir.path().join("locks").join("SOLUSDT.json"), b"{not json").unwrap();
        assert!(store.get("locks", "SOLUSDT").await.is_err());

        store.upsert("locks", "SOLUSDT", fields(json!({"a": 1}))).await.unwrap();
        assert_eq!(store.get("locks", "SOLUSDT").await.unwrap(), Some(json!({"a": 1})));
    }
}
