//! The `KVStore` collaborator (§6): a string-keyed store with nested
//! savepoints. Production backends are external; this module only ships the
//! in-memory reference implementation used by tests and the demo host.

use crate::error::KernelError;
use async_trait::async_trait;

#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str);

    async fn delete(&self, key: &str);

    async fn get_required(&self, key: &str) -> Result<String, KernelError> {
        self.get(key)
            .await
            .ok_or_else(|| KernelError::StoreFailure(format!("missing required key `{key}`")))
    }

    /// All keys with the given prefix, in lexicographic order.
    async fn keys(&self, prefix: &str) -> Vec<String>;

    async fn create_savepoint(&self, name: &str);

    /// Discard every mutation made since `name` was created, including
    /// nested savepoints created after it.
    async fn rollback_to(&self, name: &str) -> Result<(), KernelError>;

    /// Merge a savepoint's mutations into its parent without discarding them.
    async fn release(&self, name: &str) -> Result<(), KernelError>;

    /// Resolve the outermost savepoint. A no-op if none is open.
    async fn commit(&self);
}

use std::collections::BTreeMap;
use tokio::sync::RwLock;

struct Snapshot {
    name: String,
    data: BTreeMap<String, String>,
}

struct Inner {
    data: BTreeMap<String, String>,
    savepoints: Vec<Snapshot>,
}

/// In-memory `KVStore` backed by a single-writer lock over a `BTreeMap`, with
/// savepoints implemented as full snapshots. Never a production backend —
/// the moral equivalent of a POC/testing store, not a persistence layer.
pub struct MemoryKv {
    inner: RwLock<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv { inner: RwLock::new(Inner { data: BTreeMap::new(), savepoints: Vec::new() }) }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KVStore for MemoryKv {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.data.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.inner.write().await.data.insert(key.to_string(), value.to_string());
    }

    async fn delete(&self, key: &str) {
        self.inner.write().await.data.remove(key);
    }

    async fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    async fn create_savepoint(&self, name: &str) {
        let mut w = self.inner.write().await;
        let data = w.data.clone();
        w.savepoints.push(Snapshot { name: name.to_string(), data });
    }

    async fn rollback_to(&self, name: &str) -> Result<(), KernelError> {
        let mut w = self.inner.write().await;
        let idx = w
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| KernelError::StoreFailure(format!("no such savepoint `{name}`")))?;
        w.data = w.savepoints[idx].data.clone();
        w.savepoints.truncate(idx);
        Ok(())
    }

    async fn release(&self, name: &str) -> Result<(), KernelError> {
        let mut w = self.inner.write().await;
        let idx = w
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| KernelError::StoreFailure(format!("no such savepoint `{name}`")))?;
        w.savepoints.truncate(idx);
        Ok(())
    }

    async fn commit(&self) {
        self.inner.write().await.savepoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_round_trip() {
        let kv = MemoryKv::new();
        kv.set("a.b", "1").await;
        assert_eq!(kv.get("a.b").await, Some("1".to_string()));
        assert_eq!(kv.get("missing").await, None);
    }

    #[tokio::test]
    async fn prefix_scan_is_sorted() {
        let kv = MemoryKv::new();
        kv.set("queue.run.2", "x").await;
        kv.set("queue.run.1", "x").await;
        kv.set("queue.run.10", "x").await;
        kv.set("other.key", "x").await;
        assert_eq!(kv.keys("queue.run.").await, vec!["queue.run.1", "queue.run.10", "queue.run.2"]);
    }

    #[tokio::test]
    async fn rollback_discards_nested_savepoints() {
        let kv = MemoryKv::new();
        kv.set("x", "0").await;
        kv.create_savepoint("outer").await;
        kv.set("x", "1").await;
        kv.create_savepoint("inner").await;
        kv.set("x", "2").await;
        kv.delete("x").await;

        kv.rollback_to("outer").await.unwrap();
        assert_eq!(kv.get("x").await, Some("0".to_string()));

        // Both savepoints are gone; rolling back to "inner" again is an error.
        assert!(kv.rollback_to("inner").await.is_err());
    }

    #[tokio::test]
    async fn release_keeps_mutations_but_drops_the_savepoint() {
        let kv = MemoryKv::new();
        kv.create_savepoint("sp").await;
        kv.set("x", "1").await;
        kv.release("sp").await.unwrap();
        assert_eq!(kv.get("x").await, Some("1".to_string()));
        assert!(kv.rollback_to("sp").await.is_err());
    }

    #[tokio::test]
    async fn commit_clears_all_open_savepoints() {
        let kv = MemoryKv::new();
        kv.create_savepoint("a").await;
        kv.set("x", "1").await;
        kv.create_savepoint("b").await;
        kv.set("x", "2").await;
        kv.commit().await;
        assert_eq!(kv.get("x").await, Some("2".to_string()));
        assert!(kv.rollback_to("a").await.is_err());
    }
}
