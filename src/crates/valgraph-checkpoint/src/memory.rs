//! In-memory checkpoint store.
//!
//! Reference implementation backing unit tests and embedded engines. All
//! data is lost on drop; production deployments use the SQLite store.

use crate::checkpoint::{
    CheckpointConfig, CheckpointMetadata, CheckpointTuple, Checkpoint, PendingWrite,
};
use crate::error::{CheckpointError, Result};
use crate::store::{CheckpointStore, ListFilter};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CheckpointEntry {
    namespace: String,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
    writes: Vec<PendingWrite>,
}

impl CheckpointEntry {
    fn to_tuple(&self, thread_id: &str) -> CheckpointTuple {
        CheckpointTuple {
            config: CheckpointConfig {
                thread_id: thread_id.to_string(),
                namespace: self.namespace.clone(),
                checkpoint_id: Some(self.checkpoint.id.clone()),
            },
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_id.as_ref().map(|id| CheckpointConfig {
                thread_id: thread_id.to_string(),
                namespace: self.namespace.clone(),
                checkpoint_id: Some(id.clone()),
            }),
            pending_writes: self.writes.clone(),
        }
    }

    fn matches_filter(&self, filter: &ListFilter) -> bool {
        if let Some(namespace) = &filter.namespace {
            if &self.namespace != namespace {
                return false;
            }
        }
        for (key, value) in &filter.metadata {
            let matches = match key.as_str() {
                "source" => serde_json::json!(self.metadata.source.as_str()) == *value,
                "step" => serde_json::json!(self.metadata.step) == *value,
                other => self.metadata.extra.get(other) == Some(value),
            };
            if !matches {
                return false;
            }
        }
        true
    }
}

/// Thread-safe in-memory checkpoint store
///
/// Clones share the same underlying storage, so a store handed to the
/// runtime and one held by a test observe the same history.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    // Insertion order doubles as creation order within a thread.
    storage: Arc<RwLock<HashMap<String, Vec<CheckpointEntry>>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one checkpoint
    pub fn thread_count(&self) -> usize {
        self.storage.read().len()
    }

    /// Total number of checkpoints across all threads and namespaces
    pub fn checkpoint_count(&self) -> usize {
        self.storage.read().values().map(Vec::len).sum()
    }

    /// Drop everything (test helper)
    pub fn clear(&self) {
        self.storage.write().clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig> {
        if config.thread_id.is_empty() {
            return Err(CheckpointError::Invalid("thread_id is required".to_string()));
        }

        let stored = CheckpointConfig {
            thread_id: config.thread_id.clone(),
            namespace: config.namespace.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        };

        let mut storage = self.storage.write();
        let entries = storage.entry(config.thread_id.clone()).or_default();
        if entries.iter().any(|e| {
            e.namespace == config.namespace && e.checkpoint.id == checkpoint.id
        }) {
            return Ok(stored);
        }

        // Parent is the checkpoint the caller addressed, or the latest in
        // this namespace when none was pinned.
        let parent_id = config.checkpoint_id.clone().or_else(|| {
            entries
                .iter()
                .rev()
                .find(|e| e.namespace == config.namespace)
                .map(|e| e.checkpoint.id.clone())
        });

        entries.push(CheckpointEntry {
            namespace: config.namespace.clone(),
            checkpoint,
            metadata,
            parent_id,
            writes,
        });
        Ok(stored)
    }

    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let storage = self.storage.read();
        let Some(entries) = storage.get(&config.thread_id) else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(id) => entries
                .iter()
                .find(|e| e.namespace == config.namespace && &e.checkpoint.id == id),
            None => entries
                .iter()
                .rev()
                .find(|e| e.namespace == config.namespace),
        };
        Ok(entry.map(|e| e.to_tuple(&config.thread_id)))
    }

    async fn list(&self, thread_id: &str, filter: &ListFilter) -> Result<Vec<CheckpointTuple>> {
        let storage = self.storage.read();
        let Some(entries) = storage.get(thread_id) else {
            return Ok(Vec::new());
        };

        let before_pos = filter
            .before
            .as_ref()
            .and_then(|id| entries.iter().position(|e| &e.checkpoint.id == id));

        let mut results = Vec::new();
        for (pos, entry) in entries.iter().enumerate().rev() {
            if let Some(cutoff) = before_pos {
                if pos >= cutoff {
                    continue;
                }
            }
            if !entry.matches_filter(filter) {
                continue;
            }
            results.push(entry.to_tuple(thread_id));
            if let Some(limit) = filter.limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use serde_json::json;

    fn put_args(thread: &str) -> (CheckpointConfig, Checkpoint, CheckpointMetadata) {
        (
            CheckpointConfig::new(thread),
            Checkpoint::empty(),
            CheckpointMetadata::input(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get_latest() {
        let store = InMemoryCheckpointStore::new();
        let (config, checkpoint, metadata) = put_args("t1");
        let id = checkpoint.id.clone();
        store.put(&config, checkpoint, metadata, vec![]).await.unwrap();

        let tuple = store.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, id);
        assert_eq!(tuple.config.checkpoint_id, Some(id));
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        let (config, checkpoint, metadata) = put_args("t1");
        store
            .put(&config, checkpoint.clone(), metadata.clone(), vec![])
            .await
            .unwrap();
        store.put(&config, checkpoint, metadata, vec![]).await.unwrap();
        assert_eq!(store.checkpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_parent_chain() {
        let store = InMemoryCheckpointStore::new();
        let (config, first, metadata) = put_args("t1");
        let first_id = first.id.clone();
        store.put(&config, first, metadata, vec![]).await.unwrap();

        let second = Checkpoint::empty();
        store
            .put(&config, second, CheckpointMetadata::loop_step(0), vec![])
            .await
            .unwrap();

        let tuple = store.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(
            tuple.parent_config.unwrap().checkpoint_id,
            Some(first_id)
        );
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let store = InMemoryCheckpointStore::new();
        let root = CheckpointConfig::new("t1");
        let sub = CheckpointConfig::new("t1").with_namespace("debate:bull");

        let root_cp = Checkpoint::empty();
        let root_id = root_cp.id.clone();
        store
            .put(&root, root_cp, CheckpointMetadata::input(), vec![])
            .await
            .unwrap();
        store
            .put(&sub, Checkpoint::empty(), CheckpointMetadata::loop_step(0), vec![])
            .await
            .unwrap();

        let tuple = store.get_tuple(&root).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, root_id);
    }

    #[tokio::test]
    async fn test_list_filters_by_source() {
        let store = InMemoryCheckpointStore::new();
        let config = CheckpointConfig::new("t1");
        store
            .put(&config, Checkpoint::empty(), CheckpointMetadata::input(), vec![])
            .await
            .unwrap();
        store
            .put(&config, Checkpoint::empty(), CheckpointMetadata::loop_step(0), vec![])
            .await
            .unwrap();

        let mut filter = ListFilter::default();
        filter
            .metadata
            .insert("source".to_string(), json!(CheckpointSource::Loop.as_str()));
        let results = store.list("t1", &filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.source, CheckpointSource::Loop);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = InMemoryCheckpointStore::new();
        let config = CheckpointConfig::new("t1");
        let mut last_id = String::new();
        for step in 0..4 {
            let checkpoint = Checkpoint::empty();
            last_id = checkpoint.id.clone();
            store
                .put(&config, checkpoint, CheckpointMetadata::loop_step(step), vec![])
                .await
                .unwrap();
        }

        let filter = ListFilter {
            limit: Some(2),
            ..Default::default()
        };
        let results = store.list("t1", &filter).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].checkpoint.id, last_id);
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let store = InMemoryCheckpointStore::new();
        let (config, checkpoint, metadata) = put_args("t1");
        store.put(&config, checkpoint, metadata, vec![]).await.unwrap();
        store.delete_thread("t1").await.unwrap();
        assert!(store.get_tuple(&config).await.unwrap().is_none());
    }
}
