//! Checkpoint storage trait.
//!
//! [`CheckpointStore`] is the persistence seam of the engine. The runtime
//! serializes all writes within a thread, so implementations only need
//! atomicity per call: a checkpoint and its pending writes commit in one
//! transaction or not at all. Two backends ship with this crate:
//! [`InMemoryCheckpointStore`](crate::memory::InMemoryCheckpointStore) for
//! tests and embedded use, and
//! [`SqliteCheckpointStore`](crate::sqlite::SqliteCheckpointStore) for
//! durable deployments.

use crate::checkpoint::{
    CheckpointConfig, CheckpointMetadata, CheckpointTuple, Checkpoint, PendingWrite,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Filter for [`CheckpointStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to a namespace; `None` lists all namespaces of the thread
    pub namespace: Option<String>,
    /// Metadata fields that must match (`source`, `step`, or extras)
    pub metadata: HashMap<String, serde_json::Value>,
    /// Only checkpoints created before this checkpoint id (pagination cursor)
    pub before: Option<String>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

/// Storage backend for checkpoints and their pending writes
///
/// Implementations must be `Send + Sync`; every thread id owns an
/// independent history and concurrent calls for different threads must not
/// interfere.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert a checkpoint row and its pending writes in one transaction.
    ///
    /// Idempotent on `checkpoint.id`: re-inserting an already persisted
    /// checkpoint is a no-op, which makes crash-replay of a superstep safe.
    /// Returns the config addressing the stored checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig>;

    /// Fetch the checkpoint addressed by `config`.
    ///
    /// With `checkpoint_id` pinned, returns exactly that checkpoint;
    /// otherwise the latest for `(thread_id, namespace)`. `Ok(None)` if the
    /// thread or namespace has no checkpoints.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints of a thread, newest first.
    async fn list(&self, thread_id: &str, filter: &ListFilter) -> Result<Vec<CheckpointTuple>>;

    /// Delete all checkpoints and writes of a thread, across namespaces.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

/// Convenience: fetch just the checkpoint, discarding metadata
pub async fn get_checkpoint(
    store: &dyn CheckpointStore,
    config: &CheckpointConfig,
) -> Result<Option<Checkpoint>> {
    Ok(store.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
}
