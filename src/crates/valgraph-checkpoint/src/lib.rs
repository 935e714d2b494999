//! # valgraph-checkpoint
//!
//! Durable state snapshots for the valgraph execution engine.
//!
//! Every superstep of a graph execution commits one [`Checkpoint`] - the
//! channel values, channel versions, scheduled nodes and pending writes of
//! one thread at one point in time - keyed by `(thread_id, namespace,
//! checkpoint_id)`. Checkpoints are immutable; history is a linked DAG per
//! namespace, forks included, which is what makes time travel and
//! crash-exact resumption possible.
//!
//! The crate provides:
//!
//! - [`checkpoint`] - the snapshot, metadata and addressing types
//! - [`store`] - the [`CheckpointStore`] trait all backends implement
//! - [`memory`] - in-memory reference backend
//! - [`sqlite`] - transactional SQLite backend
//! - [`serializer`] - strict tagged-JSON blob encoding (decimals,
//!   timestamps, bytes; no binary fallback)
//! - [`crypto`] - optional AES-256-GCM blob sealing with key rotation

pub mod checkpoint;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod sqlite;
pub mod store;

pub use checkpoint::{
    child_namespace, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, InterruptRecord, PendingWrite, ROOT_NAMESPACE,
};
pub use crypto::BlobCipher;
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, ListFilter};
