//! Core checkpoint data structures.
//!
//! A [`Checkpoint`] is an immutable snapshot of graph state taken at a
//! superstep boundary, keyed by `(thread_id, namespace, checkpoint_id)`.
//! The composite key lets parallel subgraphs of one thread write their own
//! histories without conflict: the root graph uses the empty namespace, a
//! subgraph invoked from node `analyst` under node `debate` writes under
//! `"debate:analyst"`.
//!
//! Checkpoints form a DAG per `(thread_id, namespace)`: each carries its
//! parent id, forks are permitted (time travel), and each fork is itself a
//! total order. A checkpoint and its pending writes are committed in one
//! transaction by every [`CheckpointStore`](crate::store::CheckpointStore)
//! implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Pending write tuple: (task_id, channel, value)
///
/// A write emitted during a superstep but not yet applied to a channel.
/// Persisted alongside the checkpoint so an interrupted superstep can be
/// replayed without re-running tasks that already succeeded.
pub type PendingWrite = (String, String, serde_json::Value);

/// Namespace for the root graph
pub const ROOT_NAMESPACE: &str = "";

/// Join a parent namespace and a node name into a subgraph namespace
pub fn child_namespace(parent: &str, node: &str) -> String {
    if parent.is_empty() {
        node.to_string()
    } else {
        format!("{}:{}", parent, node)
    }
}

/// Origin of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Created from caller input starting an execution
    Input,
    /// Created at a superstep boundary inside the run loop
    Loop,
    /// Created when a node suspended the execution
    Interrupt,
    /// Created from a manual state update (time travel)
    Update,
    /// Terminal checkpoint written when an execution was cancelled
    Cancelled,
}

impl CheckpointSource {
    /// Stable string form stored in metadata blobs
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Input => "input",
            CheckpointSource::Loop => "loop",
            CheckpointSource::Interrupt => "interrupt",
            CheckpointSource::Update => "update",
            CheckpointSource::Cancelled => "cancelled",
        }
    }
}

/// A suspension site persisted with the checkpoint that triggered it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRecord {
    /// Deterministic hash of namespace + node + superstep
    pub interrupt_id: String,
    /// Caller-visible payload, typically `{kind, schema, title?, description?}`
    pub payload: serde_json::Value,
    /// Channel the resume value is written to
    pub resume_channel: String,
    /// `namespace:node` the interrupt originated from
    pub source: String,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    pub source: CheckpointSource,

    /// Step number: -1 for the input checkpoint, 0..n for loop checkpoints
    pub step: i64,

    /// Interrupts still awaiting a resume value, empty unless suspended
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_interrupts: Vec<InterruptRecord>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Metadata for a fresh input checkpoint
    pub fn input() -> Self {
        Self {
            source: CheckpointSource::Input,
            step: -1,
            pending_interrupts: Vec::new(),
            extra: HashMap::new(),
        }
    }

    /// Metadata for a loop checkpoint at the given step
    pub fn loop_step(step: i64) -> Self {
        Self {
            source: CheckpointSource::Loop,
            step,
            pending_interrupts: Vec::new(),
            extra: HashMap::new(),
        }
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = source;
        self
    }

    /// Record interrupts that suspended this checkpoint
    pub fn with_pending_interrupts(mut self, interrupts: Vec<InterruptRecord>) -> Self {
        self.pending_interrupts = interrupts;
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// State snapshot at a superstep boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version (currently 1)
    pub v: i32,

    /// Unique checkpoint id
    pub id: CheckpointId,

    /// Creation timestamp
    pub ts: DateTime<Utc>,

    /// Channel name to value at the time of the snapshot
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Channel name to write counter, bumped on every applied write
    pub channel_versions: HashMap<String, u64>,

    /// Per node: the channel versions it had observed when it last ran
    pub versions_seen: HashMap<String, HashMap<String, u64>>,

    /// Nodes scheduled for the next superstep
    pub next_nodes: Vec<String>,

    /// Last event sequence number emitted for the owning thread at commit
    /// time; seeds the dispatcher after a restart so per-thread sequence
    /// numbers stay strictly monotonic
    pub last_seq_id: u64,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create an empty checkpoint with a fresh id
    pub fn empty() -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            next_nodes: Vec::new(),
            last_seq_id: 0,
        }
    }

    /// Derive the successor checkpoint: same state, fresh id and timestamp
    pub fn successor(&self) -> Self {
        Self {
            v: self.v,
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            next_nodes: self.next_nodes.clone(),
            last_seq_id: self.last_seq_id,
        }
    }
}

/// Addresses a checkpoint within the store
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Owning thread
    pub thread_id: String,

    /// Subgraph namespace; empty string for the root graph
    #[serde(default)]
    pub namespace: String,

    /// Pin a specific checkpoint; `None` selects the latest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    /// Config addressing the latest root checkpoint of a thread
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: ROOT_NAMESPACE.to_string(),
            checkpoint_id: None,
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Pin a specific checkpoint id
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

/// A checkpoint together with its config, metadata and pending writes
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Config addressing this checkpoint (checkpoint_id always set)
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Config of the parent checkpoint, if any
    pub parent_config: Option<CheckpointConfig>,

    /// Pending writes committed with this checkpoint
    pub pending_writes: Vec<PendingWrite>,
}
