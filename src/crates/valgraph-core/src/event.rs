//! Internal runtime events.
//!
//! The run loop narrates execution through this enum. The server's
//! dispatcher is the only consumer: it wraps each event into the versioned
//! wire envelope, assigns sequence numbers and fans out to subscribers.
//! Heartbeats are dispatcher-side and deliberately absent here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use valgraph_checkpoint::InterruptRecord;

/// Terminal status of a node execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Completed normally
    Ok,
    /// Failed
    Error,
    /// A wrapped subgraph failed and the node degraded instead of failing
    Degraded,
}

/// Why an execution ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// The graph ran to quiescence
    Complete,
    /// One or more interrupts suspended the thread
    Interrupted,
    /// The caller cancelled the execution
    Cancelled,
    /// An unrecoverable error terminated the execution
    Error,
}

/// Structured error details carried on error events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Stable error kind from the wire taxonomy
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Failing node, when the error has node context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Namespace of the failing node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Events emitted by the run loop
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Execution started
    LifecycleStart {
        /// Short description of the triggering input
        input_summary: String,
    },
    /// Execution ended; exactly one per execution
    LifecycleEnd {
        /// Why it ended
        reason: EndReason,
        /// Error details when `reason` is `Error`
        error: Option<ErrorInfo>,
    },
    /// A node began executing
    NodeStart {
        /// Node name
        name: String,
        /// Namespace it runs under
        namespace: String,
    },
    /// A node finished executing
    NodeEnd {
        /// Node name
        name: String,
        /// Namespace it ran under
        namespace: String,
        /// Terminal status
        status: NodeStatus,
    },
    /// A channel took a new value at a superstep barrier
    StateUpdate {
        /// Channel name
        channel: String,
        /// Post-reduction channel value
        value: Value,
        /// Namespace of the superstep that produced the update
        namespace: String,
        /// Statuses of the nodes that ran in that superstep
        node_statuses: HashMap<String, NodeStatus>,
    },
    /// A token fragment from a streaming node body
    ContentDelta {
        /// Identifies one logical stream within the execution
        stream_id: String,
        /// The fragment
        text: String,
    },
    /// A node suspended the execution awaiting external input
    InterruptRequest {
        /// The persisted suspension record
        record: InterruptRecord,
    },
    /// A previously surfaced interrupt received its resume value
    InterruptResolved {
        /// Id of the resolved interrupt
        interrupt_id: String,
    },
    /// A non-fatal or fatal error surfaced mid-execution
    Error {
        /// Structured details
        info: ErrorInfo,
    },
}

impl RuntimeEvent {
    /// Wire event type string for this event
    pub fn event_type(&self) -> &'static str {
        match self {
            RuntimeEvent::LifecycleStart { .. } => "lifecycle.start",
            RuntimeEvent::LifecycleEnd { .. } => "lifecycle.end",
            RuntimeEvent::NodeStart { .. } => "node.start",
            RuntimeEvent::NodeEnd { .. } => "node.end",
            RuntimeEvent::StateUpdate { .. } => "state.update",
            RuntimeEvent::ContentDelta { .. } => "content.delta",
            RuntimeEvent::InterruptRequest { .. } => "interrupt.request",
            RuntimeEvent::InterruptResolved { .. } => "interrupt.resolved",
            RuntimeEvent::Error { .. } => "error",
        }
    }
}
