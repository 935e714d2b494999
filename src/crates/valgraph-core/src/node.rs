//! Node specifications and the execution context handed to node bodies.
//!
//! A node is a function value plus a small capability struct - name, body,
//! optional retry policy and timeout - not a class hierarchy. Bodies
//! receive a snapshot of the channel values and a [`NodeContext`] carrying
//! the cancellation token, the interrupt entry point and a content-delta
//! writer for token streaming.

use crate::cancel::CancelToken;
use crate::command::NodeOutput;
use crate::error::GraphError;
use crate::event::RuntimeEvent;
use crate::interrupt::make_record;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result of one node execution
pub type NodeResult = std::result::Result<NodeOutput, GraphError>;

/// Boxed future returned by node bodies
pub type NodeFuture = Pin<Box<dyn Future<Output = NodeResult> + Send>>;

/// A node body: state snapshot + context in, update or command out
///
/// Implemented for any `Fn(HashMap<String, Value>, NodeContext) ->
/// NodeFuture`, so plain closures work:
///
/// ```rust,ignore
/// graph.add_node("screen", |state, _ctx| {
///     Box::pin(async move { Ok(NodeOutput::write("universe", json!(["AAPL"]))) })
/// });
/// ```
pub trait NodeBody: Send + Sync {
    /// Execute the node against a state snapshot
    fn run(&self, state: HashMap<String, Value>, ctx: NodeContext) -> NodeFuture;
}

impl<F> NodeBody for F
where
    F: Fn(HashMap<String, Value>, NodeContext) -> NodeFuture + Send + Sync,
{
    fn run(&self, state: HashMap<String, Value>, ctx: NodeContext) -> NodeFuture {
        self(state, ctx)
    }
}

/// Execution context passed to a node body for one attempt
#[derive(Clone)]
pub struct NodeContext {
    node: String,
    namespace: String,
    step: i64,
    cancel: CancelToken,
    resume: Option<Value>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl NodeContext {
    pub(crate) fn new(
        node: impl Into<String>,
        namespace: impl Into<String>,
        step: i64,
        cancel: CancelToken,
        resume: Option<Value>,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Self {
        Self {
            node: node.into(),
            namespace: namespace.into(),
            step,
            cancel,
            resume,
            events,
        }
    }

    /// Name of the executing node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Namespace the node runs under; empty for the root graph
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current superstep number
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Suspend the execution awaiting an external value.
    ///
    /// On first entry this raises the suspension signal: the runtime
    /// finalizes the checkpoint, surfaces `payload` to the caller and
    /// terminates the execution. When the node is re-entered after the
    /// caller resumed, the call returns the resume value instead. The
    /// value is also written to `resume_channel` through the reducers.
    ///
    /// The whole node re-runs on resume; side effects before this call
    /// must be idempotent.
    pub fn interrupt(
        &self,
        payload: Value,
        resume_channel: &str,
    ) -> std::result::Result<Value, GraphError> {
        if let Some(value) = &self.resume {
            return Ok(value.clone());
        }
        Err(GraphError::Suspended(make_record(
            &self.namespace,
            &self.node,
            self.step,
            payload,
            resume_channel,
        )))
    }

    /// Whether cancellation has been signalled; nodes check this between
    /// external calls
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with [`GraphError::Cancelled`] if cancellation was signalled
    pub fn check_cancelled(&self) -> std::result::Result<(), GraphError> {
        if self.cancel.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Emit a token fragment on a named content stream
    pub fn emit_delta(&self, stream_id: impl Into<String>, text: impl Into<String>) {
        let _ = self.events.send(RuntimeEvent::ContentDelta {
            stream_id: stream_id.into(),
            text: text.into(),
        });
    }
}

/// Handler invoked when a wrapped subgraph fails.
///
/// Returning `Some(update)` converts the failure into a degraded node
/// completion carrying `update`; `None` propagates the error.
pub type SubgraphErrorHandler =
    dyn Fn(&GraphError) -> Option<HashMap<String, Value>> + Send + Sync;

/// What a node executes
#[derive(Clone)]
pub enum NodeKind {
    /// A plain async body
    Task(Arc<dyn NodeBody>),
    /// A compiled subgraph run under a child namespace
    Subgraph {
        /// The compiled child graph
        graph: Arc<crate::graph::CompiledGraph>,
        /// Channels projected back into the parent state; `None` projects
        /// every channel both schemas declare
        output_channels: Option<Vec<String>>,
        /// Optional degraded-completion handler
        on_error: Option<Arc<SubgraphErrorHandler>>,
    },
}

/// A named node with its capabilities
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique node name
    pub name: String,
    /// What the node executes
    pub kind: NodeKind,
    /// Channels whose updates activate this node (in addition to edges)
    pub triggers: Vec<String>,
    /// Retry policy; falls back to the runner default when `None`
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout; falls back to the runner default when `None`
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field(
                "kind",
                &match self.kind {
                    NodeKind::Task(_) => "task",
                    NodeKind::Subgraph { .. } => "subgraph",
                },
            )
            .field("triggers", &self.triggers)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Optional per-node settings supplied at build time
#[derive(Clone, Default)]
pub struct NodeOptions {
    /// Channels whose updates activate this node
    pub triggers: Vec<String>,
    /// Retry policy override
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
}

impl NodeOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate this node whenever `channel` updates
    pub fn triggered_by(mut self, channel: impl Into<String>) -> Self {
        self.triggers.push(channel.into());
        self
    }

    /// Set a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set a per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use serde_json::json;

    fn test_ctx(resume: Option<Value>) -> NodeContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        NodeContext::new("gate", "", 1, CancelToken::never(), resume, tx)
    }

    #[test]
    fn test_interrupt_first_entry_suspends() {
        let ctx = test_ctx(None);
        let err = ctx
            .interrupt(json!({"kind": "approval"}), "approval")
            .unwrap_err();
        match err {
            GraphError::Suspended(record) => {
                assert_eq!(record.resume_channel, "approval");
                assert_eq!(record.source, ":gate");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_second_entry_returns_value() {
        let ctx = test_ctx(Some(json!(true)));
        let value = ctx.interrupt(json!({"kind": "approval"}), "approval").unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_check_cancelled() {
        let (handle, token) = cancel_pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = NodeContext::new("n", "", 0, token, None, tx);
        assert!(ctx.check_cancelled().is_ok());
        handle.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(GraphError::Cancelled)));
    }

    #[tokio::test]
    async fn test_emit_delta() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = NodeContext::new("writer", "", 0, CancelToken::never(), None, tx);
        ctx.emit_delta("report", "The company");
        match rx.recv().await.unwrap() {
            RuntimeEvent::ContentDelta { stream_id, text } => {
                assert_eq!(stream_id, "report");
                assert_eq!(text, "The company");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
