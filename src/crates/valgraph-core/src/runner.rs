//! The superstep execution loop.
//!
//! [`GraphRunner`] drives a [`CompiledGraph`] to quiescence one superstep
//! at a time:
//!
//! ```text
//! ┌─ superstep ──────────────────────────────────────────────┐
//! │ 1. activation   next_nodes from the checkpoint           │
//! │ 2. execution    all active nodes, concurrently           │
//! │ 3. barrier      collect writes, apply reducers           │
//! │ 4. commit       checkpoint + pending writes, one txn     │
//! │ 5. routing      edges, goto overrides, channel triggers  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop suspends at an interrupt, stops at the recursion limit, and
//! observes the cancel token at every barrier. Subgraph nodes recurse into
//! the same loop under a child namespace with their own checkpoint chain.
//! Given identical starting state and identical node outputs, the sequence
//! of checkpoints and events is byte-identical: activation sets are sorted,
//! writes apply in node-name order and the runtime itself never consults a
//! clock or a random source to make a routing decision.

use crate::cancel::CancelToken;
use crate::command::{NodeOutput, ResumeValue};
use crate::error::{GraphError, Result};
use crate::event::{EndReason, ErrorInfo, NodeStatus, RuntimeEvent};
use crate::graph::CompiledGraph;
use crate::interrupt::route_resumes;
use crate::node::{NodeContext, NodeKind, NodeSpec};
use crate::retry::RetryPolicy;
use crate::state::{apply_writes, ChannelWrite};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use valgraph_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointStore,
    InterruptRecord, PendingWrite, ROOT_NAMESPACE,
};

/// Pseudo-node name attributed to caller input writes
pub const INPUT_NODE: &str = "__input__";

/// Runtime limits and defaults
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum supersteps per execution
    pub recursion_limit: usize,
    /// Per-attempt node timeout when the node declares none
    pub default_node_timeout: Option<Duration>,
    /// Retry policy when the node declares none; `None` disables retries
    pub default_retry: Option<RetryPolicy>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 25,
            default_node_timeout: None,
            default_retry: None,
        }
    }
}

/// What starts or continues an execution
#[derive(Debug, Clone)]
pub enum RunInput {
    /// Fresh input applied as an `input` checkpoint
    Message(HashMap<String, Value>),
    /// Resume values for pending interrupts; empty continues after a crash
    Resume(Vec<ResumeValue>),
}

/// How an execution ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The graph ran to quiescence
    Complete,
    /// The thread is suspended on these interrupts
    Interrupted(Vec<InterruptRecord>),
    /// The caller cancelled the execution
    Cancelled,
}

/// Executes one graph against one thread's checkpoint history
pub struct GraphRunner {
    graph: Arc<CompiledGraph>,
    store: Arc<dyn CheckpointStore>,
    config: RunnerConfig,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    cancel: CancelToken,
    seq: Arc<AtomicU64>,
}

struct TaskOutcome {
    node: String,
    status: NodeStatus,
    writes: Vec<ChannelWrite>,
    goto: Option<Vec<String>>,
    interrupts: Vec<InterruptRecord>,
    resolved: Vec<String>,
    error: Option<GraphError>,
}

enum LoopOutcome {
    Complete(HashMap<String, Value>),
    Interrupted(Vec<InterruptRecord>),
    Cancelled,
}

struct LoopInit {
    checkpoint: Checkpoint,
    parent_id: Option<String>,
    step: i64,
    pending: Vec<InterruptRecord>,
    resume_map: HashMap<String, Value>,
}

impl GraphRunner {
    /// Create a runner over a graph, a store and an event sink
    pub fn new(
        graph: Arc<CompiledGraph>,
        store: Arc<dyn CheckpointStore>,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Self {
        Self {
            graph,
            store,
            config: RunnerConfig::default(),
            events,
            cancel: CancelToken::never(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set runtime limits and defaults
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe a cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share the per-thread sequence counter so checkpoints snapshot the
    /// last emitted `seq_id`
    pub fn with_seq_counter(mut self, seq: Arc<AtomicU64>) -> Self {
        self.seq = seq;
        self
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &GraphError) {
        let (node, namespace) = match error.node_context() {
            Some((n, ns)) => (Some(n.to_string()), Some(ns.to_string())),
            None => (None, None),
        };
        self.emit(RuntimeEvent::Error {
            info: ErrorInfo {
                kind: error.kind().to_string(),
                message: error.to_string(),
                node,
                namespace,
            },
        });
    }

    /// Run one execution for `thread_id`.
    ///
    /// Emits `lifecycle.start`, narrates the run, and always emits exactly
    /// one `lifecycle.end` before returning.
    pub async fn run(&self, thread_id: &str, input: RunInput) -> Result<RunOutcome> {
        let summary = match &input {
            RunInput::Message(values) => {
                let mut text = serde_json::to_string(values).unwrap_or_default();
                if text.len() > 120 {
                    text.truncate(120);
                }
                text
            }
            RunInput::Resume(values) => format!("resume ({} value(s))", values.len()),
        };
        self.emit(RuntimeEvent::LifecycleStart {
            input_summary: summary,
        });

        let result = self.run_root(thread_id, input).await;
        match &result {
            Ok(LoopOutcome::Complete(_)) => {
                self.emit(RuntimeEvent::LifecycleEnd {
                    reason: EndReason::Complete,
                    error: None,
                });
            }
            Ok(LoopOutcome::Interrupted(_)) => {
                self.emit(RuntimeEvent::LifecycleEnd {
                    reason: EndReason::Interrupted,
                    error: None,
                });
            }
            Ok(LoopOutcome::Cancelled) => {
                self.emit(RuntimeEvent::LifecycleEnd {
                    reason: EndReason::Cancelled,
                    error: None,
                });
            }
            Err(error) => {
                self.emit_error(error);
                self.emit(RuntimeEvent::LifecycleEnd {
                    reason: EndReason::Error,
                    error: Some(ErrorInfo {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                        node: error.node_context().map(|(n, _)| n.to_string()),
                        namespace: error.node_context().map(|(_, ns)| ns.to_string()),
                    }),
                });
            }
        }

        result.map(|outcome| match outcome {
            LoopOutcome::Complete(_) => RunOutcome::Complete,
            LoopOutcome::Interrupted(records) => RunOutcome::Interrupted(records),
            LoopOutcome::Cancelled => RunOutcome::Cancelled,
        })
    }

    async fn run_root(&self, thread_id: &str, input: RunInput) -> Result<LoopOutcome> {
        let config = CheckpointConfig::new(thread_id);
        let init = match input {
            RunInput::Message(values) => {
                self.make_input_checkpoint(thread_id, values).await?
            }
            RunInput::Resume(resumes) => {
                let tuple = self
                    .store
                    .get_tuple(&config)
                    .await?
                    .ok_or_else(|| GraphError::NotFound(format!("thread '{}'", thread_id)))?;
                let pending = tuple.metadata.pending_interrupts.clone();
                if !resumes.is_empty() && pending.is_empty() {
                    return Err(GraphError::NotSuspended(thread_id.to_string()));
                }
                let resume_map = route_resumes(&pending, &resumes)?;
                LoopInit {
                    parent_id: Some(tuple.checkpoint.id.clone()),
                    step: tuple.metadata.step + 1,
                    checkpoint: tuple.checkpoint,
                    pending,
                    resume_map,
                }
            }
        };

        self.run_loop(thread_id, ROOT_NAMESPACE.to_string(), self.graph.clone(), init)
            .await
    }

    async fn make_input_checkpoint(
        &self,
        thread_id: &str,
        values: HashMap<String, Value>,
    ) -> Result<LoopInit> {
        let graph = &self.graph;
        let schema = graph.schema();
        let mut channel_values = schema.initial_values();
        let mut channel_versions = HashMap::new();
        let writes: Vec<ChannelWrite> = values
            .into_iter()
            .map(|(channel, value)| ChannelWrite::new(INPUT_NODE, channel, value))
            .collect();
        apply_writes(schema, &mut channel_values, &mut channel_versions, &writes)?;

        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_values = channel_values;
        checkpoint.channel_versions = channel_versions;
        checkpoint.next_nodes = vec![graph.entry().to_string()];
        checkpoint.last_seq_id = self.seq.load(Ordering::SeqCst);

        let pending_writes: Vec<PendingWrite> = writes
            .iter()
            .map(|w| (INPUT_NODE.to_string(), w.channel.clone(), w.value.clone()))
            .collect();
        let config = CheckpointConfig::new(thread_id);
        self.store
            .put(
                &config,
                checkpoint.clone(),
                CheckpointMetadata::input(),
                pending_writes,
            )
            .await?;
        tracing::debug!(thread_id, checkpoint_id = %checkpoint.id, "input checkpoint committed");

        Ok(LoopInit {
            parent_id: Some(checkpoint.id.clone()),
            checkpoint,
            step: 0,
            pending: Vec::new(),
            resume_map: HashMap::new(),
        })
    }

    fn run_loop<'a>(
        &'a self,
        thread_id: &'a str,
        namespace: String,
        graph: Arc<CompiledGraph>,
        init: LoopInit,
    ) -> Pin<Box<dyn Future<Output = Result<LoopOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let LoopInit {
                mut checkpoint,
                mut parent_id,
                mut step,
                mut pending,
                mut resume_map,
            } = init;
            let config = CheckpointConfig::new(thread_id).with_namespace(namespace.clone());
            let mut steps_taken: usize = 0;

            loop {
                // Activation: resumed suspension sites only while suspended,
                // otherwise whatever the last barrier scheduled.
                let mut active: Vec<String> = if pending.is_empty() {
                    checkpoint.next_nodes.clone()
                } else {
                    if resume_map.is_empty() {
                        return Ok(LoopOutcome::Interrupted(pending));
                    }
                    pending
                        .iter()
                        .filter(|r| resume_map.contains_key(&r.interrupt_id))
                        .filter_map(|r| owning_node(&r.source, &namespace))
                        .collect()
                };
                active.sort();
                active.dedup();

                // Nodes scheduled before the suspension but not part of this
                // resume stay scheduled for the next superstep.
                let carryover: Vec<String> = if pending.is_empty() {
                    Vec::new()
                } else {
                    checkpoint
                        .next_nodes
                        .iter()
                        .filter(|n| !active.contains(n))
                        .cloned()
                        .collect()
                };

                if active.is_empty() {
                    return Ok(LoopOutcome::Complete(checkpoint.channel_values.clone()));
                }
                if steps_taken >= self.config.recursion_limit {
                    return Err(GraphError::RecursionLimit {
                        limit: self.config.recursion_limit,
                    });
                }
                if self.cancel.is_cancelled() {
                    self.commit_cancelled(&config, &checkpoint, &parent_id, step, &pending)
                        .await?;
                    return Ok(LoopOutcome::Cancelled);
                }

                tracing::debug!(thread_id, %namespace, step, nodes = ?active, "superstep");

                // Execution: all active nodes concurrently, joined at the barrier.
                let mut futures = Vec::new();
                for name in &active {
                    let spec = graph.node(name).ok_or_else(|| {
                        GraphError::NotFound(format!("node '{}' in namespace '{}'", name, namespace))
                    })?;
                    let resumes_for_node: Vec<(InterruptRecord, Value)> = pending
                        .iter()
                        .filter(|r| owning_node(&r.source, &namespace).as_deref() == Some(name))
                        .filter_map(|r| {
                            resume_map
                                .get(&r.interrupt_id)
                                .map(|v| (r.clone(), v.clone()))
                        })
                        .collect();
                    self.emit(RuntimeEvent::NodeStart {
                        name: name.clone(),
                        namespace: namespace.clone(),
                    });
                    futures.push(self.run_task(
                        thread_id,
                        &namespace,
                        &graph,
                        spec,
                        checkpoint.channel_values.clone(),
                        step,
                        resumes_for_node,
                    ));
                }
                let mut outcomes = futures::future::join_all(futures).await;

                // Errors terminate before anything commits; the previous
                // checkpoint stays the authoritative resume point.
                if outcomes
                    .iter()
                    .any(|o| matches!(o.error, Some(GraphError::Cancelled)))
                {
                    self.commit_cancelled(&config, &checkpoint, &parent_id, step, &pending)
                        .await?;
                    return Ok(LoopOutcome::Cancelled);
                }
                if let Some(failed) = outcomes.iter_mut().find(|o| o.error.is_some()) {
                    let error = failed.error.take().expect("error present");
                    self.emit(RuntimeEvent::NodeEnd {
                        name: failed.node.clone(),
                        namespace: namespace.clone(),
                        status: NodeStatus::Error,
                    });
                    return Err(error);
                }

                // Barrier: collect writes of completed tasks plus the resume
                // values routed to their channels.
                let mut writes: Vec<ChannelWrite> = Vec::new();
                let mut statuses: HashMap<String, NodeStatus> = HashMap::new();
                let mut resolved: Vec<String> = Vec::new();
                let mut new_interrupts: Vec<InterruptRecord> = Vec::new();
                for outcome in &outcomes {
                    if outcome.interrupts.is_empty() {
                        statuses.insert(outcome.node.clone(), outcome.status);
                        writes.extend(outcome.writes.iter().cloned());
                        for id in &outcome.resolved {
                            if let Some(record) = pending.iter().find(|r| &r.interrupt_id == id) {
                                if let Some(value) = resume_map.get(id) {
                                    writes.push(ChannelWrite::new(
                                        outcome.node.clone(),
                                        record.resume_channel.clone(),
                                        value.clone(),
                                    ));
                                }
                            }
                            resolved.push(id.clone());
                        }
                    } else {
                        new_interrupts.extend(outcome.interrupts.iter().cloned());
                    }
                }

                let mut channel_values = checkpoint.channel_values.clone();
                let mut channel_versions = checkpoint.channel_versions.clone();
                let updated = apply_writes(
                    graph.schema(),
                    &mut channel_values,
                    &mut channel_versions,
                    &writes,
                )?;

                let mut versions_seen = checkpoint.versions_seen.clone();
                for outcome in &outcomes {
                    if outcome.interrupts.is_empty() {
                        versions_seen
                            .insert(outcome.node.clone(), channel_versions.clone());
                    }
                }

                // Narrate completions before the state they produced.
                for outcome in &outcomes {
                    if outcome.interrupts.is_empty() {
                        self.emit(RuntimeEvent::NodeEnd {
                            name: outcome.node.clone(),
                            namespace: namespace.clone(),
                            status: outcome.status,
                        });
                    }
                }
                for id in &resolved {
                    self.emit(RuntimeEvent::InterruptResolved {
                        interrupt_id: id.clone(),
                    });
                }
                for channel in &updated {
                    self.emit(RuntimeEvent::StateUpdate {
                        channel: channel.clone(),
                        value: channel_values
                            .get(channel)
                            .cloned()
                            .unwrap_or(Value::Null),
                        namespace: namespace.clone(),
                        node_statuses: statuses.clone(),
                    });
                }

                // Routing: goto overrides edges; channel triggers add readers;
                // suspension sites stay scheduled for their re-entry.
                let mut next: Vec<String> = Vec::new();
                for outcome in &outcomes {
                    if outcome.interrupts.is_empty() {
                        next.extend(graph.route(
                            &outcome.node,
                            &channel_values,
                            outcome.goto.as_deref(),
                        ));
                    } else {
                        next.push(outcome.node.clone());
                    }
                }
                next.extend(graph.triggered_by(&updated));
                next.extend(carryover);

                // Refresh the pending set: resolved sites leave, re-suspended
                // nodes replace their old records, new sites join once.
                let resuspended: Vec<String> = outcomes
                    .iter()
                    .filter(|o| !o.interrupts.is_empty())
                    .map(|o| o.node.clone())
                    .collect();
                pending.retain(|r| {
                    !resolved.contains(&r.interrupt_id)
                        && owning_node(&r.source, &namespace)
                            .map_or(true, |n| !resuspended.contains(&n))
                });
                for record in &new_interrupts {
                    if !pending.iter().any(|r| r.interrupt_id == record.interrupt_id) {
                        pending.push(record.clone());
                    }
                }
                for record in &pending {
                    if let Some(node) = owning_node(&record.source, &namespace) {
                        next.push(node);
                    }
                }
                next.sort();
                next.dedup();
                resume_map.retain(|id, _| pending.iter().any(|r| &r.interrupt_id == id));

                // Commit: one checkpoint per superstep, writes included.
                let mut new_checkpoint = checkpoint.successor();
                new_checkpoint.channel_values = channel_values;
                new_checkpoint.channel_versions = channel_versions;
                new_checkpoint.versions_seen = versions_seen;
                new_checkpoint.next_nodes = next;
                new_checkpoint.last_seq_id = self.seq.load(Ordering::SeqCst);

                let source = if new_interrupts.is_empty() {
                    CheckpointSource::Loop
                } else {
                    CheckpointSource::Interrupt
                };
                let metadata = CheckpointMetadata::loop_step(step)
                    .with_source(source)
                    .with_pending_interrupts(pending.clone());
                let pending_writes: Vec<PendingWrite> = writes
                    .iter()
                    .map(|w| {
                        (
                            format!("{}:{}", checkpoint.id, w.node),
                            w.channel.clone(),
                            w.value.clone(),
                        )
                    })
                    .collect();
                let put_config = match &parent_id {
                    Some(id) => config.clone().with_checkpoint_id(id.clone()),
                    None => config.clone(),
                };
                self.store
                    .put(&put_config, new_checkpoint.clone(), metadata, pending_writes)
                    .await?;

                for record in &new_interrupts {
                    self.emit(RuntimeEvent::InterruptRequest {
                        record: record.clone(),
                    });
                }

                parent_id = Some(new_checkpoint.id.clone());
                checkpoint = new_checkpoint;
                step += 1;
                steps_taken += 1;

                if !pending.is_empty() {
                    return Ok(LoopOutcome::Interrupted(pending));
                }
            }
        })
    }

    async fn commit_cancelled(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        parent_id: &Option<String>,
        step: i64,
        pending: &[InterruptRecord],
    ) -> Result<()> {
        let mut terminal = checkpoint.successor();
        terminal.last_seq_id = self.seq.load(Ordering::SeqCst);
        let metadata = CheckpointMetadata::loop_step(step)
            .with_source(CheckpointSource::Cancelled)
            .with_pending_interrupts(pending.to_vec());
        let put_config = match parent_id {
            Some(id) => config.clone().with_checkpoint_id(id.clone()),
            None => config.clone(),
        };
        self.store
            .put(&put_config, terminal, metadata, Vec::new())
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        thread_id: &str,
        namespace: &str,
        parent_graph: &CompiledGraph,
        spec: &NodeSpec,
        state: HashMap<String, Value>,
        step: i64,
        resumes: Vec<(InterruptRecord, Value)>,
    ) -> TaskOutcome {
        match &spec.kind {
            NodeKind::Task(body) => {
                self.run_plain_task(namespace, spec, body.as_ref(), state, step, resumes)
                    .await
            }
            NodeKind::Subgraph {
                graph,
                output_channels,
                on_error,
            } => {
                self.run_subgraph_task(
                    thread_id,
                    namespace,
                    parent_graph,
                    spec,
                    graph.clone(),
                    output_channels.as_deref(),
                    on_error.as_deref(),
                    state,
                    resumes,
                )
                .await
            }
        }
    }

    async fn run_plain_task(
        &self,
        namespace: &str,
        spec: &NodeSpec,
        body: &dyn crate::node::NodeBody,
        state: HashMap<String, Value>,
        step: i64,
        resumes: Vec<(InterruptRecord, Value)>,
    ) -> TaskOutcome {
        let policy = spec
            .retry_policy
            .clone()
            .or_else(|| self.config.default_retry.clone())
            .unwrap_or_else(|| RetryPolicy::new(1).with_jitter(false));
        let timeout = spec.timeout.or(self.config.default_node_timeout);
        let resume_value = resumes.first().map(|(_, v)| v.clone());
        let resolved: Vec<String> = resumes
            .iter()
            .map(|(r, _)| r.interrupt_id.clone())
            .collect();

        let mut outcome = TaskOutcome {
            node: spec.name.clone(),
            status: NodeStatus::Ok,
            writes: Vec::new(),
            goto: None,
            interrupts: Vec::new(),
            resolved: Vec::new(),
            error: None,
        };

        let mut attempt: usize = 0;
        loop {
            let ctx = NodeContext::new(
                spec.name.clone(),
                namespace.to_string(),
                step,
                self.cancel.clone(),
                resume_value.clone(),
                self.events.clone(),
            );
            let fut = body.run(state.clone(), ctx);
            let result = match timeout {
                Some(duration) => match tokio::time::timeout(duration, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(GraphError::Timeout {
                        operation: format!("node '{}'", spec.name),
                        seconds: duration.as_secs(),
                    }),
                },
                None => fut.await,
            };

            match result {
                Ok(output) => {
                    if let Some(update) = output.update() {
                        let mut entries: Vec<(&String, &Value)> = update.iter().collect();
                        entries.sort_by(|a, b| a.0.cmp(b.0));
                        for (channel, value) in entries {
                            outcome.writes.push(ChannelWrite::new(
                                spec.name.clone(),
                                channel.clone(),
                                value.clone(),
                            ));
                        }
                    }
                    if let NodeOutput::Command(command) = &output {
                        outcome.goto = command.goto.clone();
                    }
                    outcome.resolved = resolved;
                    return outcome;
                }
                Err(GraphError::Suspended(record)) => {
                    outcome.interrupts.push(record);
                    return outcome;
                }
                Err(GraphError::Cancelled) => {
                    outcome.error = Some(GraphError::Cancelled);
                    return outcome;
                }
                Err(error) => {
                    attempt += 1;
                    let retryable = match &error {
                        GraphError::NodeError { kind, .. } => policy.retries_kind(kind),
                        GraphError::Timeout { .. } => policy.retries_kind("execution_timeout"),
                        _ => false,
                    };
                    if retryable && policy.should_retry(attempt) {
                        let delay = policy.calculate_delay(attempt - 1);
                        tracing::warn!(
                            node = %spec.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying node after failure"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    outcome.error = Some(if attempt > 1 {
                        GraphError::RetryExhausted {
                            node: spec.name.clone(),
                            namespace: namespace.to_string(),
                            attempts: attempt,
                            message: error.to_string(),
                        }
                    } else {
                        normalize_node_error(error, &spec.name, namespace)
                    });
                    return outcome;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_subgraph_task(
        &self,
        thread_id: &str,
        namespace: &str,
        parent_graph: &CompiledGraph,
        spec: &NodeSpec,
        graph: Arc<CompiledGraph>,
        output_channels: Option<&[String]>,
        on_error: Option<&crate::node::SubgraphErrorHandler>,
        state: HashMap<String, Value>,
        resumes: Vec<(InterruptRecord, Value)>,
    ) -> TaskOutcome {
        let child_ns = valgraph_checkpoint::child_namespace(namespace, &spec.name);
        let mut outcome = TaskOutcome {
            node: spec.name.clone(),
            status: NodeStatus::Ok,
            writes: Vec::new(),
            goto: None,
            interrupts: Vec::new(),
            resolved: Vec::new(),
            error: None,
        };

        let init = match self.subgraph_init(thread_id, &child_ns, &graph, &state, &resumes).await {
            Ok(init) => init,
            Err(error) => {
                outcome.error = Some(error);
                return outcome;
            }
        };
        let initial_versions = init.checkpoint.channel_versions.clone();
        outcome.resolved = resumes
            .iter()
            .map(|(r, _)| r.interrupt_id.clone())
            .collect();

        match self
            .run_loop(thread_id, child_ns.clone(), graph.clone(), init)
            .await
        {
            Ok(LoopOutcome::Complete(final_values)) => {
                // Project back only channels the child actually updated.
                let child_config =
                    CheckpointConfig::new(thread_id).with_namespace(child_ns.clone());
                let final_versions = match self.store.get_tuple(&child_config).await {
                    Ok(Some(tuple)) => tuple.checkpoint.channel_versions,
                    _ => HashMap::new(),
                };
                let parent_schema = parent_graph.schema();
                for (channel, value) in &final_values {
                    let updated = final_versions.get(channel).copied().unwrap_or(0)
                        > initial_versions.get(channel).copied().unwrap_or(0);
                    if !updated {
                        continue;
                    }
                    if let Some(filter) = output_channels {
                        if !filter.iter().any(|c| c == channel) {
                            continue;
                        }
                    }
                    if parent_schema.contains(channel) {
                        outcome.writes.push(ChannelWrite::new(
                            spec.name.clone(),
                            channel.clone(),
                            value.clone(),
                        ));
                    }
                }
                outcome
            }
            Ok(LoopOutcome::Interrupted(records)) => {
                outcome.resolved.clear();
                outcome.interrupts = records;
                outcome
            }
            Ok(LoopOutcome::Cancelled) => {
                outcome.error = Some(GraphError::Cancelled);
                outcome
            }
            Err(error) => {
                // The wrapping node observes the child's error and may
                // degrade instead of failing the parent execution.
                if let Some(handler) = on_error {
                    if let Some(update) = handler(&error) {
                        tracing::warn!(
                            node = %spec.name,
                            error = %error,
                            "subgraph failed, node degraded"
                        );
                        outcome.status = NodeStatus::Degraded;
                        let mut entries: Vec<(String, Value)> = update.into_iter().collect();
                        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                        for (channel, value) in entries {
                            outcome
                                .writes
                                .push(ChannelWrite::new(spec.name.clone(), channel, value));
                        }
                        return outcome;
                    }
                }
                outcome.error = Some(error);
                outcome
            }
        }
    }

    async fn subgraph_init(
        &self,
        thread_id: &str,
        child_ns: &str,
        graph: &CompiledGraph,
        parent_state: &HashMap<String, Value>,
        resumes: &[(InterruptRecord, Value)],
    ) -> Result<LoopInit> {
        let config = CheckpointConfig::new(thread_id).with_namespace(child_ns.to_string());
        let existing = self.store.get_tuple(&config).await?;

        if let Some(tuple) = existing {
            if !tuple.metadata.pending_interrupts.is_empty() {
                let pending = tuple.metadata.pending_interrupts.clone();
                let resume_map: HashMap<String, Value> = resumes
                    .iter()
                    .map(|(r, v)| (r.interrupt_id.clone(), v.clone()))
                    .collect();
                return Ok(LoopInit {
                    parent_id: Some(tuple.checkpoint.id.clone()),
                    step: tuple.metadata.step + 1,
                    checkpoint: tuple.checkpoint,
                    pending,
                    resume_map,
                });
            }
        }

        // Fresh invocation: project the parent state onto the child schema.
        let schema = graph.schema();
        let mut channel_values = schema.initial_values();
        let mut channel_versions = HashMap::new();
        let writes: Vec<ChannelWrite> = parent_state
            .iter()
            .filter(|(channel, _)| schema.contains(channel))
            .map(|(channel, value)| ChannelWrite::new(INPUT_NODE, channel.clone(), value.clone()))
            .collect();
        apply_writes(schema, &mut channel_values, &mut channel_versions, &writes)?;

        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_values = channel_values;
        checkpoint.channel_versions = channel_versions;
        checkpoint.next_nodes = vec![graph.entry().to_string()];
        checkpoint.last_seq_id = self.seq.load(Ordering::SeqCst);

        self.store
            .put(
                &config,
                checkpoint.clone(),
                CheckpointMetadata::input(),
                Vec::new(),
            )
            .await?;

        Ok(LoopInit {
            parent_id: Some(checkpoint.id.clone()),
            checkpoint,
            step: 0,
            pending: Vec::new(),
            resume_map: HashMap::new(),
        })
    }
}

/// The node of `parent_ns` a suspension site belongs to.
///
/// `source` is `namespace:node`; for an interrupt raised inside a subgraph
/// the owning node is the first path segment below `parent_ns`.
fn owning_node(source: &str, parent_ns: &str) -> Option<String> {
    let rest = if parent_ns.is_empty() {
        match source.strip_prefix(':') {
            Some(direct) => direct.to_string(),
            None => source.to_string(),
        }
    } else {
        source.strip_prefix(&format!("{}:", parent_ns))?.to_string()
    };
    rest.split(':').next().map(str::to_string)
}

fn normalize_node_error(error: GraphError, node: &str, namespace: &str) -> GraphError {
    match error {
        GraphError::NodeError { kind, message, .. } => GraphError::NodeError {
            node: node.to_string(),
            namespace: namespace.to_string(),
            kind,
            message,
        },
        other => other,
    }
}
