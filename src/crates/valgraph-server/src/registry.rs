//! Thread registry: one active execution per thread.
//!
//! The registry owns the mapping from thread id to its dispatcher and
//! execution state, serializes `start` / `resume` / `cancel` entries per
//! thread, spawns the runner task plus its event pump and heartbeat, and
//! garbage-collects idle executions after a grace period (checkpoints
//! always remain in the store).
//!
//! Execution states: `idle → running → (suspended ⇄ running) → terminated`.

use crate::artifacts::ArtifactStore;
use crate::config::EngineConfig;
use crate::dispatch::{ReplayGap, Subscription, ThreadDispatcher};
use crate::envelope::RUNTIME_SOURCE;
use crate::mapper::MapperRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use valgraph_core::{
    cancel_pair, update_state, CancelHandle, CompiledGraph, GraphError, GraphRunner, ResumeValue,
    RunInput, RunOutcome, RunnerConfig, RuntimeEvent,
};
use valgraph_checkpoint::{
    CheckpointConfig, CheckpointStore, CheckpointTuple, InterruptRecord, ListFilter,
};

/// A compiled graph plus its boundary wiring, fixed per deployment
#[derive(Clone)]
pub struct GraphDeployment {
    /// The topology every thread of this deployment runs
    pub graph: Arc<CompiledGraph>,
    /// Translates an inbound message into input channel values
    pub input: Arc<dyn Fn(&Value) -> HashMap<String, Value> + Send + Sync>,
    /// Outbound per-channel normalizers
    pub mappers: MapperRegistry,
}

impl GraphDeployment {
    /// Deployment with the default input translation: an object's entries
    /// land on the channels the schema declares; anything else lands on a
    /// `message` channel when one exists.
    pub fn new(graph: CompiledGraph) -> Self {
        let graph = Arc::new(graph);
        let schema_graph = graph.clone();
        let input = Arc::new(move |message: &Value| {
            let schema = schema_graph.schema();
            let mut values = HashMap::new();
            match message {
                Value::Object(map) => {
                    for (key, value) in map {
                        if schema.contains(key) {
                            values.insert(key.clone(), value.clone());
                        }
                    }
                }
                other => {
                    if schema.contains("message") {
                        values.insert("message".to_string(), other.clone());
                    }
                }
            }
            values
        });
        Self {
            graph,
            input,
            mappers: MapperRegistry::new(),
        }
    }

    /// Replace the input translation
    pub fn with_input<F>(mut self, input: F) -> Self
    where
        F: Fn(&Value) -> HashMap<String, Value> + Send + Sync + 'static,
    {
        self.input = Arc::new(input);
        self
    }

    /// Set the outbound mappers
    pub fn with_mappers(mut self, mappers: MapperRegistry) -> Self {
        self.mappers = mappers;
        self
    }
}

/// Registry-level errors, mapped onto HTTP statuses by the boundary
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The thread already has an active execution
    #[error("Thread '{0}' already has an active execution")]
    AlreadyRunning(String),

    /// Resume addressed a thread that is not suspended
    #[error("Thread '{0}' is not suspended")]
    NotSuspended(String),

    /// Unknown thread
    #[error("Thread '{0}' not found")]
    NotFound(String),

    /// Runtime or store failure
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl RegistryError {
    /// Stable wire kind
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::AlreadyRunning(_) => "already_running",
            RegistryError::NotSuspended(_) => "not_suspended",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Graph(e) => e.kind(),
        }
    }
}

/// Lifecycle state of a thread's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    /// No execution yet
    Idle,
    /// An execution is in flight
    Running,
    /// Awaiting one or more resume values
    Suspended,
    /// Last execution ended
    Terminated,
}

enum ExecState {
    Idle,
    Running,
    Suspended(Vec<InterruptRecord>),
    Terminated,
}

/// Snapshot returned for reattach
#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    /// Thread id
    pub thread_id: String,
    /// Last emitted sequence id
    pub last_seq_id: u64,
    /// Current lifecycle state
    pub status: ThreadStatus,
    /// First pending interrupt, when suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptView>,
}

/// Caller-visible interrupt summary
#[derive(Debug, Clone, Serialize)]
pub struct InterruptView {
    /// Interrupt id to address the resume to
    pub id: String,
    /// Schema-driven payload
    pub payload: Value,
}

struct ThreadEntry {
    thread_id: String,
    dispatcher: Arc<ThreadDispatcher>,
    state: Mutex<ExecState>,
    cancel: Mutex<Option<CancelHandle>>,
    active_nodes: Arc<Mutex<Vec<String>>>,
    finished_at: Mutex<Option<Instant>>,
    entry_lock: tokio::sync::Mutex<()>,
}

/// Coordinates every thread's single active execution
pub struct ThreadRegistry {
    threads: DashMap<String, Arc<ThreadEntry>>,
    store: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    deployment: GraphDeployment,
    config: Arc<EngineConfig>,
}

impl ThreadRegistry {
    /// Create a registry over a store, an artifact store and a deployment
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        artifacts: Arc<dyn ArtifactStore>,
        deployment: GraphDeployment,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            threads: DashMap::new(),
            store,
            artifacts,
            deployment,
            config,
        })
    }

    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            recursion_limit: self.config.recursion_limit,
            default_node_timeout: self.config.node_default_timeout,
            default_retry: self.config.default_retry.clone(),
        }
    }

    async fn latest_root(&self, thread_id: &str) -> Result<Option<CheckpointTuple>, RegistryError> {
        Ok(self
            .store
            .get_tuple(&CheckpointConfig::new(thread_id))
            .await
            .map_err(GraphError::from)?)
    }

    async fn entry(&self, thread_id: &str) -> Result<Arc<ThreadEntry>, RegistryError> {
        if let Some(entry) = self.threads.get(thread_id) {
            return Ok(entry.clone());
        }

        // First sighting this process: recover seq and suspension state
        // from the latest checkpoint.
        let tuple = self.latest_root(thread_id).await?;
        let (last_seq, state) = match &tuple {
            Some(tuple) => {
                let pending = tuple.metadata.pending_interrupts.clone();
                let state = if pending.is_empty() {
                    ExecState::Idle
                } else {
                    ExecState::Suspended(pending)
                };
                (tuple.checkpoint.last_seq_id, state)
            }
            None => (0, ExecState::Idle),
        };

        let entry = Arc::new(ThreadEntry {
            thread_id: thread_id.to_string(),
            dispatcher: Arc::new(ThreadDispatcher::new(
                thread_id,
                self.config.protocol_version.clone(),
                last_seq,
                self.config.replay_buffer_capacity,
                self.config.subscriber_queue_capacity,
            )),
            state: Mutex::new(state),
            cancel: Mutex::new(None),
            active_nodes: Arc::new(Mutex::new(Vec::new())),
            finished_at: Mutex::new(None),
            entry_lock: tokio::sync::Mutex::new(()),
        });
        Ok(self
            .threads
            .entry(thread_id.to_string())
            .or_insert(entry)
            .clone())
    }

    /// Start a new execution from caller input.
    ///
    /// With no `thread_id` a fresh thread is created; its id is returned
    /// and carried in the initial `lifecycle.start` event's envelope.
    pub async fn start(
        self: &Arc<Self>,
        thread_id: Option<String>,
        message: &Value,
    ) -> Result<String, RegistryError> {
        let thread_id = match thread_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        let entry = self.entry(&thread_id).await?;
        let _guard = entry.entry_lock.lock().await;

        if matches!(*entry.state.lock(), ExecState::Running) {
            return Err(RegistryError::AlreadyRunning(thread_id));
        }

        let values = (self.deployment.input)(message);
        self.spawn_execution(entry.clone(), RunInput::Message(values));
        Ok(thread_id)
    }

    /// Resume a suspended thread, or continue an idle one after a restart
    /// when `resumes` is empty.
    pub async fn resume(
        self: &Arc<Self>,
        thread_id: &str,
        resumes: Vec<ResumeValue>,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(thread_id).await?;
        let _guard = entry.entry_lock.lock().await;

        if matches!(*entry.state.lock(), ExecState::Running) {
            return Err(RegistryError::AlreadyRunning(thread_id.to_string()));
        }
        let tuple = self
            .latest_root(thread_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(thread_id.to_string()))?;
        if !resumes.is_empty() && tuple.metadata.pending_interrupts.is_empty() {
            return Err(RegistryError::NotSuspended(thread_id.to_string()));
        }

        self.spawn_execution(entry.clone(), RunInput::Resume(resumes));
        Ok(())
    }

    fn spawn_execution(self: &Arc<Self>, entry: Arc<ThreadEntry>, input: RunInput) {
        let run_id = Uuid::new_v4().to_string();
        entry.dispatcher.begin_run(run_id.clone());
        *entry.state.lock() = ExecState::Running;
        *entry.finished_at.lock() = None;

        let (handle, token) = cancel_pair();
        *entry.cancel.lock() = Some(handle.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel::<RuntimeEvent>();
        let runner = GraphRunner::new(
            self.deployment.graph.clone(),
            self.store.clone(),
            events_tx,
        )
        .with_config(self.runner_config())
        .with_cancel(token)
        .with_seq_counter(entry.dispatcher.seq_counter());

        let pump = self.spawn_pump(entry.clone(), events_rx);
        let heartbeat = self.spawn_heartbeat(entry.clone());

        let registry = self.clone();
        let exec_entry = entry.clone();
        tokio::spawn(async move {
            let thread_id = exec_entry.thread_id.clone();
            let result = {
                let run_fut = runner.run(&thread_id, input);
                tokio::pin!(run_fut);
                match registry.config.execution_timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut run_fut).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(%thread_id, "execution wall-clock budget spent, cancelling");
                            handle.cancel();
                            // Bounded grace for cooperative shutdown, then force.
                            match tokio::time::timeout(Duration::from_secs(5), &mut run_fut).await
                            {
                                Ok(result) => result,
                                Err(_) => Err(GraphError::Timeout {
                                    operation: "execution".to_string(),
                                    seconds: limit.as_secs(),
                                }),
                            }
                        }
                    },
                    None => run_fut.await,
                }
            };

            // Drop the runner (and with it the event sender) so the pump
            // drains to completion.
            drop(runner);
            let _ = pump.await;
            heartbeat.abort();

            let next_state = match &result {
                Ok(RunOutcome::Interrupted(records)) => ExecState::Suspended(records.clone()),
                Ok(_) | Err(_) => ExecState::Terminated,
            };
            if let Err(error) = &result {
                // Force-terminate path: the runner never got to emit its
                // terminal events.
                if matches!(error, GraphError::Timeout { .. })
                    && matches!(registry.config.execution_timeout, Some(_))
                {
                    exec_entry.dispatcher.publish_raw(
                        "error",
                        RUNTIME_SOURCE.to_string(),
                        json!({ "kind": error.kind(), "message": error.to_string() }),
                    );
                    exec_entry.dispatcher.publish_raw(
                        "lifecycle.end",
                        RUNTIME_SOURCE.to_string(),
                        json!({
                            "reason": "error",
                            "error": { "kind": error.kind(), "message": error.to_string() },
                        }),
                    );
                }
                tracing::error!(%thread_id, error = %error, "execution terminated with error");
            }
            *exec_entry.state.lock() = next_state;
            *exec_entry.cancel.lock() = None;
            *exec_entry.finished_at.lock() = Some(Instant::now());
            exec_entry.active_nodes.lock().clear();
            // The ring stays until the last subscriber detaches (or the
            // cleanup pass collects the entry): a subscriber attaching
            // right after completion still replays the finished run.
        });
    }

    fn spawn_pump(
        &self,
        entry: Arc<ThreadEntry>,
        mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let mappers = self.deployment.mappers.clone();
        let artifacts = self.artifacts.clone();
        let inline_limit = self.config.artifact_inline_limit;

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    RuntimeEvent::NodeStart { name, .. } => {
                        entry.active_nodes.lock().push(name.clone());
                    }
                    RuntimeEvent::NodeEnd { name, .. } => {
                        entry.active_nodes.lock().retain(|n| n != name);
                    }
                    _ => {}
                }

                if let RuntimeEvent::StateUpdate {
                    channel,
                    value,
                    namespace,
                    node_statuses,
                } = &event
                {
                    let normalized = match mappers.normalize(channel, value) {
                        Ok(normalized) => normalized,
                        Err(error) => {
                            // Never emit partial JSON: surface the failure
                            // and drop the update.
                            tracing::error!(%channel, error = %error, "state mapper failed");
                            entry.dispatcher.publish_raw(
                                "error",
                                RUNTIME_SOURCE.to_string(),
                                json!({ "kind": "validation", "message": error.to_string() }),
                            );
                            continue;
                        }
                    };
                    let outbound = offload_large_value(
                        &artifacts,
                        &entry.thread_id,
                        channel,
                        normalized,
                        inline_limit,
                    )
                    .await;
                    entry.dispatcher.publish(&RuntimeEvent::StateUpdate {
                        channel: channel.clone(),
                        value: outbound,
                        namespace: namespace.clone(),
                        node_statuses: node_statuses.clone(),
                    });
                    continue;
                }

                entry.dispatcher.publish(&event);
            }
        })
    }

    fn spawn_heartbeat(&self, entry: Arc<ThreadEntry>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if entry.dispatcher.idle_seconds() >= interval.as_secs_f64() {
                    let active = entry.active_nodes.lock().clone();
                    entry.dispatcher.publish_heartbeat(&active);
                }
            }
        })
    }

    /// Attach a subscriber to the thread's event stream
    pub async fn attach(
        &self,
        thread_id: &str,
        last_event_id: Option<u64>,
    ) -> Result<Result<Subscription, ReplayGap>, RegistryError> {
        let entry = self.entry(thread_id).await?;
        Ok(entry.dispatcher.attach(last_event_id))
    }

    /// Detach a subscriber
    pub async fn detach(&self, thread_id: &str, subscriber_id: u64) {
        if let Some(entry) = self.threads.get(thread_id) {
            entry.dispatcher.detach(subscriber_id);
            let terminated = matches!(
                *entry.state.lock(),
                ExecState::Terminated | ExecState::Idle
            );
            if terminated && entry.dispatcher.subscriber_count() == 0 {
                entry.dispatcher.release_ring();
            }
        }
    }

    /// Cancel the active execution, or discard a suspension
    pub async fn cancel(&self, thread_id: &str) -> Result<(), RegistryError> {
        if self.threads.get(thread_id).is_none() && self.latest_root(thread_id).await?.is_none() {
            return Err(RegistryError::NotFound(thread_id.to_string()));
        }
        let entry = self.entry(thread_id).await?;
        let mut state = entry.state.lock();
        match &*state {
            ExecState::Running => {
                if let Some(handle) = entry.cancel.lock().as_ref() {
                    handle.cancel();
                }
            }
            ExecState::Suspended(_) => {
                // Pending interrupts are discarded; checkpoints remain.
                *state = ExecState::Terminated;
                *entry.finished_at.lock() = Some(Instant::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Reattach snapshot for `GET /threads/{id}`
    pub async fn view(&self, thread_id: &str) -> Result<ThreadView, RegistryError> {
        let in_memory = self.threads.get(thread_id).map(|e| e.value().clone());
        let tuple = self.latest_root(thread_id).await?;
        if in_memory.is_none() && tuple.is_none() {
            return Err(RegistryError::NotFound(thread_id.to_string()));
        }

        let pending: Vec<InterruptRecord> = match (&in_memory, &tuple) {
            (Some(entry), _) => match &*entry.state.lock() {
                ExecState::Suspended(records) => records.clone(),
                ExecState::Running => Vec::new(),
                _ => tuple
                    .as_ref()
                    .map(|t| t.metadata.pending_interrupts.clone())
                    .unwrap_or_default(),
            },
            (None, Some(tuple)) => tuple.metadata.pending_interrupts.clone(),
            (None, None) => Vec::new(),
        };

        let status = match &in_memory {
            Some(entry) => match &*entry.state.lock() {
                ExecState::Running => ThreadStatus::Running,
                ExecState::Suspended(_) => ThreadStatus::Suspended,
                ExecState::Terminated => ThreadStatus::Terminated,
                ExecState::Idle => {
                    if pending.is_empty() {
                        ThreadStatus::Idle
                    } else {
                        ThreadStatus::Suspended
                    }
                }
            },
            None => {
                if pending.is_empty() {
                    ThreadStatus::Idle
                } else {
                    ThreadStatus::Suspended
                }
            }
        };

        let last_seq_id = match &in_memory {
            Some(entry) => entry.dispatcher.last_seq(),
            None => tuple.as_ref().map(|t| t.checkpoint.last_seq_id).unwrap_or(0),
        };

        Ok(ThreadView {
            thread_id: thread_id.to_string(),
            last_seq_id,
            status,
            interrupt: pending.first().map(|record| InterruptView {
                id: record.interrupt_id.clone(),
                payload: record.payload.clone(),
            }),
        })
    }

    /// Checkpoint history for `GET /threads/{id}/history`
    pub async fn history(
        &self,
        thread_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<CheckpointTuple>, RegistryError> {
        if self.latest_root(thread_id).await?.is_none() {
            return Err(RegistryError::NotFound(thread_id.to_string()));
        }
        Ok(self
            .store
            .list(thread_id, filter)
            .await
            .map_err(GraphError::from)?)
    }

    /// Manual state update (time travel) via the entry lock
    pub async fn update_thread_state(
        &self,
        thread_id: &str,
        checkpoint_id: Option<String>,
        values: HashMap<String, Value>,
        as_node: Option<&str>,
    ) -> Result<String, RegistryError> {
        let entry = self.entry(thread_id).await?;
        let _guard = entry.entry_lock.lock().await;
        if matches!(*entry.state.lock(), ExecState::Running) {
            return Err(RegistryError::AlreadyRunning(thread_id.to_string()));
        }
        let mut config = CheckpointConfig::new(thread_id);
        if let Some(id) = checkpoint_id {
            config = config.with_checkpoint_id(id);
        }
        let stored = update_state(
            &self.store,
            self.deployment.graph.as_ref(),
            &config,
            values,
            as_node,
        )
        .await?;
        Ok(stored.checkpoint_id.unwrap_or_default())
    }

    /// Delete a thread: checkpoints now, artifacts after the retention
    /// window.
    pub async fn delete_thread(self: &Arc<Self>, thread_id: &str) -> Result<(), RegistryError> {
        if self.latest_root(thread_id).await?.is_none() {
            return Err(RegistryError::NotFound(thread_id.to_string()));
        }
        let entry = self.entry(thread_id).await?;
        let _guard = entry.entry_lock.lock().await;
        if matches!(*entry.state.lock(), ExecState::Running) {
            return Err(RegistryError::AlreadyRunning(thread_id.to_string()));
        }
        self.store
            .delete_thread(thread_id)
            .await
            .map_err(GraphError::from)?;
        self.threads.remove(thread_id);

        let artifacts = self.artifacts.clone();
        let grace = self.config.cleanup_grace;
        let owner = thread_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(error) = artifacts.delete_thread(&owner).await {
                tracing::warn!(thread_id = %owner, error = %error, "artifact cleanup failed");
            }
        });
        Ok(())
    }

    /// Periodic collection of idle terminated executions
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let grace = registry.config.cleanup_grace;
                registry.threads.retain(|_, entry| {
                    entry.dispatcher.prune_closed();
                    let done = matches!(
                        *entry.state.lock(),
                        ExecState::Terminated | ExecState::Idle
                    );
                    let no_subscribers = entry.dispatcher.subscriber_count() == 0;
                    let aged = entry
                        .finished_at
                        .lock()
                        .map(|at| at.elapsed() > grace)
                        .unwrap_or(false);
                    !(done && no_subscribers && aged)
                });
            }
        })
    }
}

async fn offload_large_value(
    artifacts: &Arc<dyn ArtifactStore>,
    thread_id: &str,
    channel: &str,
    value: Value,
    inline_limit: usize,
) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= inline_limit {
        return value;
    }
    let mut preview = serialized.clone();
    preview.truncate(160);
    match artifacts
        .put(thread_id, "json", Some(preview), serialized.into_bytes())
        .await
    {
        Ok(reference) => {
            tracing::debug!(thread_id, channel, artifact_id = %reference.artifact_id, "state value offloaded");
            serde_json::to_value(&reference).unwrap_or(Value::Null)
        }
        Err(error) => {
            tracing::warn!(thread_id, channel, error = %error, "artifact offload failed, value kept inline");
            value
        }
    }
}
