//! Manual state updates and time travel.
//!
//! [`update_state`] writes a *new* checkpoint whose parent is the targeted
//! one, applying the caller's values through the channel reducers exactly
//! as if `as_node` had emitted them. Starting a new run afterwards branches
//! history at that checkpoint; prior branches remain listable.

use crate::error::{GraphError, Result};
use crate::graph::CompiledGraph;
use crate::state::{apply_writes, ChannelWrite};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use valgraph_checkpoint::{
    CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointStore, PendingWrite,
};

/// Pseudo-node name attributed to manual updates with no `as_node`
pub const UPDATE_NODE: &str = "__update__";

/// Apply `values` as a new checkpoint parented on the one `config` addresses.
///
/// Returns the config of the new checkpoint. When `as_node` names a graph
/// node, routing follows that node's edges, so a subsequent run continues
/// as if the node had just produced `values`.
pub async fn update_state(
    store: &Arc<dyn CheckpointStore>,
    graph: &CompiledGraph,
    config: &CheckpointConfig,
    values: HashMap<String, Value>,
    as_node: Option<&str>,
) -> Result<CheckpointConfig> {
    if values.is_empty() {
        return Err(GraphError::Validation(
            "update_state requires at least one channel value".to_string(),
        ));
    }
    let tuple = store
        .get_tuple(config)
        .await?
        .ok_or_else(|| GraphError::NotFound(format!("thread '{}'", config.thread_id)))?;

    let node = as_node.unwrap_or(UPDATE_NODE).to_string();
    let writes: Vec<ChannelWrite> = {
        let mut entries: Vec<(String, Value)> = values.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
            .into_iter()
            .map(|(channel, value)| ChannelWrite::new(node.clone(), channel, value))
            .collect()
    };

    let mut checkpoint = tuple.checkpoint.successor();
    let updated = apply_writes(
        graph.schema(),
        &mut checkpoint.channel_values,
        &mut checkpoint.channel_versions,
        &writes,
    )?;

    // Schedule what the update activates: the acting node's routes plus any
    // channel-triggered readers. An update that activates nothing leaves
    // the inherited schedule in place.
    let mut next: Vec<String> = Vec::new();
    if graph.node(&node).is_some() {
        next.extend(graph.route(&node, &checkpoint.channel_values, None));
    }
    next.extend(graph.triggered_by(&updated));
    next.sort();
    next.dedup();
    if !next.is_empty() {
        checkpoint.next_nodes = next;
    }

    let metadata = CheckpointMetadata {
        source: CheckpointSource::Update,
        step: tuple.metadata.step + 1,
        pending_interrupts: tuple.metadata.pending_interrupts.clone(),
        extra: HashMap::new(),
    };
    let pending_writes: Vec<PendingWrite> = writes
        .iter()
        .map(|w| (node.clone(), w.channel.clone(), w.value.clone()))
        .collect();

    let put_config = CheckpointConfig {
        thread_id: config.thread_id.clone(),
        namespace: config.namespace.clone(),
        checkpoint_id: Some(tuple.checkpoint.id.clone()),
    };
    let stored = store
        .put(&put_config, checkpoint, metadata, pending_writes)
        .await?;
    tracing::debug!(
        thread_id = %config.thread_id,
        parent = %tuple.checkpoint.id,
        "state updated, history forked"
    );
    Ok(stored)
}
