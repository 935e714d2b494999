//! Write collection and reducer application.
//!
//! All writes of a superstep are applied together at the barrier. Ordering
//! is deterministic: writes sort by `(node, emission index)`, so append
//! channels concatenate in stable node-name order and replaying a superstep
//! reproduces byte-identical state.

use crate::channel::{Reducer, StateSchema};
use crate::error::{GraphError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// A single channel write emitted by a node during a superstep
#[derive(Debug, Clone)]
pub struct ChannelWrite {
    /// Node that emitted the write
    pub node: String,
    /// Target channel
    pub channel: String,
    /// Value written
    pub value: Value,
}

impl ChannelWrite {
    /// Create a write
    pub fn new(
        node: impl Into<String>,
        channel: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            node: node.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Apply a superstep's writes to the channel values.
///
/// Bumps `versions` for every updated channel and returns the updated
/// channel names in sorted order. Overwrite channels reject concurrent
/// writes from distinct nodes with [`GraphError::Conflict`]; nothing is
/// applied in that case.
pub fn apply_writes(
    schema: &StateSchema,
    values: &mut HashMap<String, Value>,
    versions: &mut HashMap<String, u64>,
    writes: &[ChannelWrite],
) -> Result<Vec<String>> {
    for write in writes {
        schema.validate_write(&write.channel, &write.value)?;
    }

    // Detect overwrite conflicts before mutating anything.
    let mut overwrite_writers: HashMap<&str, Vec<&str>> = HashMap::new();
    for write in writes {
        if let Some(spec) = schema.channel(&write.channel) {
            if spec.reducer == Reducer::Overwrite {
                let writers = overwrite_writers.entry(write.channel.as_str()).or_default();
                if !writers.contains(&write.node.as_str()) {
                    writers.push(write.node.as_str());
                }
            }
        }
    }
    for (channel, writers) in &overwrite_writers {
        if writers.len() > 1 {
            let mut nodes: Vec<String> = writers.iter().map(|n| n.to_string()).collect();
            nodes.sort();
            return Err(GraphError::Conflict {
                channel: channel.to_string(),
                nodes,
            });
        }
    }

    let mut ordered: Vec<(usize, &ChannelWrite)> = writes.iter().enumerate().collect();
    ordered.sort_by(|(ia, a), (ib, b)| a.node.cmp(&b.node).then(ia.cmp(ib)));

    let mut updated: Vec<String> = Vec::new();
    for (_, write) in ordered {
        let spec = schema
            .channel(&write.channel)
            .expect("validated above");
        match spec.reducer {
            Reducer::Overwrite => {
                values.insert(write.channel.clone(), write.value.clone());
            }
            Reducer::Append => {
                let entry = values
                    .entry(write.channel.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(items) = entry else {
                    return Err(GraphError::Validation(format!(
                        "append channel '{}' holds a non-array value",
                        write.channel
                    )));
                };
                match &write.value {
                    Value::Array(batch) => items.extend(batch.iter().cloned()),
                    single => items.push(single.clone()),
                }
            }
        }
        if !updated.contains(&write.channel) {
            updated.push(write.channel.clone());
        }
    }

    updated.sort();
    for channel in &updated {
        *versions.entry(channel.clone()).or_insert(0) += 1;
    }
    Ok(updated)
}
