//! Interrupt coordination: deterministic ids, payloads and resume routing.
//!
//! A node suspends the execution by calling
//! [`NodeContext::interrupt`](crate::node::NodeContext::interrupt). The
//! suspension site - namespace, node and superstep - hashes to a
//! deterministic [`interrupt_id`], so re-running the same superstep after a
//! crash reproduces the same id, and parallel branches (whose namespaces
//! differ) always produce distinct ids.
//!
//! On resume the node is re-entered **from its entry** with the resume
//! value available as the `interrupt` call's return. Nodes performing
//! externally visible side effects before interrupting must guard them
//! with a state flag they set after the side effect.

use crate::command::ResumeValue;
use crate::error::{GraphError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use valgraph_checkpoint::InterruptRecord;

/// Derive the deterministic id for a suspension site
pub fn interrupt_id(namespace: &str, node: &str, step: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"|");
    hasher.update(node.as_bytes());
    hasher.update(b"|");
    hasher.update(step.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Build the record persisted with the checkpoint that triggered it
pub fn make_record(
    namespace: &str,
    node: &str,
    step: i64,
    payload: Value,
    resume_channel: &str,
) -> InterruptRecord {
    InterruptRecord {
        interrupt_id: interrupt_id(namespace, node, step),
        payload,
        resume_channel: resume_channel.to_string(),
        source: format!("{}:{}", namespace, node),
    }
}

/// A schema-driven interrupt payload
///
/// The shape the boundary surfaces to UIs: a `kind` discriminator plus an
/// input schema the client renders a form from.
#[derive(Debug, Clone)]
pub struct InterruptPayload {
    kind: String,
    schema: Option<Value>,
    ui_schema: Option<Value>,
    title: Option<String>,
    description: Option<String>,
    extra: HashMap<String, Value>,
}

impl InterruptPayload {
    /// Start a payload of the given kind (e.g. `"approval"`)
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            schema: None,
            ui_schema: None,
            title: None,
            description: None,
            extra: HashMap::new(),
        }
    }

    /// JSON Schema describing the expected resume value
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// UI rendering hints
    pub fn with_ui_schema(mut self, ui_schema: Value) -> Self {
        self.ui_schema = Some(ui_schema);
        self
    }

    /// Short title shown to the reviewer
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Longer description shown to the reviewer
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an arbitrary field (amounts, tickers, previews)
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Render as the JSON carried in the interrupt record
    pub fn into_value(self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("kind".to_string(), Value::String(self.kind));
        if let Some(schema) = self.schema {
            map.insert("schema".to_string(), schema);
        }
        if let Some(ui_schema) = self.ui_schema {
            map.insert("ui_schema".to_string(), ui_schema);
        }
        if let Some(title) = self.title {
            map.insert("title".to_string(), Value::String(title));
        }
        if let Some(description) = self.description {
            map.insert("description".to_string(), Value::String(description));
        }
        for (key, value) in self.extra {
            map.insert(key, value);
        }
        Value::Object(map)
    }
}

/// Route caller-supplied resume values onto the pending interrupt set.
///
/// Returns a map from interrupt id to resume value. An untargeted value is
/// accepted only when exactly one interrupt is pending; a targeted value
/// must name a pending id.
pub fn route_resumes(
    pending: &[InterruptRecord],
    resumes: &[ResumeValue],
) -> Result<HashMap<String, Value>> {
    let mut routed = HashMap::new();
    for resume in resumes {
        match &resume.interrupt_id {
            Some(id) => {
                if !pending.iter().any(|r| &r.interrupt_id == id) {
                    return Err(GraphError::UnknownInterrupt {
                        interrupt_id: id.clone(),
                    });
                }
                routed.insert(id.clone(), resume.value.clone());
            }
            None => {
                if pending.len() != 1 {
                    return Err(GraphError::Validation(format!(
                        "untargeted resume requires exactly one pending interrupt, found {}",
                        pending.len()
                    )));
                }
                routed.insert(pending[0].interrupt_id.clone(), resume.value.clone());
            }
        }
    }
    Ok(routed)
}

/// Validate a resume value against the schema its interrupt advertised
#[cfg(feature = "json-validation")]
pub fn validate_resume(record: &InterruptRecord, value: &Value) -> Result<()> {
    let Some(schema) = record.payload.get("schema") else {
        return Ok(());
    };
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| GraphError::Validation(format!("interrupt schema invalid: {}", e)))?;
    if let Err(errors) = compiled.validate(value) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(GraphError::Validation(format!(
            "resume value rejected by interrupt schema: {}",
            detail.join("; ")
        )));
    }
    Ok(())
}
