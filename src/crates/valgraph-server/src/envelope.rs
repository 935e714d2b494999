//! The versioned wire event envelope.
//!
//! Every SSE `data:` line is one [`EventEnvelope`]: protocol version,
//! per-thread monotonic `seq_id`, thread and run ids, a type tag and a
//! type-specific `data` object. The envelope is the only shape clients
//! ever see; internal state never crosses the boundary verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use valgraph_core::{EndReason, NodeStatus, RuntimeEvent};

/// Source tag for events produced by the runtime itself
pub const RUNTIME_SOURCE: &str = "runtime";

/// One wire event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Protocol version, e.g. `"v1"`
    pub protocol_version: String,
    /// Strictly monotonic per thread
    pub seq_id: u64,
    /// Owning thread
    pub thread_id: String,
    /// Execution this event belongs to
    pub run_id: String,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type tag, e.g. `"node.start"`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Where the event originated (`namespace:node` or `"runtime"`)
    pub source: String,
    /// Type-specific payload
    pub data: Value,
}

fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Ok => "ok",
        NodeStatus::Error => "error",
        NodeStatus::Degraded => "degraded",
    }
}

fn reason_str(reason: EndReason) -> &'static str {
    match reason {
        EndReason::Complete => "complete",
        EndReason::Interrupted => "interrupted",
        EndReason::Cancelled => "cancelled",
        EndReason::Error => "error",
    }
}

/// Project a runtime event onto its wire `(type, source, data)` triple
pub fn wire_shape(event: &RuntimeEvent) -> (&'static str, String, Value) {
    match event {
        RuntimeEvent::LifecycleStart { input_summary } => (
            "lifecycle.start",
            RUNTIME_SOURCE.to_string(),
            json!({ "input_summary": input_summary }),
        ),
        RuntimeEvent::LifecycleEnd { reason, error } => {
            let mut data = json!({ "reason": reason_str(*reason) });
            if let Some(info) = error {
                data["error"] = json!({ "kind": info.kind, "message": info.message });
            }
            ("lifecycle.end", RUNTIME_SOURCE.to_string(), data)
        }
        RuntimeEvent::NodeStart { name, namespace } => (
            "node.start",
            format!("{}:{}", namespace, name),
            json!({ "name": name, "namespace": namespace }),
        ),
        RuntimeEvent::NodeEnd {
            name,
            namespace,
            status,
        } => (
            "node.end",
            format!("{}:{}", namespace, name),
            json!({ "name": name, "namespace": namespace, "status": status_str(*status) }),
        ),
        RuntimeEvent::StateUpdate {
            channel,
            value,
            namespace,
            node_statuses,
        } => {
            let statuses: serde_json::Map<String, Value> = node_statuses
                .iter()
                .map(|(node, status)| (node.clone(), json!(status_str(*status))))
                .collect();
            (
                "state.update",
                RUNTIME_SOURCE.to_string(),
                json!({
                    "channel": channel,
                    "value": value,
                    "namespace": namespace,
                    "node_statuses": statuses,
                }),
            )
        }
        RuntimeEvent::ContentDelta { stream_id, text } => (
            "content.delta",
            RUNTIME_SOURCE.to_string(),
            json!({ "stream_id": stream_id, "text": text }),
        ),
        RuntimeEvent::InterruptRequest { record } => (
            "interrupt.request",
            record.source.clone(),
            json!({ "interrupt_id": record.interrupt_id, "payload": record.payload }),
        ),
        RuntimeEvent::InterruptResolved { interrupt_id } => (
            "interrupt.resolved",
            RUNTIME_SOURCE.to_string(),
            json!({ "interrupt_id": interrupt_id }),
        ),
        RuntimeEvent::Error { info } => {
            let mut data = json!({ "kind": info.kind, "message": info.message });
            if let Some(node) = &info.node {
                data["node"] = json!(node);
            }
            if let Some(namespace) = &info.namespace {
                data["namespace"] = json!(namespace);
            }
            (
                "error",
                info.namespace
                    .as_deref()
                    .map(|ns| format!("{}:{}", ns, info.node.as_deref().unwrap_or("")))
                    .unwrap_or_else(|| RUNTIME_SOURCE.to_string()),
                data,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lifecycle_end_shape() {
        let event = RuntimeEvent::LifecycleEnd {
            reason: EndReason::Complete,
            error: None,
        };
        let (event_type, source, data) = wire_shape(&event);
        assert_eq!(event_type, "lifecycle.end");
        assert_eq!(source, "runtime");
        assert_eq!(data["reason"], json!("complete"));
        assert!(data.get("error").is_none());
    }

    #[test]
    fn test_node_end_source_is_namespaced() {
        let event = RuntimeEvent::NodeEnd {
            name: "approve".to_string(),
            namespace: "debate:bull".to_string(),
            status: NodeStatus::Ok,
        };
        let (_, source, data) = wire_shape(&event);
        assert_eq!(source, "debate:bull:approve");
        assert_eq!(data["status"], json!("ok"));
    }

    #[test]
    fn test_state_update_statuses() {
        let mut statuses = HashMap::new();
        statuses.insert("news".to_string(), NodeStatus::Degraded);
        let event = RuntimeEvent::StateUpdate {
            channel: "sentiment".to_string(),
            value: json!("unavailable"),
            namespace: String::new(),
            node_statuses: statuses,
        };
        let (_, _, data) = wire_shape(&event);
        assert_eq!(data["node_statuses"]["news"], json!("degraded"));
    }

    #[test]
    fn test_envelope_serialization_round_trip() {
        let envelope = EventEnvelope {
            protocol_version: "v1".to_string(),
            seq_id: 7,
            thread_id: "t1".to_string(),
            run_id: "r1".to_string(),
            timestamp: Utc::now(),
            event_type: "heartbeat".to_string(),
            source: RUNTIME_SOURCE.to_string(),
            data: json!({ "active_nodes": ["valuation"] }),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("\"type\":\"heartbeat\""));
        let back: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }
}
