//! HTTP handlers for the streaming surface.
//!
//! Inbound payloads parse against strict schemas (`deny_unknown_fields`);
//! a request with neither a message nor a resume value is rejected before
//! any thread state is mutated. The SSE stream always carries a terminal
//! `lifecycle.end` (or a terminal subscriber error) before closing.

use crate::api::error::{ApiError, ApiResult};
use crate::config::EngineConfig;
use crate::dispatch::Subscription;
use crate::engine::Engine;
use crate::envelope::{EventEnvelope, RUNTIME_SOURCE};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use valgraph_checkpoint::ListFilter;
use valgraph_core::ResumeValue;

/// `POST /stream` request body
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamRequest {
    /// Target thread; empty or absent creates a new thread
    #[serde(default)]
    pub thread_id: Option<String>,
    /// New input message
    #[serde(default)]
    pub message: Option<Value>,
    /// Resume value for a suspended thread
    #[serde(default)]
    pub resume_payload: Option<ResumePayload>,
}

/// Resume addressing within a stream request
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumePayload {
    /// Interrupt to resolve; optional when exactly one is pending
    #[serde(default)]
    pub interrupt_id: Option<String>,
    /// The value handed to the interrupted node; absent means "continue"
    #[serde(default)]
    pub value: Option<Value>,
}

/// `POST /threads/{id}/state` request body
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStateRequest {
    /// Channel values applied through the reducers
    pub values: HashMap<String, Value>,
    /// Checkpoint to parent the update on; latest when absent
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// Apply the values as if this node emitted them
    #[serde(default)]
    pub as_node: Option<String>,
}

/// `GET /threads/{id}/history` query parameters
#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    /// Page size
    #[serde(default)]
    pub limit: Option<usize>,
    /// Pagination cursor: checkpoint id from the previous page
    #[serde(default)]
    pub before: Option<String>,
    /// Restrict to one namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// One history entry
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    /// Checkpoint id
    pub id: String,
    /// Parent checkpoint id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Namespace the checkpoint belongs to
    pub namespace: String,
    /// Creation timestamp
    pub created_at: chrono::DateTime<Utc>,
    /// Checkpoint source
    pub source: String,
    /// Superstep number
    pub step: i64,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::field("body", e.to_string(), "invalid_json"))
}

fn check_protocol_version(headers: &HeaderMap, config: &EngineConfig) -> ApiResult<()> {
    if let Some(raw) = headers.get("x-protocol-version") {
        let presented = raw.to_str().unwrap_or_default();
        if presented != config.protocol_version {
            return Err(ApiError::BadRequest(format!(
                "version_mismatch: server speaks {}, client presented {}",
                config.protocol_version, presented
            )));
        }
    }
    Ok(())
}

fn last_event_id(headers: &HeaderMap) -> ApiResult<Option<u64>> {
    match headers.get("last-event-id") {
        None => Ok(None),
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest("Last-Event-ID must be an integer".to_string())),
    }
}

fn sse_event(envelope: &EventEnvelope) -> Event {
    let event = Event::default().id(envelope.seq_id.to_string());
    match event.json_data(envelope) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(%error, "envelope failed to serialize");
            Event::default().data("{}")
        }
    }
}

enum StreamStep {
    Live(EventEnvelope),
    Dropped(Option<EventEnvelope>),
    Closed,
}

fn subscription_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let Subscription { replay, mut rx, mut kill, .. } = subscription;
        for envelope in &replay {
            let terminal = envelope.event_type == "lifecycle.end";
            yield Ok(sse_event(envelope));
            if terminal {
                return;
            }
        }
        loop {
            let step = tokio::select! {
                received = rx.recv() => match received {
                    Some(envelope) => StreamStep::Live(envelope),
                    None => StreamStep::Closed,
                },
                dropped = &mut kill => StreamStep::Dropped(dropped.ok()),
            };
            match step {
                StreamStep::Live(envelope) => {
                    let terminal = envelope.event_type == "lifecycle.end";
                    yield Ok(sse_event(&envelope));
                    if terminal {
                        break;
                    }
                }
                StreamStep::Dropped(envelope) => {
                    if let Some(envelope) = envelope {
                        yield Ok(sse_event(&envelope));
                    }
                    break;
                }
                StreamStep::Closed => break,
            }
        }
    }
}

fn terminal_error_stream(
    envelope: EventEnvelope,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(sse_event(&envelope));
    }
}

/// `POST /stream` - start or resume an execution and stream its events
pub async fn stream(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    check_protocol_version(&headers, engine.config())?;
    let request: StreamRequest = parse_body(&body)?;

    if request.message.is_none() && request.resume_payload.is_none() {
        return Err(ApiError::BadRequest(
            "at least one of 'message' or 'resume_payload' is required".to_string(),
        ));
    }

    let registry = engine.registry();
    let thread_id = match (&request.message, &request.resume_payload) {
        (Some(message), _) => registry.start(request.thread_id.clone(), message).await?,
        (None, Some(resume)) => {
            let thread_id = request
                .thread_id
                .clone()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest("resume_payload requires a thread_id".to_string())
                })?;
            let resumes = match &resume.value {
                Some(value) => vec![ResumeValue {
                    interrupt_id: resume.interrupt_id.clone(),
                    value: value.clone(),
                }],
                None => Vec::new(),
            };
            registry.resume(&thread_id, resumes).await?;
            thread_id
        }
        (None, None) => unreachable!("validated above"),
    };

    let attach = registry.attach(&thread_id, last_event_id(&headers)?).await?;
    let keep_alive = KeepAlive::new().interval(engine.config().heartbeat_interval);
    match attach {
        Ok(subscription) => {
            Ok(Sse::new(futures::StreamExt::boxed(subscription_stream(subscription)))
                .keep_alive(keep_alive))
        }
        Err(gap) => {
            // The requested window left the replay ring: terminal error,
            // then close. The client refetches state instead.
            let view = registry.view(&thread_id).await?;
            let envelope = EventEnvelope {
                protocol_version: engine.config().protocol_version.clone(),
                seq_id: view.last_seq_id,
                thread_id: thread_id.clone(),
                run_id: String::new(),
                timestamp: Utc::now(),
                event_type: "error".to_string(),
                source: RUNTIME_SOURCE.to_string(),
                data: json!({
                    "kind": "replay_gap",
                    "message": format!(
                        "events before seq {} are no longer buffered",
                        gap.oldest_buffered
                    ),
                }),
            };
            Ok(Sse::new(futures::StreamExt::boxed(terminal_error_stream(envelope)))
                .keep_alive(keep_alive))
        }
    }
}

/// `GET /threads/{id}` - reattach snapshot
pub async fn get_thread(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let view = engine.registry().view(&thread_id).await?;
    Ok(Json(view))
}

/// `GET /threads/{id}/history` - paginated checkpoint metadata
pub async fn get_history(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = ListFilter {
        namespace: query.namespace,
        before: query.before,
        limit: Some(query.limit.unwrap_or(50).min(500)),
        ..Default::default()
    };
    let tuples = engine.registry().history(&thread_id, &filter).await?;
    let checkpoints: Vec<HistoryEntry> = tuples
        .into_iter()
        .map(|tuple| HistoryEntry {
            id: tuple.checkpoint.id.clone(),
            parent_id: tuple
                .parent_config
                .and_then(|config| config.checkpoint_id),
            namespace: tuple.config.namespace,
            created_at: tuple.checkpoint.ts,
            source: tuple.metadata.source.as_str().to_string(),
            step: tuple.metadata.step,
        })
        .collect();
    let next_before = checkpoints.last().map(|entry| entry.id.clone());
    Ok(Json(json!({
        "thread_id": thread_id,
        "checkpoints": checkpoints,
        "next_before": next_before,
    })))
}

/// `POST /threads/{id}/cancel` - cancel the active execution
pub async fn cancel_thread(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    engine.registry().cancel(&thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /threads/{id}/state` - manual update, forking history
pub async fn update_thread_state(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: UpdateStateRequest = parse_body(&body)?;
    if request.values.is_empty() {
        return Err(ApiError::field("values", "must not be empty", "missing"));
    }
    let checkpoint_id = engine
        .registry()
        .update_thread_state(
            &thread_id,
            request.checkpoint_id,
            request.values,
            request.as_node.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "checkpoint_id": checkpoint_id })))
}

/// `DELETE /threads/{id}` - drop a thread's checkpoints
pub async fn delete_thread(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    engine.registry().delete_thread(&thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
