//! Per-thread streaming dispatcher.
//!
//! One [`ThreadDispatcher`] multiplexes a thread's runtime events to any
//! number of SSE subscribers. It owns the three streaming guarantees:
//!
//! - **Monotonic sequencing** - every envelope takes the next `seq_id`
//!   from a per-thread counter (shared with the runner, so checkpoints
//!   snapshot it and restarts continue the order).
//! - **Late attach with replay** - a bounded ring buffers the current
//!   execution's events; a subscriber presenting `Last-Event-ID` replays
//!   everything newer, or is refused with a `replay_gap` when the ring has
//!   already evicted what it needs.
//! - **Backpressure** - subscriber queues are bounded; a full queue drops
//!   that subscriber with a terminal `slow_consumer` error instead of
//!   stalling the graph.

use crate::envelope::{wire_shape, EventEnvelope, RUNTIME_SOURCE};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use valgraph_core::RuntimeEvent;

/// A live subscription returned by [`ThreadDispatcher::attach`]
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id, for [`ThreadDispatcher::detach`]
    pub id: u64,
    /// Buffered events to emit before going live
    pub replay: Vec<EventEnvelope>,
    /// Live event queue
    pub rx: mpsc::Receiver<EventEnvelope>,
    /// Fires with a terminal error envelope when the dispatcher drops this
    /// subscriber (slow consumer)
    pub kill: oneshot::Receiver<EventEnvelope>,
}

/// Attach refusal: the requested replay window left the ring
#[derive(Debug)]
pub struct ReplayGap {
    /// Oldest sequence id still buffered
    pub oldest_buffered: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<EventEnvelope>,
    kill: Option<oneshot::Sender<EventEnvelope>>,
}

struct Inner {
    ring: VecDeque<EventEnvelope>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Fan-out hub for one thread's event stream
pub struct ThreadDispatcher {
    thread_id: String,
    protocol_version: String,
    seq: Arc<AtomicU64>,
    run_id: Mutex<String>,
    ring_capacity: usize,
    queue_capacity: usize,
    inner: Mutex<Inner>,
    last_publish: Mutex<Instant>,
}

impl ThreadDispatcher {
    /// Create a dispatcher whose sequence counter starts at `last_seq_id`
    pub fn new(
        thread_id: impl Into<String>,
        protocol_version: impl Into<String>,
        last_seq_id: u64,
        ring_capacity: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            protocol_version: protocol_version.into(),
            seq: Arc::new(AtomicU64::new(last_seq_id)),
            run_id: Mutex::new(String::new()),
            ring_capacity,
            queue_capacity,
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            last_publish: Mutex::new(Instant::now()),
        }
    }

    /// The shared per-thread sequence counter (handed to the runner so
    /// checkpoints snapshot `last_seq_id`)
    pub fn seq_counter(&self) -> Arc<AtomicU64> {
        self.seq.clone()
    }

    /// Last assigned sequence id
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Begin a new execution: tag subsequent events with its run id and
    /// reset the replay ring (the ring buffers one execution's events)
    pub fn begin_run(&self, run_id: impl Into<String>) {
        *self.run_id.lock() = run_id.into();
        self.inner.lock().ring.clear();
    }

    /// Seconds since the last published event
    pub fn idle_seconds(&self) -> f64 {
        self.last_publish.lock().elapsed().as_secs_f64()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Release the replay ring once the execution is over and the last
    /// subscriber is gone; post-completion reads come from the store.
    pub fn release_ring(&self) {
        self.inner.lock().ring.clear();
    }

    fn make_envelope(
        &self,
        event_type: &str,
        source: String,
        data: serde_json::Value,
    ) -> EventEnvelope {
        EventEnvelope {
            protocol_version: self.protocol_version.clone(),
            seq_id: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.lock().clone(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            source,
            data,
        }
    }

    /// Publish a runtime event to the ring and every subscriber
    pub fn publish(&self, event: &RuntimeEvent) -> EventEnvelope {
        let (event_type, source, data) = wire_shape(event);
        self.publish_raw(event_type, source, data)
    }

    /// Publish a pre-shaped event
    pub fn publish_raw(
        &self,
        event_type: &str,
        source: String,
        data: serde_json::Value,
    ) -> EventEnvelope {
        let mut inner = self.inner.lock();
        let envelope = self.make_envelope(event_type, source, data);

        inner.ring.push_back(envelope.clone());
        while inner.ring.len() > self.ring_capacity {
            inner.ring.pop_front();
        }

        let mut dropped: Vec<Subscriber> = Vec::new();
        let mut kept: Vec<Subscriber> = Vec::new();
        for subscriber in inner.subscribers.drain(..) {
            match subscriber.tx.try_send(envelope.clone()) {
                Ok(()) => kept.push(subscriber),
                Err(mpsc::error::TrySendError::Full(_)) => dropped.push(subscriber),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber went away; nothing to notify.
                }
            }
        }
        inner.subscribers = kept;
        *self.last_publish.lock() = Instant::now();

        for mut subscriber in dropped {
            tracing::warn!(
                thread_id = %self.thread_id,
                subscriber = subscriber.id,
                "dropping slow consumer"
            );
            let terminal = self.make_envelope(
                "error",
                RUNTIME_SOURCE.to_string(),
                json!({
                    "kind": "slow_consumer",
                    "message": "subscriber queue overflowed and was dropped",
                }),
            );
            if let Some(kill) = subscriber.kill.take() {
                let _ = kill.send(terminal);
            }
        }

        envelope
    }

    /// Publish a heartbeat carrying the currently active nodes
    pub fn publish_heartbeat(&self, active_nodes: &[String]) -> EventEnvelope {
        self.publish_raw(
            "heartbeat",
            RUNTIME_SOURCE.to_string(),
            json!({ "active_nodes": active_nodes }),
        )
    }

    /// Attach a subscriber.
    ///
    /// Without `last_event_id` the whole current-execution ring replays
    /// (the subscriber wants the run from its start). With one, buffered
    /// events newer than it replay; an id at or beyond the live sequence
    /// yields no replay; an id older than the ring's oldest entry is
    /// refused with [`ReplayGap`].
    pub fn attach(&self, last_event_id: Option<u64>) -> Result<Subscription, ReplayGap> {
        let mut inner = self.inner.lock();
        let current = self.seq.load(Ordering::SeqCst);

        let replay: Vec<EventEnvelope> = match last_event_id {
            None => inner.ring.iter().cloned().collect(),
            Some(n) if n < current => {
                let oldest = inner.ring.front().map(|e| e.seq_id);
                match oldest {
                    Some(oldest) if oldest <= n + 1 => inner
                        .ring
                        .iter()
                        .filter(|e| e.seq_id > n)
                        .cloned()
                        .collect(),
                    Some(oldest) => return Err(ReplayGap {
                        oldest_buffered: oldest,
                    }),
                    None => {
                        return Err(ReplayGap { oldest_buffered: 0 });
                    }
                }
            }
            _ => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (kill_tx, kill_rx) = oneshot::channel();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            tx,
            kill: Some(kill_tx),
        });
        tracing::debug!(thread_id = %self.thread_id, subscriber = id, replayed = replay.len(), "subscriber attached");

        Ok(Subscription {
            id,
            replay,
            rx,
            kill: kill_rx,
        })
    }

    /// Tear down a subscriber's queue
    pub fn detach(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != subscriber_id);
    }

    /// Drop subscribers whose receivers are gone (closed streams that never
    /// saw another publish)
    pub fn prune_closed(&self) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
    }
}
