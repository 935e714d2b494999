//! # valgraph-core
//!
//! Superstep graph runtime for the valgraph execution engine.
//!
//! A compiled graph is a static structure: a typed state schema, named
//! nodes (plain async bodies or compiled subgraphs), static and conditional
//! edges. Execution proceeds in Pregel-style supersteps - all active nodes
//! run concurrently, their writes apply together through per-channel
//! reducers at the barrier, and every barrier commits one checkpoint
//! through [`valgraph_checkpoint`]. Nodes suspend cooperatively via
//! [`NodeContext::interrupt`] and the whole node re-runs when the caller
//! supplies the resume value.
//!
//! The crate is deliberately free of any HTTP or wire concern: the runtime
//! narrates itself through [`RuntimeEvent`]s and the serving layer decides
//! what they look like on the wire.

pub mod cancel;
pub mod channel;
pub mod command;
pub mod error;
pub mod event;
pub mod graph;
pub mod interrupt;
pub mod node;
pub mod retry;
pub mod runner;
pub mod state;
pub mod update;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use channel::{ChannelSpec, Reducer, StateSchema, ValueType};
pub use command::{Command, NodeOutput, ResumeValue};
pub use error::{GraphError, Result};
pub use event::{EndReason, ErrorInfo, NodeStatus, RuntimeEvent};
pub use graph::{CompiledGraph, GraphBuilder, END};
pub use interrupt::{interrupt_id, InterruptPayload};
pub use node::{NodeBody, NodeContext, NodeFuture, NodeKind, NodeOptions, NodeResult, NodeSpec};
pub use retry::RetryPolicy;
pub use runner::{GraphRunner, RunInput, RunOutcome, RunnerConfig, INPUT_NODE};
pub use state::{apply_writes, ChannelWrite};
pub use update::{update_state, UPDATE_NODE};
