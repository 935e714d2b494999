//! Node outputs and dynamic control flow.
//!
//! A node returns either a plain state update or a [`Command`] combining an
//! update with explicit routing (`goto`, which overrides the graph's static
//! edges for this superstep). Callers use [`Command::with_resume`] to feed
//! a value back into a suspended thread, addressed by interrupt id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A resume value routed to a suspension site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeValue {
    /// Target interrupt; may be omitted when exactly one is pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_id: Option<String>,
    /// The value handed back to the interrupted node
    pub value: Value,
}

impl ResumeValue {
    /// Resume a specific interrupt
    pub fn targeted(interrupt_id: impl Into<String>, value: Value) -> Self {
        Self {
            interrupt_id: Some(interrupt_id.into()),
            value,
        }
    }

    /// Resume the single pending interrupt
    pub fn untargeted(value: Value) -> Self {
        Self {
            interrupt_id: None,
            value,
        }
    }
}

/// Dynamic control returned by a node or supplied by a resuming caller
#[derive(Debug, Clone, Default)]
pub struct Command {
    /// Partial state update applied through the channel reducers
    pub update: Option<HashMap<String, Value>>,
    /// Explicit routing targets; overrides static edges for this node
    pub goto: Option<Vec<String>>,
    /// Resume values; only meaningful on the caller side of a resume
    pub resume: Vec<ResumeValue>,
}

impl Command {
    /// Create an empty command
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state update
    pub fn with_update(mut self, update: HashMap<String, Value>) -> Self {
        self.update = Some(update);
        self
    }

    /// Add a single channel write to the update
    pub fn with_write(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.update
            .get_or_insert_with(HashMap::new)
            .insert(channel.into(), value);
        self
    }

    /// Route to a single node next
    pub fn with_goto(mut self, target: impl Into<String>) -> Self {
        self.goto.get_or_insert_with(Vec::new).push(target.into());
        self
    }

    /// Route to several nodes next (parallel fan-out)
    pub fn with_goto_many(mut self, targets: Vec<String>) -> Self {
        self.goto.get_or_insert_with(Vec::new).extend(targets);
        self
    }

    /// Attach a resume value
    pub fn with_resume(mut self, resume: ResumeValue) -> Self {
        self.resume.push(resume);
        self
    }
}

/// What a node body produced
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Partial state update; routing follows the graph's static edges
    Update(HashMap<String, Value>),
    /// Update plus explicit routing
    Command(Command),
}

impl NodeOutput {
    /// An empty update (the node only had side effects or emitted deltas)
    pub fn empty() -> Self {
        NodeOutput::Update(HashMap::new())
    }

    /// Single-channel update
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        let mut update = HashMap::new();
        update.insert(channel.into(), value);
        NodeOutput::Update(update)
    }

    /// The update portion, whichever variant carries it
    pub fn update(&self) -> Option<&HashMap<String, Value>> {
        match self {
            NodeOutput::Update(update) => Some(update),
            NodeOutput::Command(command) => command.update.as_ref(),
        }
    }

    /// The goto portion, if any
    pub fn goto(&self) -> Option<&[String]> {
        match self {
            NodeOutput::Update(_) => None,
            NodeOutput::Command(command) => command.goto.as_deref(),
        }
    }
}
