//! Graph construction and compilation.
//!
//! A [`GraphBuilder`] collects the typed state schema, the named nodes and
//! the edges, then [`compile`](GraphBuilder::compile)s into an immutable
//! [`CompiledGraph`] after structural validation. The topology is fixed at
//! compile time; only `goto` commands and conditional edges vary routing at
//! runtime.

use crate::channel::StateSchema;
use crate::error::{GraphError, Result};
use crate::node::{NodeBody, NodeKind, NodeOptions, NodeSpec, SubgraphErrorHandler};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Routing sentinel: terminate the branch
pub const END: &str = "__end__";

/// Predicate of a conditional edge; must be a pure function of state
pub type EdgePredicate = dyn Fn(&HashMap<String, Value>) -> String + Send + Sync;

/// An outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    /// Always route to the named node
    Static(String),
    /// Route to whatever node the predicate names (may return [`END`])
    Conditional(Arc<EdgePredicate>),
}

/// Mutable graph under construction
#[derive(Default)]
pub struct GraphBuilder {
    schema: StateSchema,
    nodes: BTreeMap<String, NodeSpec>,
    edges: BTreeMap<String, Vec<Edge>>,
    entry: Option<String>,
}

impl GraphBuilder {
    /// Start a builder over the given state schema
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            entry: None,
        }
    }

    /// Add a task node with default options
    pub fn add_node(self, name: impl Into<String>, body: impl NodeBody + 'static) -> Self {
        self.add_node_with(name, body, NodeOptions::new())
    }

    /// Add a task node with explicit options
    pub fn add_node_with(
        mut self,
        name: impl Into<String>,
        body: impl NodeBody + 'static,
        options: NodeOptions,
    ) -> Self {
        let name = name.into();
        self.nodes.insert(
            name.clone(),
            NodeSpec {
                name,
                kind: NodeKind::Task(Arc::new(body)),
                triggers: options.triggers,
                retry_policy: options.retry_policy,
                timeout: options.timeout,
            },
        );
        self
    }

    /// Add a node whose body is a compiled subgraph.
    ///
    /// The subgraph inherits the checkpointer and runs its own supersteps
    /// under `namespace = parent_namespace + ":" + name`. Its final state
    /// is projected back into the parent through `output_channels`
    /// (defaulting to every channel both schemas share).
    pub fn add_subgraph(
        mut self,
        name: impl Into<String>,
        graph: CompiledGraph,
        output_channels: Option<Vec<String>>,
        on_error: Option<Arc<SubgraphErrorHandler>>,
        options: NodeOptions,
    ) -> Self {
        let name = name.into();
        self.nodes.insert(
            name.clone(),
            NodeSpec {
                name,
                kind: NodeKind::Subgraph {
                    graph: Arc::new(graph),
                    output_channels,
                    on_error,
                },
                triggers: options.triggers,
                retry_policy: options.retry_policy,
                timeout: options.timeout,
            },
        );
        self
    }

    /// Add a static edge
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Static(to.into()));
        self
    }

    /// Add a conditional edge
    pub fn add_conditional_edge<F>(mut self, from: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&HashMap<String, Value>) -> String + Send + Sync + 'static,
    {
        self.edges
            .entry(from.into())
            .or_default()
            .push(Edge::Conditional(Arc::new(predicate)));
        self
    }

    /// Set the entry node
    pub fn set_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    /// Validate the structure and freeze it
    pub fn compile(self) -> Result<CompiledGraph> {
        let entry = self
            .entry
            .ok_or_else(|| GraphError::Validation("graph has no entry node".to_string()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::Validation(format!(
                "entry node '{}' does not exist",
                entry
            )));
        }
        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{}' does not exist",
                    from
                )));
            }
            for edge in edges {
                if let Edge::Static(to) = edge {
                    if to != END && !self.nodes.contains_key(to) {
                        return Err(GraphError::Validation(format!(
                            "edge target '{}' does not exist",
                            to
                        )));
                    }
                }
            }
        }
        for spec in self.nodes.values() {
            for trigger in &spec.triggers {
                if !self.schema.contains(trigger) {
                    return Err(GraphError::Validation(format!(
                        "node '{}' triggers on undeclared channel '{}'",
                        spec.name, trigger
                    )));
                }
            }
        }
        Ok(CompiledGraph {
            schema: self.schema,
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}

/// An immutable, validated graph
pub struct CompiledGraph {
    pub(crate) schema: StateSchema,
    pub(crate) nodes: BTreeMap<String, NodeSpec>,
    pub(crate) edges: BTreeMap<String, Vec<Edge>>,
    pub(crate) entry: String,
}

impl CompiledGraph {
    /// The state schema
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// The entry node name
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Look up a node spec
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// Node names in deterministic order
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Resolve the routing targets of `node` given post-superstep state.
    ///
    /// `goto` from a command overrides the static edges entirely.
    pub fn route(
        &self,
        node: &str,
        state: &HashMap<String, Value>,
        goto: Option<&[String]>,
    ) -> Vec<String> {
        if let Some(targets) = goto {
            return targets
                .iter()
                .filter(|t| t.as_str() != END)
                .cloned()
                .collect();
        }
        let mut targets = Vec::new();
        if let Some(edges) = self.edges.get(node) {
            for edge in edges {
                let target = match edge {
                    Edge::Static(to) => to.clone(),
                    Edge::Conditional(predicate) => predicate(state),
                };
                if target != END && !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    /// Nodes activated by updates to the given channels
    pub fn triggered_by(&self, updated_channels: &[String]) -> Vec<String> {
        let mut activated = Vec::new();
        for spec in self.nodes.values() {
            if spec
                .triggers
                .iter()
                .any(|t| updated_channels.iter().any(|u| u == t))
                && !activated.contains(&spec.name)
            {
                activated.push(spec.name.clone());
            }
        }
        activated
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}
