//! Graph construction, validation and compilation.

use crate::edge::{ConditionalEdge, EdgeSet, END, FnRouter, GuardFn, Router, START, StaticEdge, Target};
use crate::node::{FnNode, Node, NodeContext};
use crate::retry::RetryPolicy;
use graphflow_core::{FlowError, Result, State};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-node execution overrides.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Overrides the config-wide node timeout.
    pub timeout: Option<Duration>,
    /// Overrides the config-wide retry policy.
    pub retry: Option<RetryPolicy>,
    /// Marks the node as a legal member of a cycle (ReAct-style loops).
    pub allow_revisit: bool,
}

/// Builder for a directed graph of nodes and edges.
///
/// Nodes must be registered before edges referencing them; structural errors
/// surface at the offending call, cross-cutting checks at [`Graph::compile`].
pub struct Graph {
    name: String,
    nodes: BTreeMap<String, Arc<dyn Node>>,
    options: BTreeMap<String, NodeOptions>,
    edges: BTreeMap<String, EdgeSet>,
    start: Option<String>,
    ends: BTreeSet<String>,
    explicit_joins: BTreeMap<String, String>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("edges", &self.edges.keys().collect::<Vec<_>>())
            .field("start", &self.start)
            .field("ends", &self.ends)
            .field("explicit_joins", &self.explicit_joins)
            .finish()
    }
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            options: BTreeMap::new(),
            edges: BTreeMap::new(),
            start: None,
            ends: BTreeSet::new(),
            explicit_joins: BTreeMap::new(),
        }
    }

    fn require_node(&self, id: &str) -> Result<()> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(FlowError::UnknownNode(id.to_string()))
        }
    }

    /// Register a node. Fails on duplicate or reserved ids.
    pub fn add_node<N: Node + 'static>(mut self, node: N) -> Result<Self> {
        let id = node.id().to_string();
        if id == START || id == END {
            return Err(FlowError::InvalidGraph(format!("node id '{id}' is reserved")));
        }
        if self.nodes.contains_key(&id) {
            return Err(FlowError::DuplicateNode(id));
        }
        self.options.insert(id.clone(), NodeOptions::default());
        self.nodes.insert(id, Arc::new(node));
        Ok(self)
    }

    /// Register an async closure as a node.
    pub fn add_node_fn<F, Fut>(self, id: &str, name: &str, func: F) -> Result<Self>
    where
        F: Fn(NodeContext, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State>> + Send + 'static,
    {
        self.add_node(FnNode::new(id, name, func))
    }

    /// Add an unconditional edge. `from == START` declares the start node,
    /// `to == END` declares `from` terminal-capable.
    pub fn add_edge(self, from: &str, to: &str) -> Result<Self> {
        self.push_static(from, to, None)
    }

    /// Add a guarded edge, taken only when the guard holds.
    pub fn add_edge_guarded<G>(self, from: &str, to: &str, guard: G) -> Result<Self>
    where
        G: Fn(&State) -> bool + Send + Sync + 'static,
    {
        self.push_static(from, to, Some(Arc::new(guard) as GuardFn))
    }

    fn push_static(mut self, from: &str, to: &str, guard: Option<GuardFn>) -> Result<Self> {
        if to == START {
            return Err(FlowError::InvalidGraph("edges may not target START".to_string()));
        }
        if from == START {
            self.require_node(to)?;
            return match &self.start {
                Some(existing) if existing != to => Err(FlowError::InvalidGraph(format!(
                    "start already set to '{existing}'"
                ))),
                _ => {
                    self.start = Some(to.to_string());
                    Ok(self)
                }
            };
        }

        self.require_node(from)?;
        let target = Target::from(to);
        if let Some(node) = target.node_id() {
            self.require_node(node)?;
        }

        match self.edges.entry(from.to_string()).or_insert_with(|| EdgeSet::Static(Vec::new())) {
            EdgeSet::Static(edges) => {
                edges.push(StaticEdge { to: target, guard });
                Ok(self)
            }
            EdgeSet::Conditional(_) => Err(FlowError::MixedEdgeKinds(from.to_string())),
        }
    }

    /// Attach a conditional group to `from`: a router plus its label table.
    pub fn add_conditional_edges<R, I, K, V>(mut self, from: &str, router: R, routes: I) -> Result<Self>
    where
        R: Router + 'static,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.require_node(from)?;
        if self.edges.contains_key(from) {
            return Err(FlowError::MixedEdgeKinds(from.to_string()));
        }

        let mut table = BTreeMap::new();
        for (label, to) in routes {
            let target = Target::from(to.as_ref());
            if let Some(node) = target.node_id() {
                self.require_node(node)?;
            }
            table.insert(label.as_ref().to_string(), target);
        }

        self.edges.insert(
            from.to_string(),
            EdgeSet::Conditional(ConditionalEdge {
                router: Arc::new(router),
                routes: table,
                default: None,
            }),
        );
        Ok(self)
    }

    /// Convenience for a closure router.
    pub fn add_conditional_edges_fn<F, I, K, V>(self, from: &str, router: F, routes: I) -> Result<Self>
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.add_conditional_edges(from, FnRouter::new(router), routes)
    }

    /// Declare a fallback destination for labels absent from the route table.
    pub fn with_route_default(mut self, from: &str, to: &str) -> Result<Self> {
        let target = Target::from(to);
        if let Some(node) = target.node_id() {
            self.require_node(node)?;
        }
        match self.edges.get_mut(from) {
            Some(EdgeSet::Conditional(cond)) => {
                cond.default = Some(target);
                Ok(self)
            }
            _ => Err(FlowError::InvalidGraph(format!(
                "'{from}' has no conditional edges to default"
            ))),
        }
    }

    pub fn set_start(mut self, id: &str) -> Result<Self> {
        self.require_node(id)?;
        if let Some(existing) = &self.start {
            if existing != id {
                return Err(FlowError::InvalidGraph(format!("start already set to '{existing}'")));
            }
        }
        self.start = Some(id.to_string());
        Ok(self)
    }

    /// Declare a terminal node.
    pub fn add_end(mut self, id: &str) -> Result<Self> {
        self.require_node(id)?;
        self.ends.insert(id.to_string());
        Ok(self)
    }

    /// Pin the fan-in point for a fan-out source instead of inferring it.
    pub fn with_join(mut self, source: &str, join: &str) -> Result<Self> {
        self.require_node(source)?;
        self.require_node(join)?;
        self.explicit_joins.insert(source.to_string(), join.to_string());
        Ok(self)
    }

    /// Override the timeout for one node.
    pub fn with_node_timeout(mut self, id: &str, timeout: Duration) -> Result<Self> {
        self.require_node(id)?;
        if let Some(options) = self.options.get_mut(id) {
            options.timeout = Some(timeout);
        }
        Ok(self)
    }

    /// Override the retry policy for one node.
    pub fn with_node_retry(mut self, id: &str, retry: RetryPolicy) -> Result<Self> {
        self.require_node(id)?;
        if let Some(options) = self.options.get_mut(id) {
            options.retry = Some(retry);
        }
        Ok(self)
    }

    /// Permit the node to be revisited: static cycles through it pass
    /// validation and rely on the step budget for termination.
    pub fn allow_revisit(mut self, id: &str) -> Result<Self> {
        self.require_node(id)?;
        if let Some(options) = self.options.get_mut(id) {
            options.allow_revisit = true;
        }
        Ok(self)
    }

    /// Destination ids per node, for tests and visualisation.
    pub fn topology(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .keys()
            .map(|id| {
                let targets = self
                    .edges
                    .get(id)
                    .map(|set| {
                        set.declared_targets()
                            .into_iter()
                            .map(|t| t.node_id().unwrap_or(END).to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                (id.clone(), targets)
            })
            .collect()
    }

    /// Structural checks: start declared, non-terminal nodes have a way out,
    /// a terminal is reachable, and static cycles only pass through nodes
    /// that allow revisits.
    pub fn validate(&self) -> Result<()> {
        let start = self
            .start
            .as_ref()
            .ok_or_else(|| FlowError::InvalidGraph("no start node declared".to_string()))?;

        let declared_end = |id: &str| {
            self.ends.contains(id)
                || self
                    .edges
                    .get(id)
                    .map(|set| set.declared_targets().iter().any(|t| t.is_end()))
                    .unwrap_or(false)
        };

        for id in self.nodes.keys() {
            if self.edges.get(id).is_none() && !self.ends.contains(id) {
                return Err(FlowError::InvalidGraph(format!(
                    "non-terminal node '{id}' has no outgoing edge"
                )));
            }
        }

        // Terminal reachable from start over every declared edge.
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        let mut terminal_reachable = false;
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if declared_end(&id) {
                terminal_reachable = true;
            }
            if let Some(set) = self.edges.get(&id) {
                for target in set.declared_targets() {
                    if let Some(next) = target.node_id() {
                        queue.push_back(next.to_string());
                    }
                }
            }
        }
        if !terminal_reachable {
            return Err(FlowError::InvalidGraph(
                "no terminal node reachable from start".to_string(),
            ));
        }

        self.check_static_cycles()?;
        Ok(())
    }

    /// DFS over static edges only, skipping nodes marked `allow_revisit`.
    fn check_static_cycles(&self) -> Result<()> {
        let revisit_ok =
            |id: &str| self.options.get(id).map(|o| o.allow_revisit).unwrap_or(false);

        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (from, set) in &self.edges {
            if revisit_ok(from) {
                continue;
            }
            if let EdgeSet::Static(edges) = set {
                let targets = edges
                    .iter()
                    .filter_map(|e| e.to.node_id())
                    .filter(|to| !revisit_ok(to))
                    .collect();
                adjacency.insert(from, targets);
            }
        }

        // Colour: 0 unvisited, 1 on stack, 2 done.
        let mut colour: BTreeMap<&str, u8> = BTreeMap::new();
        for &node in adjacency.keys() {
            if colour.get(node).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack = vec![(node, 0usize)];
            colour.insert(node, 1);
            while let Some((current, next_idx)) = stack.pop() {
                let neighbours = adjacency.get(current).cloned().unwrap_or_default();
                if next_idx < neighbours.len() {
                    stack.push((current, next_idx + 1));
                    let next = neighbours[next_idx];
                    match colour.get(next).copied().unwrap_or(0) {
                        0 => {
                            colour.insert(next, 1);
                            stack.push((next, 0));
                        }
                        1 => {
                            return Err(FlowError::InvalidGraph(format!(
                                "static cycle through '{next}' without an iteration guard"
                            )));
                        }
                        _ => {}
                    }
                } else {
                    colour.insert(current, 2);
                }
            }
        }
        Ok(())
    }

    /// Validate and freeze into an executable graph, inferring fan-in points
    /// for static fan-out sources.
    pub fn compile(self) -> Result<CompiledGraph> {
        self.validate()?;

        let mut joins = BTreeMap::new();
        for (source, set) in &self.edges {
            if let EdgeSet::Static(edges) = set {
                let heads: Vec<&str> = edges.iter().filter_map(|e| e.to.node_id()).collect();
                if heads.len() > 1 {
                    let join = self
                        .explicit_joins
                        .get(source)
                        .cloned()
                        .or_else(|| self.infer_join(source, &heads));
                    joins.insert(source.clone(), join);
                }
            }
        }

        let start = self.start.clone().unwrap_or_default();
        Ok(CompiledGraph {
            name: self.name,
            nodes: self.nodes,
            options: self.options,
            edges: self.edges,
            start,
            ends: self.ends,
            joins,
        })
    }

    fn reachable_from(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(set) = self.edges.get(&current) {
                for target in set.declared_targets() {
                    if let Some(next) = target.node_id() {
                        queue.push_back(next.to_string());
                    }
                }
            }
        }
        seen
    }

    /// The first downstream node every branch flows into: closest to the
    /// source in BFS order, ties broken lexicographically.
    fn infer_join(&self, source: &str, heads: &[&str]) -> Option<String> {
        let per_head: Vec<BTreeSet<String>> =
            heads.iter().map(|h| self.reachable_from(h)).collect();

        let mut distance: BTreeMap<String, usize> = BTreeMap::new();
        let mut queue = VecDeque::from([(source.to_string(), 0usize)]);
        while let Some((current, d)) = queue.pop_front() {
            if distance.contains_key(&current) {
                continue;
            }
            distance.insert(current.clone(), d);
            if let Some(set) = self.edges.get(&current) {
                for target in set.declared_targets() {
                    if let Some(next) = target.node_id() {
                        queue.push_back((next.to_string(), d + 1));
                    }
                }
            }
        }

        distance
            .iter()
            .filter(|(id, _)| id.as_str() != source)
            .filter(|(id, _)| per_head.iter().all(|set| set.contains(*id)))
            .min_by_key(|(id, d)| (**d, (*id).clone()))
            .map(|(id, _)| id.clone())
    }
}

/// An immutable graph ready for execution. Owns its nodes exclusively.
pub struct CompiledGraph {
    name: String,
    nodes: BTreeMap<String, Arc<dyn Node>>,
    options: BTreeMap<String, NodeOptions>,
    edges: BTreeMap<String, EdgeSet>,
    start: String,
    ends: BTreeSet<String>,
    joins: BTreeMap<String, Option<String>>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    pub fn node_options(&self, id: &str) -> Option<&NodeOptions> {
        self.options.get(id)
    }

    pub fn edge_set(&self, id: &str) -> Option<&EdgeSet> {
        self.edges.get(id)
    }

    pub fn is_end(&self, id: &str) -> bool {
        self.ends.contains(id)
    }

    /// The fan-in node for a fan-out source, when one exists.
    pub fn join_for(&self, source: &str) -> Option<&str> {
        self.joins.get(source).and_then(|j| j.as_deref())
    }

    /// Destination ids per node.
    pub fn topology(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .keys()
            .map(|id| {
                let targets = self
                    .edges
                    .get(id)
                    .map(|set| {
                        set.declared_targets()
                            .into_iter()
                            .map(|t| t.node_id().unwrap_or(END).to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                (id.clone(), targets)
            })
            .collect()
    }
}
