//! Nodes: the computational units of a graph.
//!
//! A node receives the branch's state snapshot and returns the next state.
//! Node functions must be deterministic with respect to their inputs; any
//! non-determinism (LLM calls, tools, clocks) lives behind collaborator
//! interfaces so replay stays reproducible.

use crate::cancel::CancelToken;
use crate::stream::ExecutionEvent;
use async_trait::async_trait;
use graphflow_core::{Result, State};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Context passed to a node for one invocation.
#[derive(Clone)]
pub struct NodeContext {
    /// Thread being executed.
    pub thread_id: String,
    /// Monotonic step index of this invocation.
    pub step: usize,
    /// How many times this node has run in the current request, including
    /// this invocation.
    pub visits: usize,
    /// Cancellation signal; observe at suspension points.
    pub cancel: CancelToken,
    emitter: Option<mpsc::Sender<Result<ExecutionEvent>>>,
    node_id: String,
}

impl NodeContext {
    pub(crate) fn new(
        thread_id: &str,
        node_id: &str,
        step: usize,
        visits: usize,
        cancel: CancelToken,
        emitter: Option<mpsc::Sender<Result<ExecutionEvent>>>,
    ) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            step,
            visits,
            cancel,
            emitter,
            node_id: node_id.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit an application event to streaming consumers. Honours
    /// back-pressure; a no-op when the run is not streaming.
    pub async fn emit(&self, data: Value) {
        if let Some(tx) = &self.emitter {
            let _ = tx.send(Ok(ExecutionEvent::custom(&self.node_id, data))).await;
        }
    }
}

/// A named computation `(ctx, State) -> Result<State>`.
#[async_trait]
pub trait Node: Send + Sync {
    /// Identifier, unique within the owning graph.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str {
        self.id()
    }

    async fn run(&self, ctx: &NodeContext, state: State) -> Result<State>;
}

/// Boxed future returned by function nodes.
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<State>> + Send>>;

/// Type alias for the stored node closure.
pub type NodeFn = Box<dyn Fn(NodeContext, State) -> NodeFuture + Send + Sync>;

/// Adapter turning an async closure into a [`Node`].
pub struct FnNode {
    id: String,
    name: String,
    func: NodeFn,
}

impl FnNode {
    pub fn new<F, Fut>(id: &str, name: &str, func: F) -> Self
    where
        F: Fn(NodeContext, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            func: Box::new(move |ctx, state| Box::pin(func(ctx, state))),
        }
    }
}

#[async_trait]
impl Node for FnNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &NodeContext, state: State) -> Result<State> {
        (self.func)(ctx.clone(), state).await
    }
}

/// Node that forwards state unchanged. Useful as an explicit join point.
pub struct PassthroughNode {
    id: String,
}

impl PassthroughNode {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Node for PassthroughNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _ctx: &NodeContext, state: State) -> Result<State> {
        Ok(state)
    }
}
