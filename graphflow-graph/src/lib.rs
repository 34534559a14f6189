//! # graphflow-graph
//!
//! The graph model and execution engine for GraphFlow.
//!
//! ## Overview
//!
//! A [`Graph`] is built from named nodes and edges, validated, and compiled
//! into an immutable [`CompiledGraph`] the [`Executor`] drives:
//!
//! - **Nodes** are async computations `(ctx, State) -> Result<State>`
//! - **Edges** per source are either static (optionally guarded) or one
//!   conditional group with a [`Router`] and a label table - never both
//! - **Execution** checkpoints before every step, retries under per-node
//!   policies, fans out on multiple taken edges and merges at the join point
//!   in declaration order
//! - **Cycles** are only legal through nodes marked `allow_revisit` (or via
//!   conditional edges) and are bounded by the step budget
//!
//! ```rust
//! use graphflow_core::State;
//! use graphflow_graph::{END, ExecutionConfig, Executor, Graph, START};
//!
//! # async fn demo() -> graphflow_core::Result<()> {
//! let graph = Graph::new("counter")
//!     .add_node_fn("set", "Set", |_ctx, mut state: State| async move {
//!         state.set("x", 1);
//!         Ok(state)
//!     })?
//!     .add_edge(START, "set")?
//!     .add_edge("set", END)?
//!     .compile()?;
//!
//! let final_state = Executor::new(graph)
//!     .execute(State::new(), ExecutionConfig::new("thread-1"))
//!     .await?;
//! assert_eq!(final_state.get_i64("x")?, Some(1));
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod edge;
pub mod executor;
pub mod graph;
pub mod node;
pub mod record;
pub mod retry;
pub mod stream;

pub use cancel::CancelToken;
pub use edge::{
    ConditionalEdge, EdgeSet, END, FnRouter, GuardFn, Router, START, StaticEdge, Target,
};
pub use executor::{ExecutionConfig, Executor};
pub use graph::{CompiledGraph, Graph, NodeOptions};
pub use node::{FnNode, Node, NodeContext, NodeFn, NodeFuture, PassthroughNode};
pub use record::{ExecutionRecord, RecordBuffer, state_digest};
pub use retry::RetryPolicy;
pub use stream::ExecutionEvent;
