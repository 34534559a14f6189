//! End-to-end executor scenarios: linear runs, conditional routing, fan-out,
//! cyclic budgets, cancellation/resume and streaming.

use graphflow_checkpoint::{Checkpointer, MemorySaver};
use graphflow_core::{CheckpointMode, FlowError, MergeStrategy, State};
use graphflow_graph::{
    CancelToken, END, ExecutionConfig, ExecutionEvent, Executor, Graph, NodeContext, START,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;

fn strict_config(thread: &str) -> ExecutionConfig {
    ExecutionConfig::new(thread).with_checkpoint_mode(CheckpointMode::Strict)
}

/// Linear graph: start sets x=1, inc adds one. Final state {x: 2}, two
/// execution records.
#[tokio::test]
async fn test_linear_graph() {
    let graph = Graph::new("linear")
        .add_node_fn("start", "Start", |_ctx, mut state: State| async move {
            state.set("x", 1);
            Ok(state)
        })
        .unwrap()
        .add_node_fn("inc", "Inc", |_ctx, mut state: State| async move {
            let x = state.get_i64("x")?.unwrap_or(0);
            state.set("x", x + 1);
            Ok(state)
        })
        .unwrap()
        .add_edge(START, "start")
        .unwrap()
        .add_edge("start", "inc")
        .unwrap()
        .add_edge("inc", END)
        .unwrap()
        .compile()
        .unwrap();

    let executor = Executor::new(graph);
    let result = executor.execute(State::new(), ExecutionConfig::new("s1")).await.unwrap();

    assert_eq!(result.get_i64("x").unwrap(), Some(2));
    let records = executor.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.success));
}

fn classify_graph() -> graphflow_graph::CompiledGraph {
    Graph::new("classify")
        .add_node_fn("classify", "Classify", |_ctx, mut state: State| async move {
            let input = state.get_str("input")?.unwrap_or_default().to_string();
            let kind = if input.chars().any(|c| c.is_ascii_digit()) { "math" } else { "text" };
            state.set("kind", kind);
            Ok(state)
        })
        .unwrap()
        .add_node_fn("math", "Math", |_ctx, mut state: State| async move {
            state.set("handled_by", "math");
            Ok(state)
        })
        .unwrap()
        .add_node_fn("text", "Text", |_ctx, mut state: State| async move {
            state.set("handled_by", "text");
            Ok(state)
        })
        .unwrap()
        .add_edge(START, "classify")
        .unwrap()
        .add_conditional_edges_fn(
            "classify",
            |state| state.get("kind").and_then(|v| v.as_str()).unwrap_or(END).to_string(),
            [("math", "math"), ("text", "text")],
        )
        .unwrap()
        .add_edge("math", END)
        .unwrap()
        .add_edge("text", END)
        .unwrap()
        .compile()
        .unwrap()
}

/// Conditional branch: digits route to math, words to text.
#[tokio::test]
async fn test_conditional_branch() {
    let executor = Executor::new(classify_graph());

    let mut input = State::new();
    input.set("input", "2+2");
    let result = executor.execute(input, ExecutionConfig::new("s2a")).await.unwrap();
    assert_eq!(result.get_str("kind").unwrap(), Some("math"));
    assert_eq!(result.get_str("handled_by").unwrap(), Some("math"));

    let mut input = State::new();
    input.set("input", "hello");
    let result = executor.execute(input, ExecutionConfig::new("s2b")).await.unwrap();
    assert_eq!(result.get_str("handled_by").unwrap(), Some("text"));
}

/// Fan-out runs branches concurrently and the join sees both results.
#[tokio::test]
async fn test_fan_out_fan_in() {
    let graph = Graph::new("diamond")
        .add_node_fn("split", "Split", |_ctx, state: State| async move { Ok(state) })
        .unwrap()
        .add_node_fn("a", "A", |_ctx, mut state: State| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let saw_sibling = state.get("rb").is_some();
            state.set("ra", 1);
            state.set("a_saw_rb", saw_sibling);
            Ok(state)
        })
        .unwrap()
        .add_node_fn("b", "B", |_ctx, mut state: State| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let saw_sibling = state.get("ra").is_some();
            state.set("rb", 2);
            state.set("b_saw_ra", saw_sibling);
            Ok(state)
        })
        .unwrap()
        .add_node_fn("join", "Join", |_ctx, state: State| async move { Ok(state) })
        .unwrap()
        .add_edge(START, "split")
        .unwrap()
        .add_edge("split", "a")
        .unwrap()
        .add_edge("split", "b")
        .unwrap()
        .add_edge("a", "join")
        .unwrap()
        .add_edge("b", "join")
        .unwrap()
        .add_edge("join", END)
        .unwrap()
        .compile()
        .unwrap();

    let clock = Instant::now();
    let result = Executor::new(graph)
        .execute(
            State::new(),
            ExecutionConfig::new("s3")
                .with_workers(4)
                .with_merge_strategy(MergeStrategy::Overwrite),
        )
        .await
        .unwrap();
    let elapsed = clock.elapsed();

    assert_eq!(result.get_i64("ra").unwrap(), Some(1));
    assert_eq!(result.get_i64("rb").unwrap(), Some(2));
    // State isolation: neither branch observed the sibling's write.
    assert_eq!(result.get_bool("a_saw_rb").unwrap(), Some(false));
    assert_eq!(result.get_bool("b_saw_ra").unwrap(), Some(false));
    // Parallelism observable: well under the 200ms a sequential run needs.
    assert!(elapsed < Duration::from_millis(180), "took {elapsed:?}");
}

/// ReAct-style cycle exhausts the step budget after exactly three
/// plan -> act -> observe rounds, leaving nine checkpoints behind.
#[tokio::test]
async fn test_cycle_exhausts_step_budget() {
    let passthrough = |_ctx: NodeContext, state: State| async move { Ok(state) };
    let graph = Graph::new("react-loop")
        .add_node_fn("plan", "Plan", passthrough)
        .unwrap()
        .add_node_fn("act", "Act", passthrough)
        .unwrap()
        .add_node_fn("observe", "Observe", passthrough)
        .unwrap()
        .add_edge(START, "plan")
        .unwrap()
        .add_edge("plan", "act")
        .unwrap()
        .add_edge("act", "observe")
        .unwrap()
        .add_conditional_edges_fn(
            "observe",
            |state| {
                if state.get("answer").is_some() { END.to_string() } else { "plan".to_string() }
            },
            [("plan", "plan"), (END, END)],
        )
        .unwrap()
        .compile()
        .unwrap();

    let saver = Arc::new(MemorySaver::new());
    let executor =
        Executor::new(graph).with_checkpointer(saver.clone() as Arc<dyn Checkpointer>);
    let result =
        executor.execute(State::new(), strict_config("s4").with_max_steps(9)).await;

    assert!(matches!(result, Err(FlowError::StepBudget(_))));
    assert_eq!(saver.count("s4").await, 9);

    let records = executor.records();
    assert_eq!(records.len(), 9);
    let cycle: Vec<&str> = records.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(
        cycle,
        vec!["plan", "act", "observe", "plan", "act", "observe", "plan", "act", "observe"]
    );
}

/// Cancel after the first node, resume the same thread: the second run skips
/// the completed node and finishes with two total invocations.
#[tokio::test]
async fn test_checkpoint_resume_after_cancel() {
    let invocations = Arc::new(AtomicUsize::new(0));

    let build = |cancel_on_start: Option<CancelToken>| {
        let counter = invocations.clone();
        let counter2 = invocations.clone();
        Graph::new("resumable")
            .add_node_fn("start", "Start", move |_ctx, mut state: State| {
                let counter = counter.clone();
                let cancel = cancel_on_start.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    state.set("x", 1);
                    if let Some(token) = cancel {
                        token.cancel();
                    }
                    Ok(state)
                }
            })
            .unwrap()
            .add_node_fn("inc", "Inc", move |_ctx, mut state: State| {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let x = state.get_i64("x")?.unwrap_or(0);
                    state.set("x", x + 1);
                    Ok(state)
                }
            })
            .unwrap()
            .add_edge(START, "start")
            .unwrap()
            .add_edge("start", "inc")
            .unwrap()
            .add_edge("inc", END)
            .unwrap()
            .compile()
            .unwrap()
    };

    let saver = Arc::new(MemorySaver::new());
    let token = CancelToken::new();

    let first = Executor::new(build(Some(token.clone())))
        .with_checkpointer(saver.clone() as Arc<dyn Checkpointer>)
        .execute_cancellable(State::new(), strict_config("s5"), token)
        .await;
    assert!(matches!(first, Err(FlowError::Cancelled)));

    let latest = saver.latest("s5").await.unwrap().unwrap();
    assert!(latest.is_cancelled());
    assert_eq!(latest.node_id, "inc");

    let second = Executor::new(build(None))
        .with_checkpointer(saver.clone() as Arc<dyn Checkpointer>)
        .execute(State::new(), strict_config("s5"))
        .await
        .unwrap();

    assert_eq!(second.get_i64("x").unwrap(), Some(2));
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

/// After cancellation, at most one more node invocation completes.
#[tokio::test]
async fn test_cancellation_atomicity() {
    let completed = Arc::new(AtomicUsize::new(0));
    let make_node = |counter: Arc<AtomicUsize>| {
        move |_ctx: NodeContext, state: State| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(state)
            }
        }
    };

    let graph = Graph::new("cancellable")
        .add_node_fn("n1", "N1", make_node(completed.clone()))
        .unwrap()
        .add_node_fn("n2", "N2", make_node(completed.clone()))
        .unwrap()
        .add_node_fn("n3", "N3", make_node(completed.clone()))
        .unwrap()
        .add_edge(START, "n1")
        .unwrap()
        .add_edge("n1", "n2")
        .unwrap()
        .add_edge("n2", "n3")
        .unwrap()
        .add_edge("n3", END)
        .unwrap()
        .compile()
        .unwrap();

    let saver = Arc::new(MemorySaver::new());
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let result = Executor::new(graph)
        .with_checkpointer(saver.clone() as Arc<dyn Checkpointer>)
        .execute_cancellable(State::new(), strict_config("atomic"), token)
        .await;

    assert!(matches!(result, Err(FlowError::Cancelled)));
    assert!(completed.load(Ordering::SeqCst) <= 1);
    let latest = saver.latest("atomic").await.unwrap().unwrap();
    assert!(latest.is_cancelled());
}

/// Identical inputs yield identical record sequences and final state.
#[tokio::test]
async fn test_determinism_under_replay() {
    let run = || async {
        let executor = Executor::new(classify_graph());
        let mut input = State::new();
        input.set("input", "31337");
        let state = executor.execute(input, ExecutionConfig::new("replay")).await.unwrap();
        (state, executor.records())
    };

    let (state_a, records_a) = run().await;
    let (state_b, records_b) = run().await;

    assert!(state_a.semantically_eq(&state_b));
    assert_eq!(records_a.len(), records_b.len());
    for (a, b) in records_a.iter().zip(&records_b) {
        assert_eq!(a.node_id, b.node_id);
        assert_eq!(a.step_index, b.step_index);
        assert_eq!(a.input_digest, b.input_digest);
        assert_eq!(a.output_digest, b.output_digest);
    }
}

/// Step indices in the record log are strictly increasing.
#[tokio::test]
async fn test_record_ordering() {
    let executor = Executor::new(classify_graph());
    let mut input = State::new();
    input.set("input", "abc");
    executor.execute(input, ExecutionConfig::new("ordering")).await.unwrap();

    let records = executor.records();
    assert!(records.windows(2).all(|w| w[0].step_index < w[1].step_index));
}

/// Streaming emits step events in order and finishes with a Done sentinel
/// carrying the final state.
#[tokio::test]
async fn test_streaming_events() {
    let executor = Executor::new(classify_graph());
    let mut input = State::new();
    input.set("input", "2+2");

    let events: Vec<_> = executor
        .execute_stream(input, ExecutionConfig::new("stream"), CancelToken::new())
        .collect()
        .await;

    let events: Vec<ExecutionEvent> = events.into_iter().map(|e| e.unwrap()).collect();
    assert!(matches!(events.first(), Some(ExecutionEvent::StepStart { node, .. }) if node == "classify"));
    let Some(ExecutionEvent::Done { state, steps }) = events.last() else {
        panic!("missing Done sentinel: {events:?}");
    };
    assert_eq!(state.get_str("kind").unwrap(), Some("math"));
    assert_eq!(*steps, 2);

    let updates = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::StateUpdate { .. }))
        .count();
    assert_eq!(updates, 2);
}

/// A guarded edge only fires when its predicate holds.
#[tokio::test]
async fn test_guarded_edges() {
    let graph = Graph::new("guarded")
        .add_node_fn("source", "Source", |_ctx, mut state: State| async move {
            state.set("level", 5);
            Ok(state)
        })
        .unwrap()
        .add_node_fn("high", "High", |_ctx, mut state: State| async move {
            state.set("path", "high");
            Ok(state)
        })
        .unwrap()
        .add_node_fn("low", "Low", |_ctx, mut state: State| async move {
            state.set("path", "low");
            Ok(state)
        })
        .unwrap()
        .add_edge(START, "source")
        .unwrap()
        .add_edge_guarded("source", "high", |state| {
            state.get("level").and_then(|v| v.as_i64()).unwrap_or(0) > 3
        })
        .unwrap()
        .add_edge_guarded("source", "low", |state| {
            state.get("level").and_then(|v| v.as_i64()).unwrap_or(0) <= 3
        })
        .unwrap()
        .add_edge("high", END)
        .unwrap()
        .add_edge("low", END)
        .unwrap()
        .compile()
        .unwrap();

    let result = Executor::new(graph).execute(State::new(), ExecutionConfig::new("g")).await.unwrap();
    assert_eq!(result.get_str("path").unwrap(), Some("high"));
}
