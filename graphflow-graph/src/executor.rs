//! The execution engine: drives a compiled graph to completion.
//!
//! One branch runs nodes sequentially: pre-step checkpoint, invoke under
//! timeout and retry, record, route. Fan-out clones the state per branch,
//! runs branches on a bounded pool and merges results at the join point in
//! edge-declaration order, never completion order, so replay is reproducible.

use crate::cancel::CancelToken;
use crate::edge::{EdgeSet, END, Target};
use crate::graph::CompiledGraph;
use crate::node::NodeContext;
use crate::record::{ExecutionRecord, RecordBuffer, state_digest};
use crate::retry::RetryPolicy;
use crate::stream::ExecutionEvent;
use chrono::Utc;
use graphflow_checkpoint::{Checkpoint, Checkpointer, META_STATUS, STATUS_CANCELLED};
use graphflow_core::{CheckpointMode, FlowError, MergeStrategy, Result, RuntimeConfig, State, TimeoutScope};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// Per-request execution settings.
#[derive(Clone)]
pub struct ExecutionConfig {
    /// Thread the run belongs to; checkpoints chain under this id.
    pub thread_id: String,
    /// Resume from a specific checkpoint instead of the thread's latest.
    pub resume_from: Option<String>,
    /// Graph-wide node-invocation budget for this request.
    pub max_steps: usize,
    /// Default per-node timeout.
    pub node_timeout: Duration,
    /// Optional budget for a whole step (node + routing + flush).
    pub step_timeout: Option<Duration>,
    /// Optional request-wide deadline.
    pub request_timeout: Option<Duration>,
    /// Default retry policy; nodes may override.
    pub retry: RetryPolicy,
    /// Fan-in merge strategy.
    pub merge_strategy: MergeStrategy,
    pub checkpoint_mode: CheckpointMode,
    /// Worker-pool width for concurrent node invocations.
    pub workers: usize,
}

impl ExecutionConfig {
    pub fn new(thread_id: &str) -> Self {
        Self::from_runtime(thread_id, &RuntimeConfig::default())
    }

    /// Derive per-request settings from the process-wide configuration.
    pub fn from_runtime(thread_id: &str, runtime: &RuntimeConfig) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            resume_from: None,
            max_steps: runtime.max_steps,
            node_timeout: runtime.node_timeout,
            step_timeout: None,
            request_timeout: None,
            retry: RetryPolicy::default(),
            merge_strategy: MergeStrategy::Overwrite,
            checkpoint_mode: runtime.checkpoint_mode,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }

    pub fn with_resume_from(mut self, checkpoint_id: &str) -> Self {
        self.resume_from = Some(checkpoint_id.to_string());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Executes a [`CompiledGraph`] against per-request configuration.
pub struct Executor {
    graph: Arc<CompiledGraph>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    records: Arc<Mutex<RecordBuffer>>,
}

impl Executor {
    pub fn new(graph: CompiledGraph) -> Self {
        Self::from_arc(Arc::new(graph))
    }

    pub fn from_arc(graph: Arc<CompiledGraph>) -> Self {
        Self { graph, checkpointer: None, records: Arc::new(Mutex::new(RecordBuffer::new(256))) }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Resize the execution-record ring buffer.
    pub fn with_record_capacity(mut self, capacity: usize) -> Self {
        self.records = Arc::new(Mutex::new(RecordBuffer::new(capacity)));
        self
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.checkpointer.as_ref()
    }

    /// Execution records accumulated so far, oldest first.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap().records()
    }

    /// Run the graph to completion.
    pub async fn execute(&self, input: State, config: ExecutionConfig) -> Result<State> {
        self.execute_cancellable(input, config, CancelToken::new()).await
    }

    /// Run with an externally-held cancellation token.
    pub async fn execute_cancellable(
        &self,
        input: State,
        config: ExecutionConfig,
        cancel: CancelToken,
    ) -> Result<State> {
        let run = Run::start(self, config, cancel, None);
        run.drive(input).await
    }

    /// Run while streaming [`ExecutionEvent`]s. The channel is bounded; slow
    /// consumers block the producer rather than losing events.
    pub fn execute_stream(
        &self,
        input: State,
        config: ExecutionConfig,
        cancel: CancelToken,
    ) -> ReceiverStream<Result<ExecutionEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let run = Run::start(self, config, cancel, Some(tx.clone()));
        tokio::spawn(async move {
            match run.drive(input).await {
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

type BranchFuture = Pin<Box<dyn Future<Output = Result<State>> + Send>>;

/// Shared context of one execution request.
struct Run {
    graph: Arc<CompiledGraph>,
    config: ExecutionConfig,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    flush: Mutex<Option<FlushQueue>>,
    records: Arc<Mutex<RecordBuffer>>,
    /// Request-scoped budget counter.
    steps_taken: AtomicUsize,
    /// Thread-scoped monotonic step index, seeded from the resume point.
    step_seq: AtomicUsize,
    visits: Mutex<BTreeMap<String, usize>>,
    last_checkpoint: Mutex<Option<String>>,
    /// Most recent execution record, flushed with the next checkpoint.
    pending_record: Mutex<Option<ExecutionRecord>>,
    cancel_written: AtomicBool,
    pool: Arc<Semaphore>,
    cancel: CancelToken,
    events: Option<mpsc::Sender<Result<ExecutionEvent>>>,
}

impl Run {
    fn start(
        executor: &Executor,
        config: ExecutionConfig,
        cancel: CancelToken,
        events: Option<mpsc::Sender<Result<ExecutionEvent>>>,
    ) -> Arc<Self> {
        let flush = match (&executor.checkpointer, config.checkpoint_mode) {
            (Some(backend), CheckpointMode::Async) => Some(FlushQueue::spawn(backend.clone())),
            _ => None,
        };
        Arc::new(Self {
            graph: executor.graph.clone(),
            pool: Arc::new(Semaphore::new(config.workers)),
            config,
            checkpointer: executor.checkpointer.clone(),
            flush: Mutex::new(flush),
            records: executor.records.clone(),
            steps_taken: AtomicUsize::new(0),
            step_seq: AtomicUsize::new(0),
            visits: Mutex::new(BTreeMap::new()),
            last_checkpoint: Mutex::new(None),
            pending_record: Mutex::new(None),
            cancel_written: AtomicBool::new(false),
            cancel,
            events,
        })
    }

    async fn drive(self: Arc<Self>, input: State) -> Result<State> {
        tracing::debug!(graph = %self.graph.name(), thread = %self.config.thread_id, "executing graph");

        let (start_node, seed) = match self.initial(input).await {
            Ok(v) => v,
            Err(e) => {
                self.shutdown_flush().await;
                return Err(e);
            }
        };

        let work = self.clone().run_branch(start_node, seed, None);
        let result = match self.config.request_timeout {
            None => work.await,
            Some(deadline) => {
                tokio::pin!(work);
                tokio::select! {
                    biased;
                    r = &mut work => r,
                    _ = tokio::time::sleep(deadline) => {
                        self.cancel.cancel();
                        let _ = (&mut work).await;
                        Err(FlowError::Timeout { scope: TimeoutScope::Request })
                    }
                }
            }
        };

        let result = match result {
            Ok(final_state) => {
                let step = self.step_seq.load(Ordering::SeqCst);
                match self.checkpoint(step, END, &final_state, Some("completed")).await {
                    Ok(()) => {
                        self.emit(ExecutionEvent::done(
                            final_state.clone(),
                            self.steps_taken.load(Ordering::SeqCst),
                        ))
                        .await;
                        Ok(final_state)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "execution failed");
                Err(e)
            }
        };

        self.shutdown_flush().await;
        result
    }

    /// Seed state and entry node, resuming from a checkpoint when one exists.
    async fn initial(&self, input: State) -> Result<(String, State)> {
        let mut node = self.graph.start().to_string();
        let mut state = State::new();

        if let Some(backend) = &self.checkpointer {
            let loaded = match &self.config.resume_from {
                Some(id) => backend.load(&self.config.thread_id, Some(id)).await?,
                None => backend.latest(&self.config.thread_id).await?,
            };
            if let Some(cp) = loaded {
                self.step_seq.store(cp.step_index + 1, Ordering::SeqCst);
                *self.last_checkpoint.lock().unwrap() = Some(cp.id.clone());
                state = cp.state;
                // A chain ending at END is a finished turn: keep the state,
                // start from the top. Anything else resumes mid-graph.
                if cp.node_id != END && self.graph.node(&cp.node_id).is_some() {
                    node = cp.node_id;
                }
            }
        }

        state.merge(&input, MergeStrategy::Overwrite)?;
        state.set_meta("__thread", self.config.thread_id.clone());
        Ok((node, state))
    }

    /// Allocate the next step or fail once the request budget is spent.
    fn next_step(&self) -> Result<usize> {
        let taken = self.steps_taken.fetch_add(1, Ordering::SeqCst);
        if taken >= self.config.max_steps {
            return Err(FlowError::StepBudget(taken));
        }
        Ok(self.step_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn visit(&self, node_id: &str) -> usize {
        let mut visits = self.visits.lock().unwrap();
        let count = visits.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Ok(event)).await;
        }
    }

    fn node_ctx(&self, node_id: &str, step: usize, visits: usize) -> NodeContext {
        NodeContext::new(
            &self.config.thread_id,
            node_id,
            step,
            visits,
            self.cancel.clone(),
            self.events.clone(),
        )
    }

    fn timeout_for(&self, node_id: &str) -> Duration {
        self.graph
            .node_options(node_id)
            .and_then(|o| o.timeout)
            .unwrap_or(self.config.node_timeout)
    }

    fn retry_for(&self, node_id: &str) -> RetryPolicy {
        self.graph
            .node_options(node_id)
            .and_then(|o| o.retry.clone())
            .unwrap_or_else(|| self.config.retry.clone())
    }

    /// The destination of a declared `error` route on the node, if any.
    fn error_route(&self, node_id: &str) -> Option<Target> {
        match self.graph.edge_set(node_id) {
            Some(EdgeSet::Conditional(cond)) => cond.routes.get("error").cloned(),
            _ => None,
        }
    }

    fn record(&self, record: ExecutionRecord) {
        *self.pending_record.lock().unwrap() = Some(record.clone());
        self.records.lock().unwrap().push(record);
    }

    async fn checkpoint(
        &self,
        step: usize,
        node_id: &str,
        state: &State,
        status: Option<&str>,
    ) -> Result<()> {
        let Some(backend) = &self.checkpointer else { return Ok(()) };
        if self.config.checkpoint_mode == CheckpointMode::Off {
            return Ok(());
        }

        let mut cp = Checkpoint::new(&self.config.thread_id, step, node_id, state.clone());
        {
            let mut last = self.last_checkpoint.lock().unwrap();
            cp.parent_id = last.clone();
            *last = Some(cp.id.clone());
        }
        if let Some(status) = status {
            cp.metadata.insert(META_STATUS.to_string(), json!(status));
        }
        // The record of the step that led here rides along with the save.
        let pending = self.pending_record.lock().unwrap().take();
        if let Some(record) = pending {
            if let Ok(encoded) = serde_json::to_value(&record) {
                cp.metadata.insert("record".to_string(), encoded);
            }
        }

        match self.config.checkpoint_mode {
            CheckpointMode::Strict => save_with_retry(backend, &cp).await,
            CheckpointMode::Async => {
                let queued =
                    self.flush.lock().unwrap().as_ref().map(|q| q.try_enqueue(cp.clone()));
                match queued {
                    Some(true) => Ok(()),
                    // Queue full or gone: fall back to a synchronous save.
                    _ => {
                        tracing::warn!(thread = %cp.thread_id, "flush queue full, saving synchronously");
                        save_with_retry(backend, &cp).await
                    }
                }
            }
            CheckpointMode::Off => Ok(()),
        }
    }

    /// Write the final cancelled checkpoint exactly once.
    async fn write_cancelled(&self, node_id: &str, state: &State) {
        if self.cancel_written.swap(true, Ordering::SeqCst) {
            return;
        }
        let step = self.step_seq.load(Ordering::SeqCst);
        if let Err(e) = self.checkpoint(step, node_id, state, Some(STATUS_CANCELLED)).await {
            tracing::error!(error = %e, "failed to write cancelled checkpoint");
        }
        self.emit(ExecutionEvent::Cancelled { step }).await;
    }

    async fn shutdown_flush(&self) {
        let queue = self.flush.lock().unwrap().take();
        if let Some(queue) = queue {
            queue.shutdown().await;
        }
    }

    /// Invoke one node with the per-node timeout and retry policy.
    /// Returns the outcome together with the number of attempts taken.
    async fn invoke(
        &self,
        node_id: &str,
        step: usize,
        visits: usize,
        state: &State,
    ) -> (Result<State>, u32) {
        let Some(node) = self.graph.node(node_id) else {
            return (Err(FlowError::UnknownNode(node_id.to_string())), 0);
        };
        let policy = self.retry_for(node_id);
        let timeout = self.timeout_for(node_id);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let permit = match self.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (Err(FlowError::Cancelled), attempt),
            };
            let ctx = self.node_ctx(node_id, step, visits);
            let fut = node.run(&ctx, state.clone());
            tokio::pin!(fut);

            let result = tokio::select! {
                biased;
                r = tokio::time::timeout(timeout, &mut fut) => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(FlowError::Timeout { scope: TimeoutScope::Node }),
                },
                _ = self.cancel.cancelled() => Err(FlowError::Cancelled),
            };
            drop(permit);

            match result {
                Ok(next) => return (Ok(next), attempt),
                Err(FlowError::Cancelled) => return (Err(FlowError::Cancelled), attempt),
                Err(e) if policy.should_retry(attempt) => {
                    tracing::warn!(node = node_id, attempt, error = %e, "node failed, retrying");
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                }
                Err(e) => {
                    let wrapped = match e {
                        FlowError::Timeout { .. }
                        | FlowError::CollaboratorUnavailable { .. }
                        | FlowError::NodeFailure { .. } => e,
                        other => FlowError::NodeFailure {
                            node: node_id.to_string(),
                            message: other.to_string(),
                        },
                    };
                    return (Err(wrapped), attempt);
                }
            }
        }
    }

    /// Choose the next targets for a completed node.
    async fn route(&self, node_id: &str, state: &State, step: usize) -> Result<Vec<Target>> {
        match self.graph.edge_set(node_id) {
            None => Ok(Vec::new()),
            Some(EdgeSet::Conditional(cond)) => {
                let ctx = self.node_ctx(node_id, step, 0);
                let label =
                    tokio::time::timeout(self.timeout_for(node_id), cond.router.route(&ctx, state))
                        .await
                        .map_err(|_| FlowError::Timeout { scope: TimeoutScope::Node })??;
                match cond.routes.get(&label) {
                    Some(target) => Ok(vec![target.clone()]),
                    None => match &cond.default {
                        Some(default) => Ok(vec![default.clone()]),
                        None => {
                            Err(FlowError::UnroutedLabel { node: node_id.to_string(), label })
                        }
                    },
                }
            }
            Some(EdgeSet::Static(edges)) => {
                Ok(edges.iter().filter(|e| e.taken(state)).map(|e| e.to.clone()).collect())
            }
        }
    }

    /// Merge a branch result into the accumulator, applying the strategy only
    /// to keys the branch actually changed relative to the fan-out snapshot.
    fn fold_branch(
        &self,
        parent: &State,
        acc: &mut State,
        branch: &State,
        strategy: MergeStrategy,
    ) -> Result<()> {
        let mut delta = State::new();
        for (key, value) in branch.iter() {
            if parent.get(key) != Some(value) {
                delta.set(key.clone(), value.clone());
            }
        }
        for key in branch.meta_keys() {
            let value = branch.get_meta(&key).cloned();
            if parent.get_meta(&key) != value.as_ref() {
                if let Some(value) = value {
                    delta.set_meta(key, value);
                }
            }
        }
        acc.merge(&delta, strategy)
    }

    /// Run one branch until END, a failure, or `stop_at` (the fan-in node,
    /// which the parent executes after merging).
    fn run_branch(
        self: Arc<Self>,
        node_id: String,
        state: State,
        stop_at: Option<String>,
    ) -> BranchFuture {
        Box::pin(async move {
            let mut node_id = node_id;
            let mut state = state;

            loop {
                if stop_at.as_deref() == Some(node_id.as_str()) {
                    return Ok(state);
                }
                if self.cancel.is_cancelled() {
                    self.write_cancelled(&node_id, &state).await;
                    return Err(FlowError::Cancelled);
                }

                let step = self.next_step()?;
                let step_deadline = self.config.step_timeout.map(|d| Instant::now() + d);
                let visits = self.visit(&node_id);
                state.set_meta("__step", step as u64);
                state.set_meta(format!("__visits:{node_id}"), visits as u64);

                self.checkpoint(step, &node_id, &state, None).await?;
                self.emit(ExecutionEvent::step_start(&node_id, step)).await;

                let started_at = Utc::now();
                let clock = Instant::now();
                let input_digest = state_digest(&state);
                let (outcome, attempts) = self.invoke(&node_id, step, visits, &state).await;
                let duration_ms = clock.elapsed().as_millis() as u64;

                match outcome {
                    Ok(next_state) => {
                        // Only the step that produced the trace records it.
                        let tool_trace = match next_state.get_meta("__tool_trace") {
                            Some(after) if state.get_meta("__tool_trace") != Some(after) => {
                                after.as_array().cloned().unwrap_or_default()
                            }
                            _ => Vec::new(),
                        };
                        self.record(ExecutionRecord {
                            node_id: node_id.clone(),
                            step_index: step,
                            input_digest,
                            output_digest: Some(state_digest(&next_state)),
                            started_at,
                            finished_at: Utc::now(),
                            success: true,
                            error: None,
                            attempts,
                            tool_trace,
                        });
                        state = next_state;
                        self.emit(ExecutionEvent::state_update(&node_id, step, state.clone()))
                            .await;
                        self.emit(ExecutionEvent::node_end(&node_id, step, duration_ms)).await;
                    }
                    Err(error) => {
                        self.record(ExecutionRecord {
                            node_id: node_id.clone(),
                            step_index: step,
                            input_digest,
                            output_digest: None,
                            started_at,
                            finished_at: Utc::now(),
                            success: false,
                            error: Some(error.to_string()),
                            attempts,
                            tool_trace: Vec::new(),
                        });

                        if matches!(error, FlowError::Cancelled) {
                            self.write_cancelled(&node_id, &state).await;
                            return Err(FlowError::Cancelled);
                        }

                        // A declared `error` route lets the graph recover.
                        if let Some(target) = self.error_route(&node_id) {
                            state.set("error", error.to_string());
                            match target {
                                Target::End => return Ok(state),
                                Target::Node(next) => {
                                    node_id = next;
                                    continue;
                                }
                            }
                        }

                        self.checkpoint(step, &node_id, &state, Some("failed")).await?;
                        return Err(error);
                    }
                }

                let targets = match self.route(&node_id, &state, step).await {
                    Ok(targets) => targets,
                    Err(e) => {
                        self.checkpoint(step, &node_id, &state, Some("failed")).await?;
                        return Err(e);
                    }
                };

                if let Some(deadline) = step_deadline {
                    if Instant::now() > deadline {
                        self.checkpoint(step, &node_id, &state, Some("failed")).await?;
                        return Err(FlowError::Timeout { scope: TimeoutScope::Step });
                    }
                }

                let next_nodes: Vec<String> =
                    targets.iter().filter_map(|t| t.node_id().map(str::to_string)).collect();

                if next_nodes.is_empty() {
                    // Every target was END (or there were no edges).
                    return Ok(state);
                }
                if next_nodes.len() == 1 {
                    node_id = next_nodes[0].clone();
                    continue;
                }

                // Fan-out: clone per branch, bounded concurrency, merge in
                // declaration order at the join point.
                let join = self
                    .graph
                    .join_for(&node_id)
                    .map(str::to_string)
                    .or_else(|| stop_at.clone());

                let handles: Vec<_> = next_nodes
                    .iter()
                    .map(|head| {
                        let fut =
                            self.clone().run_branch(head.clone(), state.clone(), join.clone());
                        (head.clone(), tokio::spawn(fut))
                    })
                    .collect();

                let parent_state = state.clone();
                let mut merged: Option<State> = None;
                let mut branch_errors: Vec<(String, FlowError)> = Vec::new();
                let mut fatal: Option<FlowError> = None;

                for (head, handle) in handles {
                    match handle.await {
                        Ok(Ok(branch_state)) => match merged.as_mut() {
                            None => {
                                let mut acc = parent_state.clone();
                                self.fold_branch(
                                    &parent_state,
                                    &mut acc,
                                    &branch_state,
                                    self.config.merge_strategy,
                                )?;
                                merged = Some(acc);
                            }
                            Some(acc) => self.fold_branch(
                                &parent_state,
                                acc,
                                &branch_state,
                                self.config.merge_strategy,
                            )?,
                        },
                        Ok(Err(e)) => match e {
                            FlowError::Cancelled
                            | FlowError::StepBudget(_)
                            | FlowError::Timeout { scope: TimeoutScope::Request } => {
                                fatal.get_or_insert(e);
                            }
                            other => branch_errors.push((head, other)),
                        },
                        Err(join_err) => branch_errors.push((
                            head.clone(),
                            FlowError::NodeFailure {
                                node: head,
                                message: format!("branch task failed: {join_err}"),
                            },
                        )),
                    }
                }

                if let Some(fatal) = fatal {
                    return Err(fatal);
                }

                match merged {
                    None => {
                        // Every branch failed; surface the first error.
                        let (_, first) = branch_errors.swap_remove(0);
                        return Err(first);
                    }
                    Some(mut acc) => {
                        if !branch_errors.is_empty() {
                            let summary: Vec<Value> = branch_errors
                                .iter()
                                .map(|(head, e)| json!({"branch": head, "error": e.to_string()}))
                                .collect();
                            acc.set("branch_errors", Value::Array(summary));
                        }
                        match join {
                            Some(join_node) => {
                                state = acc;
                                node_id = join_node;
                            }
                            None => return Ok(acc),
                        }
                    }
                }
            }
        })
    }
}

/// Background drain for asynchronous checkpoint saves.
struct FlushQueue {
    tx: mpsc::Sender<Checkpoint>,
    worker: tokio::task::JoinHandle<()>,
}

impl FlushQueue {
    const CAPACITY: usize = 64;

    fn spawn(backend: Arc<dyn Checkpointer>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Checkpoint>(Self::CAPACITY);
        let worker = tokio::spawn(async move {
            while let Some(cp) = rx.recv().await {
                if let Err(e) = save_with_retry(&backend, &cp).await {
                    tracing::error!(error = %e, thread = %cp.thread_id, "checkpoint flush failed");
                }
            }
        });
        Self { tx, worker }
    }

    fn try_enqueue(&self, checkpoint: Checkpoint) -> bool {
        self.tx.try_send(checkpoint).is_ok()
    }

    /// Drain the queue and stop the worker.
    async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

/// Save with backoff on transient backend failures.
async fn save_with_retry(backend: &Arc<dyn Checkpointer>, checkpoint: &Checkpoint) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match backend.save(checkpoint).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() && attempt < 3 => {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt - 1))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::START;
    use crate::graph::Graph;

    fn set_node(
        key: &'static str,
        value: i64,
    ) -> impl Fn(NodeContext, State) -> std::future::Ready<Result<State>> {
        move |_ctx, mut state| {
            state.set(key, value);
            std::future::ready(Ok(state))
        }
    }

    #[tokio::test]
    async fn test_linear_execution() {
        let graph = Graph::new("linear")
            .add_node_fn("start", "Start", set_node("x", 1))
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
        let result = executor.execute(State::new(), ExecutionConfig::new("t")).await.unwrap();
        assert_eq!(result.get_i64("x").unwrap(), Some(2));
        assert_eq!(executor.records().len(), 2);
    }

    #[tokio::test]
    async fn test_step_budget() {
        let graph = Graph::new("loop")
            .add_node_fn("spin", "Spin", set_node("x", 1))
            .unwrap()
            .add_edge(START, "spin")
            .unwrap()
            .add_conditional_edges_fn("spin", |_| "spin".to_string(), [("spin", "spin"), (END, END)])
            .unwrap()
            .compile()
            .unwrap();

        let executor = Executor::new(graph);
        let result = executor
            .execute(State::new(), ExecutionConfig::new("t").with_max_steps(5))
            .await;
        assert!(matches!(result, Err(FlowError::StepBudget(_))));
    }

    #[tokio::test]
    async fn test_unrouted_label() {
        let graph = Graph::new("bad-router")
            .add_node_fn("a", "A", set_node("x", 1))
            .unwrap()
            .add_node_fn("b", "B", set_node("y", 2))
            .unwrap()
            .add_edge(START, "a")
            .unwrap()
            .add_conditional_edges_fn("a", |_| "nowhere".to_string(), [("b", "b")])
            .unwrap()
            .add_edge("b", END)
            .unwrap()
            .compile()
            .unwrap();

        let result = Executor::new(graph).execute(State::new(), ExecutionConfig::new("t")).await;
        assert!(matches!(result, Err(FlowError::UnroutedLabel { label, .. }) if label == "nowhere"));
    }

    #[tokio::test]
    async fn test_default_route_taken() {
        let graph = Graph::new("defaulted")
            .add_node_fn("a", "A", set_node("x", 1))
            .unwrap()
            .add_node_fn("fallback", "Fallback", set_node("fell_back", 1))
            .unwrap()
            .add_edge(START, "a")
            .unwrap()
            .add_conditional_edges_fn("a", |_| "nowhere".to_string(), [("fallback", "fallback")])
            .unwrap()
            .with_route_default("a", "fallback")
            .unwrap()
            .add_edge("fallback", END)
            .unwrap()
            .compile()
            .unwrap();

        let result =
            Executor::new(graph).execute(State::new(), ExecutionConfig::new("t")).await.unwrap();
        assert_eq!(result.get_i64("fell_back").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_node_retry_then_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let graph = Graph::new("flaky")
            .add_node_fn("flaky", "Flaky", move |_ctx, mut state: State| {
                let attempts = seen.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(FlowError::CollaboratorUnavailable {
                            name: "llm".to_string(),
                            message: "503".to_string(),
                        });
                    }
                    state.set("done", true);
                    Ok(state)
                }
            })
            .unwrap()
            .add_edge(START, "flaky")
            .unwrap()
            .add_edge("flaky", END)
            .unwrap()
            .with_node_retry(
                "flaky",
                RetryPolicy::new(3).with_initial_backoff(Duration::from_millis(1)),
            )
            .unwrap()
            .compile()
            .unwrap();

        let executor = Executor::new(graph);
        let result = executor.execute(State::new(), ExecutionConfig::new("t")).await.unwrap();
        assert_eq!(result.get_bool("done").unwrap(), Some(true));
        let records = executor.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_node_timeout() {
        let graph = Graph::new("slow")
            .add_node_fn("slow", "Slow", |_ctx, state: State| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(state)
            })
            .unwrap()
            .add_edge(START, "slow")
            .unwrap()
            .add_edge("slow", END)
            .unwrap()
            .with_node_timeout("slow", Duration::from_millis(20))
            .unwrap()
            .compile()
            .unwrap();

        let result = Executor::new(graph).execute(State::new(), ExecutionConfig::new("t")).await;
        assert!(matches!(result, Err(FlowError::Timeout { scope: TimeoutScope::Node })));
    }

    #[tokio::test]
    async fn test_error_route_recovers() {
        let graph = Graph::new("recovering")
            .add_node_fn("work", "Work", |_ctx, _state: State| async move {
                Err(FlowError::NodeFailure {
                    node: "work".to_string(),
                    message: "boom".to_string(),
                })
            })
            .unwrap()
            .add_node_fn("handler", "Handler", set_node("handled", 1))
            .unwrap()
            .add_edge(START, "work")
            .unwrap()
            .add_conditional_edges_fn(
                "work",
                |_| END.to_string(),
                [("error", "handler"), (END, END)],
            )
            .unwrap()
            .add_edge("handler", END)
            .unwrap()
            .compile()
            .unwrap();

        let result =
            Executor::new(graph).execute(State::new(), ExecutionConfig::new("t")).await.unwrap();
        assert_eq!(result.get_i64("handled").unwrap(), Some(1));
        assert!(result.get_str("error").unwrap().unwrap().contains("boom"));
    }
}
