//! The agent handle: a compiled graph template bound to a completer, tools
//! and persistence, exposed through the request/response envelope.

use crate::config::{AgentConfig, AgentKind};
use crate::definition::{AgentDefinition, AgentRequest, AgentResponse, Durations};
use crate::events::{self, AgentEvent, AgentEventStream};
use crate::prompt;
use crate::react::TOOL_RESULTS_KEY;
use crate::{chat, react, tool_agent};
use graphflow_checkpoint::{Checkpointer, MemorySaver, SessionRecord};
use graphflow_core::{Completer, FlowError, Message, Result, State, Tool, whitelisted};
use graphflow_graph::{CancelToken, ExecutionConfig, ExecutionEvent, Executor};
use graphflow_memory::{MemoryAdapter, RETRIEVED_CONTEXT_KEY};
use graphflow_session::SessionManager;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::StreamExt;

/// Builder wiring a template to its collaborators.
pub struct AgentBuilder {
    config: AgentConfig,
    completer: Arc<dyn Completer>,
    tools: Vec<Arc<dyn Tool>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    sessions: Option<Arc<SessionManager>>,
    memory: Option<Arc<MemoryAdapter>>,
    definition: Option<AgentDefinition>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig, completer: Arc<dyn Completer>) -> Self {
        Self {
            config,
            completer,
            tools: Vec::new(),
            checkpointer: None,
            sessions: None,
            memory: None,
            definition: None,
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryAdapter>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override the generated definition (custom schemas).
    pub fn with_definition(mut self, definition: AgentDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let checkpointer =
            self.checkpointer.unwrap_or_else(|| Arc::new(MemorySaver::new()));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(SessionManager::new(checkpointer.clone())));
        let bound = whitelisted(&self.tools, &self.config.tools);
        let definition =
            self.definition.unwrap_or_else(|| AgentDefinition::for_config(&self.config));

        let shared = Arc::new(self.config.clone());
        let graph = match self.config.kind {
            AgentKind::Chat => chat::build_graph(shared, self.completer.clone())?,
            AgentKind::React => {
                react::build_graph(shared, self.completer.clone(), bound.clone())?
            }
            AgentKind::Tool => {
                tool_agent::build_graph(shared, self.completer.clone(), bound.clone())?
            }
        };

        Ok(Agent {
            config: self.config,
            definition,
            executor: Executor::new(graph).with_checkpointer(checkpointer.clone()),
            checkpointer,
            sessions,
            memory: self.memory,
        })
    }
}

/// A pre-built graph template driving a completer (and tools) via the engine.
pub struct Agent {
    config: AgentConfig,
    definition: AgentDefinition,
    executor: Executor,
    checkpointer: Arc<dyn Checkpointer>,
    sessions: Arc<SessionManager>,
    memory: Option<Arc<MemoryAdapter>>,
}

impl Agent {
    pub fn builder(config: AgentConfig, completer: Arc<dyn Completer>) -> AgentBuilder {
        AgentBuilder::new(config, completer)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Static description exposed to the registry.
    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) fn execution_config(&self, thread_id: &str) -> ExecutionConfig {
        let mut config = ExecutionConfig::new(thread_id)
            .with_checkpoint_mode(self.config.checkpoint_mode);
        if self.config.kind == AgentKind::React {
            // One iteration is a plan/act/observe round.
            config = config.with_max_steps(3 * self.config.max_iterations);
        }
        if let Some(timeout) = self.config.request_timeout {
            config = config.with_request_timeout(timeout);
        }
        config
    }

    async fn resolve_session(&self, request: &AgentRequest) -> Result<SessionRecord> {
        match &request.session_id {
            Some(id) => self.sessions.touch(id).await,
            None => {
                let user = request.user_id.as_deref().unwrap_or("anonymous");
                self.sessions.open_session(user, None, None).await
            }
        }
    }

    fn seed_state(&self, request: &AgentRequest) -> State {
        let mut state = State::new();
        if let Some(text) = request.text() {
            state.set("input", text);
        }
        if let Some(context) = &request.context {
            for (key, value) in context {
                if key != "query_embedding" {
                    state.set(key.clone(), value.clone());
                }
            }
        }
        state
    }

    /// Fill `retrieved_context` from semantic memory when the request carries
    /// a query embedding.
    async fn inject_memory(
        &self,
        thread_id: &str,
        request: &AgentRequest,
        state: &mut State,
    ) -> Result<()> {
        let Some(memory) = &self.memory else { return Ok(()) };
        let Some(embedding) = request
            .context
            .as_ref()
            .and_then(|c| c.get("query_embedding"))
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v.clone()).ok())
        else {
            return Ok(());
        };

        let results = memory.search(thread_id, &embedding, None, None).await?;
        if !results.is_empty() {
            state.set(RETRIEVED_CONTEXT_KEY, MemoryAdapter::format_context(&results));
        }
        Ok(())
    }

    fn output_of(&self, state: &State) -> Value {
        output_value(self.config.kind, state)
    }

    /// Run the graph once for this request.
    pub async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        let clock = Instant::now();
        self.definition.validate_input(&request.input)?;

        let session = self.resolve_session(&request).await?;
        let step_lock = self.sessions.lock_thread(&session.thread_id).await;

        let mut state = self.seed_state(&request);
        self.inject_memory(&session.thread_id, &request, &mut state).await?;

        let final_state =
            self.executor.execute(state, self.execution_config(&session.thread_id)).await?;
        drop(step_lock);

        let checkpoint_id =
            self.checkpointer.latest(&session.thread_id).await?.map(|cp| cp.id);

        Ok(AgentResponse {
            session_id: session.id,
            thread_id: session.thread_id,
            output: self.output_of(&final_state),
            checkpoint_id,
            usage: prompt::take_usage(&final_state),
            durations: Durations { total_ms: clock.elapsed().as_millis() as u64 },
        })
    }

    /// Run the graph while streaming thought, tool and token events, ending
    /// with a `final` (or `error`) event.
    pub async fn stream(&self, request: AgentRequest) -> Result<AgentEventStream> {
        self.definition.validate_input(&request.input)?;

        let session = self.resolve_session(&request).await?;
        let step_lock = self.sessions.lock_thread(&session.thread_id).await;

        let mut state = self.seed_state(&request);
        self.inject_memory(&session.thread_id, &request, &mut state).await?;

        let kind = self.config.kind;
        let mut inner = self.executor.execute_stream(
            state,
            self.execution_config(&session.thread_id),
            CancelToken::new(),
        );

        let stream = async_stream::stream! {
            let _step_lock = step_lock;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(ExecutionEvent::Custom { data, .. }) => {
                        if let Some(event) = events::from_custom(&data) {
                            yield Ok(event);
                        }
                    }
                    Ok(ExecutionEvent::Done { state, .. }) => {
                        yield Ok(AgentEvent::Final { output: output_value(kind, &state) });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Ok(AgentEvent::Error { message: e.to_string() });
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Ordered conversation history visible through a session.
    pub async fn conversation(&self, session_id: &str) -> Result<Vec<Message>> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| FlowError::InvalidInput(format!("unknown session '{session_id}'")))?;
        match self.checkpointer.latest(&session.thread_id).await? {
            Some(checkpoint) => prompt::history(&checkpoint.state),
            None => Ok(Vec::new()),
        }
    }

    /// Drop the thread's history (checkpoints and documents) while keeping
    /// the thread itself addressable.
    pub async fn clear_conversation(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| FlowError::InvalidInput(format!("unknown session '{session_id}'")))?;
        let thread = self.checkpointer.get_thread(&session.thread_id).await?;
        self.checkpointer.delete_thread(&session.thread_id).await?;
        if let Some(mut thread) = thread {
            thread.updated_at = chrono::Utc::now();
            self.checkpointer.put_thread(&thread).await?;
        }
        Ok(())
    }
}

fn output_value(kind: AgentKind, state: &State) -> Value {
    let answer = state
        .get("answer")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();
    match kind {
        AgentKind::Tool => json!({
            "answer": answer,
            "tool_results": state.get(TOOL_RESULTS_KEY).cloned().unwrap_or(json!([])),
        }),
        _ => json!({"answer": answer}),
    }
}
