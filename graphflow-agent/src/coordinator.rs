//! Composing agents into higher-order workflows: sequential pipelines,
//! parallel swarms and LLM-routed supervisors. All three are ordinary graphs
//! over [`AgentNode`]s; the engine is never re-implemented.

use crate::agent::Agent;
use async_trait::async_trait;
use graphflow_core::{
    Completer, CompletionRequest, FlowError, Message, Result, State,
};
use graphflow_graph::{
    CompiledGraph, END, ExecutionConfig, Executor, FnRouter, Graph, Node, NodeContext,
    PassthroughNode, START,
};
use std::sync::Arc;

/// How a composed workflow schedules its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationPattern {
    Pipeline,
    Swarm,
    Supervisor,
}

impl CoordinationPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Swarm => "swarm",
            Self::Supervisor => "supervisor",
        }
    }
}

/// How an [`AgentNode`] derives its input from the shared state.
enum AgentInput {
    /// Previous agent's answer (or the initial `input`).
    Chain,
    /// Collect every `result:*` entry (the synthesiser position in a swarm).
    Collect,
}

/// Runs one agent's graph as a node inside a coordination graph.
///
/// The agent's final answer lands in `answer` and under `result:<name>`, so
/// pipelines chain on the former while swarm synthesisers gather the latter.
pub struct AgentNode {
    id: String,
    agent: Arc<Agent>,
    input: AgentInput,
}

impl AgentNode {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { id: agent.name().to_string(), agent, input: AgentInput::Chain }
    }

    fn synthesiser(agent: Arc<Agent>) -> Self {
        Self { id: agent.name().to_string(), agent, input: AgentInput::Collect }
    }

    fn derive_input(&self, state: &State) -> Result<Option<String>> {
        match self.input {
            AgentInput::Chain => Ok(state
                .get_str("input")?
                .map(str::to_string)
                .or(state.get_str("answer")?.map(str::to_string))),
            AgentInput::Collect => {
                let mut parts = Vec::new();
                for key in state.keys() {
                    if let Some(agent_name) = key.strip_prefix("result:") {
                        if let Some(answer) = state.get_str(&key)? {
                            parts.push(format!("{agent_name}: {answer}"));
                        }
                    }
                }
                if parts.is_empty() {
                    Ok(state.get_str("input")?.map(str::to_string))
                } else {
                    Ok(Some(parts.join("\n\n")))
                }
            }
        }
    }
}

#[async_trait]
impl Node for AgentNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, ctx: &NodeContext, state: State) -> Result<State> {
        let input = self.derive_input(&state)?.unwrap_or_default();

        let mut seed = state;
        seed.set("input", input);
        seed.remove("answer");

        // Each member runs on its own sub-thread so its checkpoints never
        // interleave with the coordinator's.
        let thread = format!("{}/{}", ctx.thread_id, self.agent.name());
        let mut out =
            self.agent.executor().execute(seed, self.agent.execution_config(&thread)).await?;

        let answer = out.get_str("answer")?.unwrap_or_default().to_string();
        out.set(format!("result:{}", self.agent.name()), answer);
        Ok(out)
    }
}

/// A composition of agents executing as one graph.
pub struct Coordinator {
    name: String,
    pattern: CoordinationPattern,
    executor: Executor,
}

impl Coordinator {
    /// Sequential pipeline: agent *i*'s answer feeds agent *i+1*.
    pub fn pipeline(name: &str, agents: Vec<Arc<Agent>>) -> Result<Self> {
        if agents.is_empty() {
            return Err(FlowError::InvalidGraph("pipeline needs at least one agent".into()));
        }

        let ids: Vec<String> = agents.iter().map(|a| a.name().to_string()).collect();
        let mut graph = Graph::new(name);
        for agent in agents {
            graph = graph.add_node(AgentNode::new(agent))?;
        }
        graph = graph.add_edge(START, &ids[0])?;
        for pair in ids.windows(2) {
            graph = graph.add_edge(&pair[0], &pair[1])?;
        }
        graph = graph.add_edge(&ids[ids.len() - 1], END)?;

        Ok(Self::from_graph(name, CoordinationPattern::Pipeline, graph.compile()?))
    }

    /// Parallel swarm: every agent answers the same input on an independent
    /// state clone; the synthesiser merges their `result:*` entries.
    pub fn swarm(
        name: &str,
        agents: Vec<Arc<Agent>>,
        synthesiser: Arc<Agent>,
    ) -> Result<Self> {
        if agents.is_empty() {
            return Err(FlowError::InvalidGraph("swarm needs at least one agent".into()));
        }

        let ids: Vec<String> = agents.iter().map(|a| a.name().to_string()).collect();
        let synth_id = synthesiser.name().to_string();

        let mut graph = Graph::new(name).add_node(PassthroughNode::new("dispatch"))?;
        for agent in agents {
            graph = graph.add_node(AgentNode::new(agent))?;
        }
        graph = graph.add_node(AgentNode::synthesiser(synthesiser))?;
        graph = graph.add_edge(START, "dispatch")?;
        for id in &ids {
            graph = graph.add_edge("dispatch", id)?;
            graph = graph.add_edge(id, &synth_id)?;
        }
        graph = graph.add_edge(&synth_id, END)?;

        Ok(Self::from_graph(name, CoordinationPattern::Swarm, graph.compile()?))
    }

    /// Supervisor: a completer-backed router picks which delegate handles the
    /// turn; unknown labels fall back to the first delegate.
    pub fn supervisor(
        name: &str,
        model: &str,
        completer: Arc<dyn Completer>,
        delegates: Vec<Arc<Agent>>,
    ) -> Result<Self> {
        if delegates.is_empty() {
            return Err(FlowError::InvalidGraph("supervisor needs at least one delegate".into()));
        }

        let labels: Vec<String> = delegates.iter().map(|a| a.name().to_string()).collect();
        let default = labels[0].clone();
        let model = model.to_string();
        let router_labels = labels.clone();
        let router_completer = completer.clone();

        let mut graph = Graph::new(name)
            .add_node_fn("supervisor", "Supervisor", move |_ctx, mut state: State| {
                let completer = router_completer.clone();
                let labels = router_labels.clone();
                let model = model.clone();
                async move {
                    let input = state.get_str("input")?.unwrap_or_default().to_string();
                    let instruction = format!(
                        "Route the user's request to one of: {}. Reply with only the name.",
                        labels.join(", ")
                    );
                    let request = CompletionRequest::new(
                        &model,
                        vec![Message::system(instruction), Message::user(input)],
                    );
                    let response = completer.complete(request).await?;
                    let raw = response
                        .message()
                        .map(|m| m.content.trim().to_lowercase())
                        .unwrap_or_default();
                    let chosen = labels
                        .iter()
                        .find(|l| raw.contains(&l.to_lowercase()))
                        .cloned()
                        .unwrap_or_else(|| labels[0].clone());
                    state.set("next_agent", chosen);
                    Ok(state)
                }
            })?;

        for delegate in delegates {
            graph = graph.add_node(AgentNode::new(delegate))?;
        }
        graph = graph.add_edge(START, "supervisor")?;
        let routes: Vec<(String, String)> =
            labels.iter().map(|l| (l.clone(), l.clone())).collect();
        graph = graph
            .add_conditional_edges("supervisor", FnRouter::by_field("next_agent"), routes)?
            .with_route_default("supervisor", &default)?;
        for label in &labels {
            graph = graph.add_edge(label, END)?;
        }

        Ok(Self::from_graph(name, CoordinationPattern::Supervisor, graph.compile()?))
    }

    fn from_graph(name: &str, pattern: CoordinationPattern, graph: CompiledGraph) -> Self {
        Self { name: name.to_string(), pattern, executor: Executor::new(graph) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> CoordinationPattern {
        self.pattern
    }

    /// Run the composed workflow over a plain-text input.
    pub async fn run(&self, input: &str, thread_id: &str) -> Result<State> {
        let mut state = State::new();
        state.set("input", input);
        // Recorded so a resumed thread can reconstruct the scheduling.
        state.set_meta("__coordinator", self.pattern.as_str());
        self.executor
            .execute(state, ExecutionConfig::new(thread_id).with_workers(8))
            .await
    }
}
