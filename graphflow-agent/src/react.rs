//! The ReAct template: plan, act, observe, loop.
//!
//! The only cyclic template. The loop routes back to `plan` while no answer
//! has been produced; termination is guaranteed by the executor's step
//! budget, derived from the agent's `max_iterations`.

use crate::config::AgentConfig;
use crate::events::marker;
use crate::prompt;
use graphflow_core::{
    Completer, FlowError, Message, Result, State, Tool, ToolCall, ToolSpec, spec_of,
};
use graphflow_graph::{CompiledGraph, END, Graph, NodeContext, START};
use serde_json::{Value, json};
use std::sync::Arc;

/// State key the plan/observe nodes leave pending tool invocations under.
pub const TOOL_CALLS_KEY: &str = "tool_calls";
/// State key the act node writes tool outputs under.
pub const TOOL_RESULTS_KEY: &str = "tool_results";
/// Metadata key counting completed plan phases.
pub const ITERATION_META_KEY: &str = "__iteration";

async fn think(
    config: &AgentConfig,
    completer: &Arc<dyn Completer>,
    specs: &[ToolSpec],
    ctx: &NodeContext,
    mut state: State,
) -> Result<State> {
    let mut messages = prompt::history(&state)?;
    prompt::absorb_input(&mut state, &mut messages)?;

    let request = prompt::completion_request(
        config,
        prompt::request_messages(&config.system_prompt, &state, &messages),
        specs,
    );
    let response = completer.complete(request).await?;
    let assistant = response.message().cloned().ok_or_else(|| {
        FlowError::CollaboratorUnavailable {
            name: completer.name().to_string(),
            message: "no choices returned".to_string(),
        }
    })?;
    prompt::record_usage(&mut state, response.usage);

    if !assistant.content.is_empty() {
        ctx.emit(json!({marker::EVENT: marker::THOUGHT, "text": assistant.content})).await;
        state.set("thought", assistant.content.clone());
    }

    if assistant.has_tool_calls() {
        let calls = serde_json::to_value(&assistant.tool_calls).map_err(|e| {
            FlowError::Serialisation { key: TOOL_CALLS_KEY.to_string(), message: e.to_string() }
        })?;
        state.set(TOOL_CALLS_KEY, calls);
    } else {
        state.remove(TOOL_CALLS_KEY);
        state.set("answer", assistant.content.clone());
    }

    messages.push(assistant);
    prompt::write_history(&mut state, &messages)?;
    Ok(state)
}

pub(crate) fn build_graph(
    config: Arc<AgentConfig>,
    completer: Arc<dyn Completer>,
    tools: Vec<Arc<dyn Tool>>,
) -> Result<CompiledGraph> {
    let specs: Vec<ToolSpec> = tools.iter().map(|t| spec_of(t.as_ref())).collect();

    let plan_config = config.clone();
    let plan_completer = completer.clone();
    let plan_specs = specs.clone();

    let observe_config = config.clone();
    let observe_completer = completer.clone();
    let observe_specs = specs;

    Graph::new(&config.name)
        .add_node_fn("plan", "Plan", move |ctx: NodeContext, mut state: State| {
            let config = plan_config.clone();
            let completer = plan_completer.clone();
            let specs = plan_specs.clone();
            async move {
                let iteration =
                    state.get_meta(ITERATION_META_KEY).and_then(|v| v.as_u64()).unwrap_or(0);
                state.set_meta(ITERATION_META_KEY, iteration + 1);
                // A fresh plan phase always clears the previous answer.
                state.remove("answer");
                think(&config, &completer, &specs, &ctx, state).await
            }
        })?
        .add_node_fn("act", "Act", move |ctx: NodeContext, mut state: State| {
            let tools = tools.clone();
            async move {
                let calls: Vec<ToolCall> =
                    state.get_as(TOOL_CALLS_KEY)?.unwrap_or_default();
                let mut messages = prompt::history(&state)?;
                let mut results = Vec::with_capacity(calls.len());
                let mut trace = Vec::with_capacity(calls.len());

                for call in &calls {
                    ctx.emit(json!({
                        marker::EVENT: marker::TOOL_CALL,
                        "id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }))
                    .await;

                    let result = match tools.iter().find(|t| t.name() == call.name) {
                        Some(tool) => match tool.invoke(call.arguments.clone()).await {
                            Ok(output) => output,
                            Err(e) => format!("error: {e}"),
                        },
                        None => format!("error: tool '{}' is not available", call.name),
                    };

                    ctx.emit(json!({
                        marker::EVENT: marker::TOOL_RESULT,
                        "id": call.id,
                        "name": call.name,
                        "result": result,
                    }))
                    .await;

                    trace.push(json!({"id": call.id, "name": call.name, "result": result}));
                    messages.push(Message::tool(result.clone(), &call.id).with_name(&call.name));
                    results.push(json!({"id": call.id, "name": call.name, "result": result}));
                }

                state.set(TOOL_RESULTS_KEY, Value::Array(results));
                state.set_meta("__tool_trace", Value::Array(trace));
                state.remove(TOOL_CALLS_KEY);
                prompt::write_history(&mut state, &messages)?;
                Ok(state)
            }
        })?
        .add_node_fn("observe", "Observe", move |ctx: NodeContext, state: State| {
            let config = observe_config.clone();
            let completer = observe_completer.clone();
            let specs = observe_specs.clone();
            async move { think(&config, &completer, &specs, &ctx, state).await }
        })?
        .add_edge(START, "plan")?
        .add_edge("plan", "act")?
        .add_edge("act", "observe")?
        .add_conditional_edges_fn(
            "observe",
            |state| {
                if state.get("answer").is_some() { END.to_string() } else { "plan".to_string() }
            },
            [("plan", "plan"), (END, END)],
        )?
        .compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentKind;
    use async_trait::async_trait;
    use graphflow_core::{CompletionRequest, CompletionResponse, FinishReason, Role};
    use graphflow_graph::{ExecutionConfig, Executor};

    /// Requests one calculator call, then answers.
    struct OneShotToolCompleter;

    #[async_trait]
    impl Completer for OneShotToolCompleter {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
            let already_used_tool = req.messages.iter().any(|m| m.role == Role::Tool);
            let message = if already_used_tool {
                Message::assistant("the answer is 4")
            } else {
                Message::assistant("I should calculate").with_tool_calls(vec![ToolCall::new(
                    "call-1",
                    "calculator",
                    json!({"expression": "2+2"}),
                )])
            };
            Ok(CompletionResponse::of(message, FinishReason::Stop))
        }
    }

    struct Calculator;

    #[async_trait]
    impl Tool for Calculator {
        fn name(&self) -> &str {
            "calculator"
        }

        fn description(&self) -> &str {
            "Evaluate arithmetic"
        }

        async fn invoke(&self, _args: Value) -> Result<String> {
            Ok("4".to_string())
        }
    }

    #[tokio::test]
    async fn test_react_tool_cycle_then_answer() {
        let config = Arc::new(AgentConfig::new("react", AgentKind::React).with_model("m"));
        let graph =
            build_graph(config, Arc::new(OneShotToolCompleter), vec![Arc::new(Calculator)])
                .unwrap();

        let mut input = State::new();
        input.set("input", "what is 2+2?");
        let result = Executor::new(graph)
            .execute(input, ExecutionConfig::new("react-test"))
            .await
            .unwrap();

        assert_eq!(result.get_str("answer").unwrap(), Some("the answer is 4"));
        let results = result.get_array(TOOL_RESULTS_KEY).unwrap().unwrap();
        assert_eq!(results[0]["result"], json!("4"));

        // user, assistant(tool call), tool, assistant(answer)
        let messages = prompt::history(&result).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_in_results() {
        struct WrongToolCompleter;

        #[async_trait]
        impl Completer for WrongToolCompleter {
            fn name(&self) -> &str {
                "stub"
            }

            async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
                let already_used_tool = req.messages.iter().any(|m| m.role == Role::Tool);
                let message = if already_used_tool {
                    Message::assistant("done")
                } else {
                    Message::assistant("").with_tool_calls(vec![ToolCall::new(
                        "call-1",
                        "missing_tool",
                        json!({}),
                    )])
                };
                Ok(CompletionResponse::of(message, FinishReason::Stop))
            }
        }

        let config = Arc::new(AgentConfig::new("react", AgentKind::React).with_model("m"));
        let graph = build_graph(config, Arc::new(WrongToolCompleter), vec![]).unwrap();

        let mut input = State::new();
        input.set("input", "go");
        let result = Executor::new(graph)
            .execute(input, ExecutionConfig::new("react-missing-tool"))
            .await
            .unwrap();

        let results = result.get_array(TOOL_RESULTS_KEY).unwrap().unwrap();
        let text = results[0]["result"].as_str().unwrap();
        assert!(text.contains("not available"));
    }
}
