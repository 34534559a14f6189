//! The tool template: one completion with forced tool execution, no loop.

use crate::config::AgentConfig;
use crate::events::marker;
use crate::prompt;
use crate::react::TOOL_RESULTS_KEY;
use graphflow_core::{
    Completer, FlowError, Message, Result, State, Tool, ToolSpec, spec_of,
};
use graphflow_graph::{CompiledGraph, END, Graph, NodeContext, START};
use serde_json::{Value, json};
use std::sync::Arc;

pub(crate) fn build_graph(
    config: Arc<AgentConfig>,
    completer: Arc<dyn Completer>,
    tools: Vec<Arc<dyn Tool>>,
) -> Result<CompiledGraph> {
    let specs: Vec<ToolSpec> = tools.iter().map(|t| spec_of(t.as_ref())).collect();

    Graph::new(&config.name)
        .add_node_fn("call", "Call", move |ctx: NodeContext, mut state: State| {
            let config = config.clone();
            let completer = completer.clone();
            let specs = specs.clone();
            let tools = tools.clone();
            async move {
                let mut messages = prompt::history(&state)?;
                prompt::absorb_input(&mut state, &mut messages)?;

                let request = prompt::completion_request(
                    &config,
                    prompt::request_messages(&config.system_prompt, &state, &messages),
                    &specs,
                );
                let response = completer.complete(request).await?;
                let assistant = response.message().cloned().ok_or_else(|| {
                    FlowError::CollaboratorUnavailable {
                        name: completer.name().to_string(),
                        message: "no choices returned".to_string(),
                    }
                })?;
                prompt::record_usage(&mut state, response.usage);
                messages.push(assistant.clone());

                if assistant.has_tool_calls() {
                    let mut results = Vec::with_capacity(assistant.tool_calls.len());
                    let mut trace = Vec::with_capacity(assistant.tool_calls.len());
                    let mut answers = Vec::with_capacity(assistant.tool_calls.len());

                    for call in &assistant.tool_calls {
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
                        messages
                            .push(Message::tool(result.clone(), &call.id).with_name(&call.name));
                        results.push(json!({"id": call.id, "name": call.name, "result": result}));
                        answers.push(result);
                    }

                    state.set(TOOL_RESULTS_KEY, Value::Array(results));
                    state.set_meta("__tool_trace", Value::Array(trace));
                    state.set("answer", answers.join("\n"));
                } else {
                    // The model declined to call a tool; surface its text.
                    state.set("answer", assistant.content.clone());
                }

                prompt::write_history(&mut state, &messages)?;
                Ok(state)
            }
        })?
        .add_edge(START, "call")?
        .add_edge("call", END)?
        .compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentKind;
    use async_trait::async_trait;
    use graphflow_core::{
        CompletionRequest, CompletionResponse, FinishReason, ToolCall,
    };
    use graphflow_graph::{ExecutionConfig, Executor};

    struct AlwaysToolCompleter;

    #[async_trait]
    impl Completer for AlwaysToolCompleter {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse> {
            let message = Message::assistant("").with_tool_calls(vec![ToolCall::new(
                "call-1",
                "clock",
                json!({}),
            )]);
            Ok(CompletionResponse::of(message, FinishReason::ToolCalls))
        }
    }

    struct Clock;

    #[async_trait]
    impl Tool for Clock {
        fn name(&self) -> &str {
            "clock"
        }

        fn description(&self) -> &str {
            "Tell the time"
        }

        async fn invoke(&self, _args: Value) -> Result<String> {
            Ok("12:00".to_string())
        }
    }

    #[tokio::test]
    async fn test_forced_tool_invocation() {
        let config = Arc::new(AgentConfig::new("tooler", AgentKind::Tool).with_model("m"));
        let graph =
            build_graph(config, Arc::new(AlwaysToolCompleter), vec![Arc::new(Clock)]).unwrap();

        let mut input = State::new();
        input.set("input", "what time is it?");
        let result = Executor::new(graph)
            .execute(input, ExecutionConfig::new("tool-test"))
            .await
            .unwrap();

        assert_eq!(result.get_str("answer").unwrap(), Some("12:00"));
        let results = result.get_array(TOOL_RESULTS_KEY).unwrap().unwrap();
        assert_eq!(results.len(), 1);
    }
}
