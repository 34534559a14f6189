//! The chat template: one completion over the conversation history.

use crate::config::AgentConfig;
use crate::events::marker;
use crate::prompt;
use futures::StreamExt;
use graphflow_core::{Completer, CompletionChunk, FlowError, Result, State};
use graphflow_graph::{CompiledGraph, END, Graph, NodeContext, START};
use serde_json::json;
use std::sync::Arc;

pub(crate) fn build_graph(
    config: Arc<AgentConfig>,
    completer: Arc<dyn Completer>,
) -> Result<CompiledGraph> {
    Graph::new(&config.name)
        .add_node_fn("llm", "LLM", move |ctx: NodeContext, mut state: State| {
            let config = config.clone();
            let completer = completer.clone();
            async move {
                let mut messages = prompt::history(&state)?;
                prompt::absorb_input(&mut state, &mut messages)?;

                let request = prompt::completion_request(
                    &config,
                    prompt::request_messages(&config.system_prompt, &state, &messages),
                    &[],
                );

                let mut stream = completer.stream(request).await?;
                let mut response = None;
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        CompletionChunk::Token(text) => {
                            ctx.emit(json!({marker::EVENT: marker::TOKEN, "text": text})).await;
                        }
                        CompletionChunk::Final(full) => response = Some(full),
                        CompletionChunk::ToolCall(_) => {}
                    }
                }

                let response = response.ok_or_else(|| FlowError::CollaboratorUnavailable {
                    name: completer.name().to_string(),
                    message: "stream ended without a final response".to_string(),
                })?;
                let assistant =
                    response.message().cloned().ok_or_else(|| FlowError::CollaboratorUnavailable {
                        name: completer.name().to_string(),
                        message: "no choices returned".to_string(),
                    })?;

                prompt::record_usage(&mut state, response.usage);
                state.set("answer", assistant.content.clone());
                messages.push(assistant);
                prompt::write_history(&mut state, &messages)?;
                Ok(state)
            }
        })?
        .add_edge(START, "llm")?
        .add_edge("llm", END)?
        .compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentKind;
    use async_trait::async_trait;
    use graphflow_core::{
        CompletionRequest, CompletionResponse, FinishReason, Message, Usage,
    };
    use graphflow_graph::{ExecutionConfig, Executor};

    struct EchoCompleter;

    #[async_trait]
    impl Completer for EchoCompleter {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let mut response = CompletionResponse::of(
                Message::assistant(format!("echo: {last}")),
                FinishReason::Stop,
            );
            response.usage = Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 };
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_chat_appends_turns() {
        let config = Arc::new(AgentConfig::new("chat", AgentKind::Chat).with_model("m"));
        let graph = build_graph(config, Arc::new(EchoCompleter)).unwrap();

        let mut input = State::new();
        input.set("input", "hi");
        let result = Executor::new(graph)
            .execute(input, ExecutionConfig::new("chat-test"))
            .await
            .unwrap();

        assert_eq!(result.get_str("answer").unwrap(), Some("echo: hi"));
        let messages = prompt::history(&result).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "echo: hi");
        assert_eq!(prompt::take_usage(&result).total_tokens, 5);
    }
}
