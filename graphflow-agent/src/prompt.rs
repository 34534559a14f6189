//! Shared helpers for templates: conversation history, prompt assembly and
//! usage accounting.

use crate::config::AgentConfig;
use graphflow_core::{
    CompletionRequest, FlowError, Message, Result, State, ToolSpec, Usage,
};
use graphflow_memory::RETRIEVED_CONTEXT_KEY;

/// State key holding the conversation history.
pub const MESSAGES_KEY: &str = "messages";
/// Metadata key accumulating provider token usage across a request.
pub const USAGE_META_KEY: &str = "__usage";

/// Read the conversation history from state; absent means empty.
pub(crate) fn history(state: &State) -> Result<Vec<Message>> {
    Ok(state.get_as::<Vec<Message>>(MESSAGES_KEY)?.unwrap_or_default())
}

/// Write the conversation history back.
pub(crate) fn write_history(state: &mut State, messages: &[Message]) -> Result<()> {
    let encoded = serde_json::to_value(messages).map_err(|e| FlowError::Serialisation {
        key: MESSAGES_KEY.to_string(),
        message: e.to_string(),
    })?;
    state.set(MESSAGES_KEY, encoded);
    Ok(())
}

/// Pop the pending `input` into the history as a user turn, if present.
pub(crate) fn absorb_input(state: &mut State, messages: &mut Vec<Message>) -> Result<()> {
    if let Some(input) = state.get_str("input")?.map(str::to_string) {
        if !input.is_empty() {
            messages.push(Message::user(input));
        }
        state.remove("input");
    }
    Ok(())
}

/// Assemble the wire messages: system prompt, retrieved context, history.
pub(crate) fn request_messages(
    system_prompt: &str,
    state: &State,
    history: &[Message],
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if !system_prompt.is_empty() {
        messages.push(Message::system(system_prompt));
    }
    if let Ok(Some(context)) = state.get_str(RETRIEVED_CONTEXT_KEY) {
        if !context.is_empty() {
            messages.push(Message::system(format!("Relevant context:\n{context}")));
        }
    }
    messages.extend_from_slice(history);
    messages
}

/// Build a completion request from the agent's configuration.
pub(crate) fn completion_request(
    config: &AgentConfig,
    messages: Vec<Message>,
    tools: &[ToolSpec],
) -> CompletionRequest {
    let mut request = CompletionRequest::new(&config.model, messages);
    if !tools.is_empty() {
        request = request.with_tools(tools.to_vec());
    }
    if let Some(temperature) = config.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = config.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    request
}

/// Accumulate provider usage into state metadata.
pub(crate) fn record_usage(state: &mut State, usage: Usage) {
    let mut total: Usage = state
        .get_meta(USAGE_META_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    total.absorb(usage);
    if let Ok(encoded) = serde_json::to_value(total) {
        state.set_meta(USAGE_META_KEY, encoded);
    }
}

/// Total usage accumulated over a request.
pub(crate) fn take_usage(state: &State) -> Usage {
    state
        .get_meta(USAGE_META_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentKind;

    #[test]
    fn test_history_roundtrip() {
        let mut state = State::new();
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        write_history(&mut state, &messages).unwrap();
        assert_eq!(history(&state).unwrap(), messages);
    }

    #[test]
    fn test_absorb_input() {
        let mut state = State::new();
        state.set("input", "question");
        let mut messages = Vec::new();
        absorb_input(&mut state, &mut messages).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(state.get("input").is_none());
    }

    #[test]
    fn test_request_messages_order() {
        let mut state = State::new();
        state.set(RETRIEVED_CONTEXT_KEY, "remembered fact");
        let history = vec![Message::user("hi")];
        let messages = request_messages("be helpful", &state, &history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "be helpful");
        assert!(messages[1].content.contains("remembered fact"));
        assert_eq!(messages[2].content, "hi");
    }

    #[test]
    fn test_usage_accumulates() {
        let mut state = State::new();
        record_usage(
            &mut state,
            Usage { prompt_tokens: 10, completion_tokens: 2, total_tokens: 12 },
        );
        record_usage(
            &mut state,
            Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 },
        );
        assert_eq!(take_usage(&state).total_tokens, 22);
    }

    #[test]
    fn test_completion_request_carries_config() {
        let config = AgentConfig::new("a", AgentKind::Chat)
            .with_model("test-model")
            .with_temperature(0.2)
            .with_max_tokens(64);
        let request = completion_request(&config, vec![Message::user("hi")], &[]);
        assert_eq!(request.model, "test-model");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(64));
    }
}
