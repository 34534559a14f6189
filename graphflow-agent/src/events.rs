//! Streaming events surfaced to agent consumers.

use futures::stream::Stream;
use graphflow_core::Result;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;

/// Server-sent-event style payloads, emitted in order:
/// thought, tool_call, tool_result and token events as they happen, then a
/// single final (or error) event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Thought { text: String },
    ToolCall { id: String, name: String, arguments: Value },
    ToolResult { id: String, name: String, result: String },
    Token { text: String },
    Final { output: Value },
    Error { message: String },
}

/// Stream of agent events.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = Result<AgentEvent>> + Send>>;

/// Internal wire markers used by node-emitted custom events.
pub(crate) mod marker {
    pub const EVENT: &str = "event";
    pub const THOUGHT: &str = "thought";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const TOKEN: &str = "token";
}

/// Decode a node custom-event payload into an [`AgentEvent`].
pub(crate) fn from_custom(data: &Value) -> Option<AgentEvent> {
    let text = |key: &str| data.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    match data.get(marker::EVENT).and_then(|v| v.as_str())? {
        marker::THOUGHT => Some(AgentEvent::Thought { text: text("text") }),
        marker::TOKEN => Some(AgentEvent::Token { text: text("text") }),
        marker::TOOL_CALL => Some(AgentEvent::ToolCall {
            id: text("id"),
            name: text("name"),
            arguments: data.get("arguments").cloned().unwrap_or(Value::Null),
        }),
        marker::TOOL_RESULT => Some(AgentEvent::ToolResult {
            id: text("id"),
            name: text("name"),
            result: text("result"),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialisation() {
        let event = AgentEvent::Token { text: "hel".to_string() };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "token", "data": {"text": "hel"}})
        );
    }

    #[test]
    fn test_from_custom() {
        let decoded =
            from_custom(&json!({"event": "thought", "text": "need a calculator"})).unwrap();
        assert!(matches!(decoded, AgentEvent::Thought { text } if text == "need a calculator"));

        assert!(from_custom(&json!({"event": "unknown"})).is_none());
        assert!(from_custom(&json!({"no_event": true})).is_none());
    }
}
