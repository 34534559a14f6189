//! Conversation message and tool-call records.
//!
//! Messages are the declared record type stored under the `messages` state
//! key; they serialise to the role/content shape every completer speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id echoed back in the tool result message.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// JSON arguments matching the tool's schema.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self { id: id.into(), name: name.into(), arguments }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool invocations requested alongside this message (assistant only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool-role messages, the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional author name (e.g. the tool that produced a result).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new(), tool_call_id: None, name: None }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool result answering the call with the given id.
    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            name: None,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this message requests at least one tool invocation.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_plain_message() {
        let msg = Message::user("hi");
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded, json!({"role": "user", "content": "hi"}));
        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_tool_call_message() {
        let msg = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            "call-1",
            "calculator",
            json!({"expression": "2+2"}),
        )]);
        assert!(msg.has_tool_calls());
        let decoded: Message = serde_json::from_value(serde_json::to_value(&msg).unwrap()).unwrap();
        assert_eq!(decoded.tool_calls[0].name, "calculator");
    }

    #[test]
    fn test_tool_result_links_call() {
        let msg = Message::tool("4", "call-1").with_name("calculator");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
    }
}
