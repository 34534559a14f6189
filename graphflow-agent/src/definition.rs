//! Static agent descriptions and the request/response envelope.

use crate::config::{AgentConfig, AgentKind};
use graphflow_core::{FlowError, Result, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// What the external surface needs to know about an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub kind: AgentKind,
    pub input_schema: Value,
    pub output_schema: Value,
    pub system_prompt: String,
}

impl AgentDefinition {
    /// Default definition for a template agent: a `message` in, an `answer`
    /// out (plus `tool_results` for tool agents).
    pub fn for_config(config: &AgentConfig) -> Self {
        let output_schema = match config.kind {
            AgentKind::Tool => json!({
                "type": "object",
                "properties": {
                    "answer": {"type": "string"},
                    "tool_results": {"type": "array"}
                }
            }),
            _ => json!({
                "type": "object",
                "properties": {
                    "answer": {"type": "string"}
                }
            }),
        };
        Self {
            name: config.name.clone(),
            kind: config.kind,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"}
                },
                "required": ["message"]
            }),
            output_schema,
            system_prompt: config.system_prompt.clone(),
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Structural validation of a request against the input schema: required
    /// fields are present, declared primitive types match. Runs before the
    /// graph starts; violations never reach the completer.
    pub fn validate_input(&self, input: &Value) -> Result<()> {
        let Some(object) = input.as_object() else {
            return Err(FlowError::InvalidInput("input must be an object".to_string()));
        };

        if let Some(required) = self.input_schema.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                if !object.contains_key(field) {
                    return Err(FlowError::InvalidInput(format!(
                        "missing required field '{field}'"
                    )));
                }
            }
        }

        if let Some(properties) =
            self.input_schema.get("properties").and_then(|p| p.as_object())
        {
            for (field, schema) in properties {
                let Some(value) = object.get(field) else { continue };
                let Some(expected) = schema.get("type").and_then(|t| t.as_str()) else {
                    continue;
                };
                let matches = match expected {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    "null" => value.is_null(),
                    _ => true,
                };
                if !matches {
                    return Err(FlowError::InvalidInput(format!(
                        "field '{field}' must be of type {expected}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// What the external server sends into the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, Value>>,
}

impl AgentRequest {
    /// A plain-text request: `{"message": text}`.
    pub fn message(agent_id: &str, text: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id: None,
            user_id: None,
            input: json!({"message": text}),
            context: None,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// The `message` field, when present.
    pub fn text(&self) -> Option<&str> {
        self.input.get("message").and_then(|v| v.as_str())
    }
}

/// Wall-clock accounting for one request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Durations {
    pub total_ms: u64,
}

/// Non-streaming response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: String,
    pub thread_id: String,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub usage: Usage,
    pub durations: Durations,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> AgentDefinition {
        AgentDefinition::for_config(&AgentConfig::new("a", AgentKind::Chat))
    }

    #[test]
    fn test_valid_input_accepted() {
        definition().validate_input(&json!({"message": "hi"})).unwrap();
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = definition().validate_input(&json!({})).unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput(msg) if msg.contains("message")));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = definition().validate_input(&json!({"message": 42})).unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput(msg) if msg.contains("string")));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = definition().validate_input(&json!("just a string")).unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput(_)));
    }

    #[test]
    fn test_request_text() {
        let request = AgentRequest::message("helper", "hello");
        assert_eq!(request.text(), Some("hello"));
    }
}
