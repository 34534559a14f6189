//! The collaborator interface abstracting any LLM provider.

use crate::error::Result;
use crate::message::{Message, ToolCall};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// Stream of completion deltas.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

/// Any chat-completion provider the engine can drive.
///
/// The core never assumes a particular vendor; adapters live outside the
/// workspace and only need to speak JSON-serialisable messages with roles
/// system/user/assistant/tool.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Provider identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Run one completion to the end.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse>;

    /// Stream deltas. The default wraps [`Completer::complete`] and emits the
    /// whole answer as a single token followed by the final response.
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream> {
        let response = self.complete(req).await?;
        let token = response.message().map(|m| m.content.clone()).unwrap_or_default();
        let chunks = vec![
            Ok(CompletionChunk::Token(token)),
            Ok(CompletionChunk::Final(response)),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Schema advertised to the model for one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
}

/// One completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other,
}

/// One candidate answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: Message,
    pub finish_reason: FinishReason,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate another usage report into this one.
    pub fn absorb(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Full completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl CompletionResponse {
    /// Single-choice convenience constructor.
    pub fn of(message: Message, finish_reason: FinishReason) -> Self {
        Self { choices: vec![Choice { message, finish_reason }], usage: Usage::default() }
    }

    /// First choice's message, if any.
    pub fn message(&self) -> Option<&Message> {
        self.choices.first().map(|c| &c.message)
    }
}

/// Incremental output from a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionChunk {
    /// A text fragment.
    Token(String),
    /// A fully-assembled tool call.
    ToolCall(ToolCall),
    /// The terminal chunk carrying the complete response.
    Final(CompletionResponse),
}
