//! # graphflow-agent
//!
//! Prebuilt agent templates, multi-agent coordination and the registry the
//! external surface consumes.
//!
//! ## Templates
//!
//! - **Chat** - one completion over the conversation history
//! - **ReAct** - plan / act / observe with tools; the only cyclic template,
//!   bounded by `max_iterations`
//! - **Tool** - a single completion with forced tool execution
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use graphflow_agent::{Agent, AgentConfig, AgentKind, AgentRequest};
//!
//! let agent = Agent::builder(
//!     AgentConfig::new("assistant", AgentKind::React)
//!         .with_model("my-model")
//!         .with_system_prompt("You are terse.")
//!         .with_max_iterations(3),
//!     completer,
//! )
//! .with_tool(calculator)
//! .build()?;
//!
//! let response = agent.execute(AgentRequest::message("assistant", "2+2?")).await?;
//! ```
//!
//! Agents compose through [`Coordinator`] (pipeline, swarm, supervisor) and
//! are exposed by name through [`Registry`].

pub mod agent;
pub mod chat;
pub mod config;
pub mod coordinator;
pub mod definition;
pub mod events;
pub mod prompt;
pub mod react;
pub mod registry;
pub mod tool_agent;

pub use agent::{Agent, AgentBuilder};
pub use config::{AgentConfig, AgentKind};
pub use coordinator::{AgentNode, CoordinationPattern, Coordinator};
pub use definition::{AgentDefinition, AgentRequest, AgentResponse, Durations};
pub use events::{AgentEvent, AgentEventStream};
pub use prompt::MESSAGES_KEY;
pub use react::{ITERATION_META_KEY, TOOL_CALLS_KEY, TOOL_RESULTS_KEY};
pub use registry::Registry;
