//! # scriptforge-core
//!
//! Building blocks shared by the scriptforge agent, relay and CLI:
//!
//! - [`config`]: environment-driven settings
//! - [`provider`]: hosted model clients (OpenAI-compatible, Anthropic)
//! - [`mcp`]: JSON-RPC client for the script generator tool server
//! - [`bundle`]: the `=== filename ===` multi-file script format
//! - [`prompts`]: prompt templates for review and fixing
//! - [`runner`]: local script execution and output archiving
//! - [`pbs`]: PBS job scripts, submission and polling

pub mod bundle;
pub mod config;
pub mod mcp;
pub mod pbs;
pub mod prompts;
pub mod provider;
pub mod runner;

pub use bundle::{detect_run_script, ScriptBundle, ScriptFile};
pub use config::{ProviderKind, Settings};
pub use mcp::{McpClient, ToolBackend};
pub use provider::{
    AnyProvider, ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, ProviderConfig,
    ToolCall, ToolDefinition, UsageTracker,
};
pub use runner::{LocalRunner, RunFailure, RunOutcome};
