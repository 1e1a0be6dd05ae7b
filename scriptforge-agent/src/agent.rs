//! Agent implementation - pairs a hosted model with the generator tool

use scriptforge_core::mcp::{sanitize_generator_arguments, ToolBackend};
use scriptforge_core::provider::{
    ChatMessage, CompletionRequest, LlmProvider, Role, UsageTracker,
};
use scriptforge_error::{Error, ErrorKind, Result};
use tracing::{debug, info, warn};

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model override; the provider default is used when unset
    pub model: Option<String>,
    pub temperature: f32,
    /// Upper bound on model turns per invocation
    pub max_rounds: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.0,
            max_rounds: 8,
        }
    }
}

/// Every message exchanged during one invocation, in order
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Output of the first tool call, which is where generated scripts land.
    pub fn tool_output(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .and_then(|m| m.content.as_deref())
    }

    /// The model's last plain-text answer.
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.content.as_deref())
            .filter(|c| !c.is_empty())
    }

    pub fn tool_calls(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::Tool).count()
    }
}

/// The agent orchestrator - runs the model <-> tool loop
pub struct Agent<P, T> {
    provider: P,
    tools: T,
    config: AgentConfig,
    usage: UsageTracker,
}

impl<P, T> Agent<P, T>
where
    P: LlmProvider,
    T: ToolBackend,
{
    pub fn new(provider: P, tools: T) -> Self {
        Self::with_config(provider, tools, AgentConfig::default())
    }

    pub fn with_config(provider: P, tools: T, config: AgentConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            usage: UsageTracker::new(),
        }
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Hand back the tool backend, e.g. to shut down the MCP server.
    pub fn into_tools(self) -> T {
        self.tools
    }

    fn model(&self) -> String {
        self.config
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    /// Send `prompt` with the tools attached and keep executing tool calls
    /// until the model answers in plain text.
    pub async fn invoke(&mut self, prompt: &str) -> Result<Transcript> {
        let model = self.model();
        let tools = self.tools.tools();
        let mut transcript = Transcript {
            messages: vec![ChatMessage::user(prompt)],
        };

        for round in 0..self.config.max_rounds {
            let request = CompletionRequest::new(transcript.messages.clone())
                .with_model(&model)
                .with_temperature(self.config.temperature)
                .with_tools(tools.clone());

            let response = self
                .provider
                .complete(request)
                .await
                .map_err(|e| e.with_operation("agent::invoke"))?;
            self.usage.track(&model, &response.usage);
            debug!(
                "round {}: {:?}, {} tool calls",
                round,
                response.finish_reason,
                response.tool_calls.len()
            );

            if response.tool_calls.is_empty() {
                transcript
                    .messages
                    .push(ChatMessage::assistant(response.content.unwrap_or_default()));
                return Ok(transcript);
            }

            let calls = response.tool_calls;
            transcript
                .messages
                .push(ChatMessage::assistant_tool_calls(response.content, calls.clone()));

            for call in calls {
                info!("calling tool {}", call.name);
                // The only tool offered is the generator
                let output = match call.parse_arguments::<serde_json::Value>() {
                    Ok(args) => self
                        .tools
                        .call(&call.name, sanitize_generator_arguments(args))
                        .await
                        .unwrap_or_else(|e| {
                            warn!("tool {} failed: {}", call.name, e);
                            format!("Error: {}", e.message())
                        }),
                    Err(e) => format!("Error: {}", e.message()),
                };
                transcript
                    .messages
                    .push(ChatMessage::tool_result(call.id, output));
            }
        }

        Err(Error::new(
            ErrorKind::InferenceFailed,
            format!("model kept calling tools after {} rounds", self.config.max_rounds),
        )
        .permanent()
        .with_operation("agent::invoke")
        .with_context("model", model))
    }

    /// Invoke and return the final answer text.
    pub async fn ask(&mut self, prompt: &str) -> Result<String> {
        let transcript = self.invoke(prompt).await?;
        transcript.final_text().map(str::to_string).ok_or_else(|| {
            Error::inference_failed("model returned an empty answer").with_operation("agent::ask")
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider and tool doubles shared by the crate's tests

    use scriptforge_core::mcp::ToolBackend;
    use scriptforge_core::provider::{
        CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCall,
        ToolDefinition, Usage,
    };
    use scriptforge_error::{Error, Result};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub enum Reply {
        Text(String),
        Tool(String),
    }

    pub fn text(s: &str) -> Reply {
        Reply::Text(s.to_string())
    }

    pub fn tool(args: &str) -> Reply {
        Reply::Tool(args.to_string())
    }

    /// Answers requests from a queue and records every request it sees
    #[derive(Default)]
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Reply>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::default(),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| r.messages.first().and_then(|m| m.content.clone()))
                .collect()
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "test-model"
        }

        fn source_label(&self) -> String {
            "test".into()
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            self.requests.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::inference_failed("script exhausted"))?;
            let (content, tool_calls, finish_reason) = match reply {
                Reply::Text(t) => (Some(t), Vec::new(), FinishReason::Stop),
                Reply::Tool(args) => (
                    None,
                    vec![ToolCall {
                        id: "call_1".into(),
                        name: "CreateLibEnsembleScripts".into(),
                        arguments: args,
                    }],
                    FinishReason::ToolCalls,
                ),
            };
            Ok(CompletionResponse {
                id: "resp".into(),
                model: "test-model".into(),
                content,
                tool_calls,
                finish_reason,
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            })
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec!["test-model".into()])
        }
    }

    /// Generator double that returns a fixed bundle
    pub struct FakeGenerator {
        pub output: String,
        pub calls: Vec<serde_json::Value>,
    }

    impl FakeGenerator {
        pub fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                calls: Vec::new(),
            }
        }
    }

    impl ToolBackend for FakeGenerator {
        fn tools(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new("CreateLibEnsembleScripts", "Create libEnsemble scripts")]
        }

        async fn call(&mut self, _name: &str, arguments: serde_json::Value) -> Result<String> {
            self.calls.push(arguments);
            Ok(self.output.clone())
        }
    }
}
