//! Anthropic Messages API.

use super::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub(crate) const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API requires `max_tokens`; used when the request has none
const DEFAULT_MAX_TOKENS: usize = 4096;

pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    fn with_key(&self, req: reqwest::RequestBuilder, operation: &'static str) -> Result<reqwest::RequestBuilder> {
        if self.config.api_key.is_empty() {
            return Err(Error::new(ErrorKind::AuthenticationFailed, "ANTHROPIC_API_KEY not set")
                .permanent()
                .with_operation(operation));
        }
        Ok(req
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION))
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    fn source_label(&self) -> String {
        "Anthropic".to_string()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request.model.clone().unwrap_or_else(|| self.config.model.clone());
        let (system, messages) = split_system(&request.messages);

        let body = MessagesRequest {
            model: model.clone(),
            messages,
            system,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            tools: request
                .tools
                .into_iter()
                .map(|tool| WireTool {
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.parameters,
                })
                .collect(),
        };

        let req = self.client.post(self.config.endpoint("messages")).json(&body);
        let reply: MessagesResponse = fetch_json("anthropic", "anthropic::complete", self.with_key(req, "anthropic::complete")?)
            .await
            .map_err(|e| e.with_context("model", model.clone()))?;

        // tool_use inputs are re-serialized so arguments look the same as
        // on the OpenAI side
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in reply.content {
            match block {
                ReplyBlock::Text { text: chunk } => text.push_str(&chunk),
                ReplyBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ReplyBlock::Other => {}
            }
        }

        let finish_reason = match reply.stop_reason.as_deref() {
            Some("end_turn" | "stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            _ => FinishReason::Unknown,
        };

        Ok(CompletionResponse {
            id: reply.id,
            model: if reply.model.is_empty() { model } else { reply.model },
            content: (!text.is_empty()).then_some(text),
            tool_calls,
            finish_reason,
            usage: Usage {
                prompt_tokens: reply.usage.input_tokens,
                completion_tokens: reply.usage.output_tokens,
            },
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let req = self.client.get(self.config.endpoint("models?limit=100"));
        let listing: ModelList = fetch_json(
            "anthropic",
            "anthropic::list_models",
            self.with_key(req, "anthropic::list_models")?,
        )
        .await?;

        let mut models: Vec<String> = listing.data.into_iter().map(|m| m.id).collect();
        models.sort();
        Ok(models)
    }
}

/// The Messages API takes the system prompt as a separate field and wants
/// consecutive tool results folded into one user turn.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
    let mut system = None;
    let mut out: Vec<WireMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system = msg.content.clone(),
            Role::Tool => {
                let block = WireBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone().unwrap_or_default(),
                };
                match out.last_mut() {
                    Some(WireMessage {
                        role,
                        content: WireContent::Blocks(blocks),
                    }) if *role == "user"
                        && blocks
                            .iter()
                            .all(|b| matches!(b, WireBlock::ToolResult { .. })) =>
                    {
                        blocks.push(block)
                    }
                    _ => out.push(WireMessage {
                        role: "user",
                        content: WireContent::Blocks(vec![block]),
                    }),
                }
            }
            _ => out.push(WireMessage::from(msg.clone())),
        }
    }

    (system, out)
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl From<ChatMessage> for WireMessage {
    fn from(msg: ChatMessage) -> Self {
        let role = match msg.role {
            Role::Assistant => "assistant",
            Role::User | Role::System | Role::Tool => "user",
        };

        let content = match msg.tool_calls {
            Some(calls) if !calls.is_empty() => {
                let mut blocks = Vec::new();
                if let Some(text) = msg.content.filter(|t| !t.is_empty()) {
                    blocks.push(WireBlock::Text { text });
                }
                blocks.extend(calls.into_iter().map(|call| WireBlock::ToolUse {
                    input: serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| serde_json::json!({})),
                    id: call.id,
                    name: call.name,
                }));
                WireContent::Blocks(blocks)
            }
            _ => WireContent::Text(msg.content.unwrap_or_default()),
        };

        Self { role, content }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    content: Vec<ReplyBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ReplyBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: usize,
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}
