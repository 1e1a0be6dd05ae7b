//! Chat-completion backends used by the generator agent.
//!
//! Everything the agent needs from a model goes through [`LlmProvider`]:
//! one completion round with tools attached, model listing for `models`,
//! and a one-token request for `check`. Two wire formats are spoken:
//! OpenAI-compatible endpoints (OpenAI itself, ALCF inference, vLLM) and
//! the Anthropic Messages API. [`AnyProvider`] picks between them at runtime.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;

use scriptforge_error::{Error, ErrorKind, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of a conversation. Assistant turns may carry tool calls instead
/// of text; tool turns answer a call by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content,
            tool_calls: Some(tool_calls),
            ..Self::text(Role::Assistant, "")
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::text(Role::Tool, content)
        }
    }
}

/// A tool advertised to the model, with its JSON Schema input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// A tool that takes no arguments until `with_parameters` says otherwise.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    pub fn with_parameters(self, parameters: serde_json::Value) -> Self {
        Self { parameters, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON text exactly as the model wrote it
    pub arguments: String,
}

impl ToolCall {
    /// Decode the arguments. Models sometimes send an empty string for a
    /// call without arguments; that reads as `{}`.
    pub fn parse_arguments<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match self.arguments.trim() {
            "" => "{}",
            raw => raw,
        };
        serde_json::from_str(raw).map_err(|e| {
            Error::parse_failed(format!("invalid tool arguments: {}", e))
                .with_operation("tool_call::parse_arguments")
                .with_context("tool", self.name.clone())
                .set_source(e)
        })
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Falls back to the provider's default model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    /// Empty means the request goes out without tools
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..self
        }
    }

    pub fn with_temperature(self, temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..self
        }
    }

    pub fn with_max_tokens(self, max_tokens: usize) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..self
        }
    }

    pub fn with_tools(self, tools: Vec<ToolDefinition>) -> Self {
        Self { tools, ..self }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }

    fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

// ============================================================================
// Provider trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait LlmProvider: Send + Sync {
    /// `openai` or `anthropic`
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    /// Shown next to each model in listings: "OpenAI", "Anthropic", or the
    /// host of a custom endpoint
    fn source_label(&self) -> String;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    async fn list_models(&self) -> Result<Vec<String>>;

    /// Models ready for a picker, labelled with where each one is served.
    async fn list_choices(&self) -> Result<Vec<ModelChoice>> {
        let source = self.source_label();
        let models = self.list_models().await?;
        Ok(models
            .into_iter()
            .map(|model| ModelChoice {
                label: format!("{} ({})", model, source),
                model,
                provider: self.name().to_string(),
                base_url: None,
            })
            .collect())
    }

    /// Single user turn, no tools; returns the reply text.
    async fn prompt(&self, prompt: &str) -> Result<String> {
        let response = self
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)]))
            .await?;
        response
            .content
            .ok_or_else(|| Error::inference_failed("empty reply").with_operation("provider::prompt"))
    }

    /// One-token round trip to confirm the key and model work
    async fn check(&self) -> Result<()> {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]).with_max_tokens(1);
        self.complete(request).await.map(|_| ())
    }
}

/// Turn a failed `check` into the hint shown to the user.
pub fn describe_check_failure(err: &Error, model: &str, anthropic: bool) -> String {
    match (err.kind(), anthropic) {
        (ErrorKind::AuthenticationFailed, true) => {
            "Anthropic auth failed. Check ANTHROPIC_API_KEY.".to_string()
        }
        (ErrorKind::AuthenticationFailed, false) if err.context_value("status") == Some("403") => {
            "API auth failed. Token likely expired.\n\n\
             python3 inference_auth_token.py authenticate --force\n\
             export OPENAI_API_KEY=$(python inference_auth_token.py get_access_token)\n\n\
             Then restart."
                .to_string()
        }
        (ErrorKind::AuthenticationFailed, false) => {
            format!("Invalid API key for {}. Check OPENAI_API_KEY.", model)
        }
        (ErrorKind::ProviderUnavailable, _) => err.message().to_string(),
        (_, true) => format!("Anthropic API check failed ({}): {}", model, err.message()),
        (_, false) => format!("API check failed ({}): {}", model, err.message()),
    }
}

/// Map a non-success HTTP status to a workspace error.
pub(crate) fn http_error(provider: &'static str, status: u16, body: String) -> Error {
    let err = match status {
        401 | 403 => Error::new(ErrorKind::AuthenticationFailed, format!("{} authentication failed", provider)),
        429 => Error::new(ErrorKind::RateLimited, "rate limited"),
        _ => Error::inference_failed(format!("API error ({}): {}", status, body)),
    };
    err.with_context("provider", provider)
        .with_context("status", status.to_string())
}

/// Send `request` and decode a 2xx JSON body; anything else goes through
/// [`http_error`].
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    provider: &'static str,
    operation: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request.send().await.map_err(|e| {
        Error::network_failed(e.to_string())
            .with_operation(operation)
            .set_source(e)
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(http_error(provider, status.as_u16(), body).with_operation(operation));
    }

    response.json().await.map_err(|e| {
        Error::parse_failed(format!("unexpected response body: {}", e))
            .with_operation(operation)
            .set_source(e)
    })
}

// ============================================================================
// Dispatch over configured providers
// ============================================================================

/// The provider chosen at runtime from `Settings`
pub enum AnyProvider {
    OpenAI(OpenAIProvider),
    Anthropic(AnthropicProvider),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            AnyProvider::OpenAI($p) => $call,
            AnyProvider::Anthropic($p) => $call,
        }
    };
}

impl LlmProvider for AnyProvider {
    fn name(&self) -> &str {
        dispatch!(self, p => p.name())
    }

    fn default_model(&self) -> &str {
        dispatch!(self, p => p.default_model())
    }

    fn source_label(&self) -> String {
        dispatch!(self, p => p.source_label())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        dispatch!(self, p => p.complete(request).await)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        dispatch!(self, p => p.list_models().await)
    }

    async fn list_choices(&self) -> Result<Vec<ModelChoice>> {
        dispatch!(self, p => p.list_choices().await)
    }
}

/// A model offered by one of the configured providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub label: String,
    pub model: String,
    pub provider: String,
    /// Set when the model lives on a different base URL than the provider's
    pub base_url: Option<String>,
}

/// Collect models from every provider. Errors from individual providers are
/// only fatal when nothing at all could be listed.
pub async fn collect_models(providers: &[AnyProvider]) -> Result<(Vec<ModelChoice>, Vec<String>)> {
    if providers.is_empty() {
        return Err(Error::new(
            ErrorKind::ProviderUnavailable,
            "No API keys set (OPENAI_API_KEY or ANTHROPIC_API_KEY)",
        )
        .with_operation("provider::collect_models"));
    }

    let mut choices = Vec::new();
    let mut errors = Vec::new();
    for provider in providers {
        match provider.list_choices().await {
            Ok(found) => choices.extend(found),
            Err(e) => errors.push(format!("{}: {}", provider.source_label(), e.message())),
        }
    }

    if choices.is_empty() && !errors.is_empty() {
        return Err(Error::new(ErrorKind::ProviderUnavailable, errors.join("; "))
            .with_operation("provider::collect_models"));
    }
    choices.sort_by(|a, b| a.label.cmp(&b.label));
    Ok((choices, errors))
}

// ============================================================================
// Endpoint configuration
// ============================================================================

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a provider sends requests and with which credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Empty for endpoints that take no key
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    /// Endpoint catalog listing models per cluster; set for ALCF bases
    pub catalog_url: Option<String>,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: openai::OPENAI_BASE_URL.to_string(),
            model: crate::config::DEFAULT_OPENAI_MODEL.to_string(),
            timeout: REQUEST_TIMEOUT,
            catalog_url: None,
        }
    }

    pub fn anthropic(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: anthropic::ANTHROPIC_BASE_URL.to_string(),
            model: crate::config::DEFAULT_ANTHROPIC_MODEL.to_string(),
            timeout: REQUEST_TIMEOUT,
            catalog_url: None,
        }
    }

    /// A keyless OpenAI-compatible server such as vLLM.
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: String::new(),
            base_url: base_url.into(),
            model: model.into(),
            timeout: REQUEST_TIMEOUT * 2,
            catalog_url: None,
        }
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self
        }
    }

    /// ALCF bases also pick up the cluster endpoint catalog.
    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let catalog_url = if base_url.to_lowercase().contains("alcf") {
            Some(openai::ALCF_ENDPOINTS_URL.to_string())
        } else {
            self.catalog_url
        };
        Self {
            base_url,
            catalog_url,
            ..self
        }
    }

    pub fn with_catalog_url(self, url: impl Into<String>) -> Self {
        Self {
            catalog_url: Some(url.into()),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub(crate) fn build_client(config: &ProviderConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| {
            Error::new(ErrorKind::ProviderUnavailable, "failed to create HTTP client")
                .with_operation("provider::build_client")
                .set_source(e)
        })
}

// ============================================================================
// Usage accounting
// ============================================================================

/// Token counts for a whole session, overall and per model.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    pub total_calls: usize,
    pub totals: Usage,
    pub by_model: BTreeMap<String, Usage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, model: &str, usage: &Usage) {
        self.total_calls += 1;
        self.totals.add(usage);
        self.by_model.entry(model.to_string()).or_default().add(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_turns() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "CreateLibEnsembleScripts".into(),
            arguments: "{}".into(),
        };
        let request = ChatMessage::assistant_tool_calls(None, vec![call]);
        assert_eq!(request.role, Role::Assistant);
        assert_eq!(request.content, None);
        assert_eq!(request.tool_calls.as_ref().map(Vec::len), Some(1));

        let answer = ChatMessage::tool_result("call_1", "=== run_libe.py ===");
        assert_eq!(answer.role, Role::Tool);
        assert_eq!(answer.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(answer.content.as_deref(), Some("=== run_libe.py ==="));
    }

    #[test]
    fn test_tool_call_arguments() {
        let call = ToolCall {
            id: "1".into(),
            name: "CreateLibEnsembleScripts".into(),
            arguments: r#"{"num_workers": "4"}"#.into(),
        };
        let args: serde_json::Value = call.parse_arguments().unwrap();
        assert_eq!(args["num_workers"], "4");

        let empty = ToolCall { arguments: "  ".into(), ..call.clone() };
        let args: serde_json::Value = empty.parse_arguments().unwrap();
        assert!(args.as_object().unwrap().is_empty());

        let broken = ToolCall { arguments: "{not json".into(), ..call };
        let err = broken.parse_arguments::<serde_json::Value>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailed);
        assert_eq!(err.context_value("tool"), Some("CreateLibEnsembleScripts"));
    }

    #[test]
    fn test_request_defaults_to_no_tools() {
        let request = CompletionRequest::new(vec![ChatMessage::user("six hump camel")])
            .with_model("gpt-4o")
            .with_temperature(0.0);
        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, None);
        assert!(request.tools.is_empty());
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let config = ProviderConfig::openai("sk-test").with_base_url("http://localhost:8080/v1/");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.endpoint("models"), "http://localhost:8080/v1/models");
        assert_eq!(
            ProviderConfig::anthropic("k").endpoint("messages"),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_http_error_mapping() {
        assert_eq!(http_error("openai", 401, String::new()).kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(http_error("openai", 429, String::new()).kind(), ErrorKind::RateLimited);
        let err = http_error("openai", 500, "boom".into());
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);
        assert_eq!(err.context_value("status"), Some("500"));
    }

    #[test]
    fn test_describe_check_failure() {
        let expired = http_error("openai", 403, String::new());
        assert!(describe_check_failure(&expired, "m", false).contains("Token likely expired"));

        let invalid = http_error("openai", 401, String::new());
        assert_eq!(
            describe_check_failure(&invalid, "gpt-4o", false),
            "Invalid API key for gpt-4o. Check OPENAI_API_KEY."
        );

        let anthropic = http_error("anthropic", 401, String::new());
        assert!(describe_check_failure(&anthropic, "claude", true).contains("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_collect_models_requires_a_provider() {
        let err = collect_models(&[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(err.message().contains("No API keys set"));
    }

    #[test]
    fn test_usage_per_model() {
        let mut tracker = UsageTracker::new();
        let small = Usage { prompt_tokens: 100, completion_tokens: 50 };
        tracker.track("gpt-4o-mini", &small);
        tracker.track("gpt-4o-mini", &small);
        tracker.track("claude-sonnet-4-20250514", &Usage { prompt_tokens: 7, completion_tokens: 3 });

        assert_eq!(tracker.total_calls, 3);
        assert_eq!(tracker.totals.total(), 310);
        assert_eq!(tracker.by_model["gpt-4o-mini"].prompt_tokens, 200);
        assert_eq!(tracker.by_model["claude-sonnet-4-20250514"].total(), 10);
    }
}
