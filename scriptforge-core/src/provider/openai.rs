//! Chat Completions API, as served by OpenAI and by compatible endpoints
//! (ALCF inference, vLLM, Ollama).

use super::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub(crate) const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub(crate) const ALCF_API_BASE: &str = "https://inference-api.alcf.anl.gov";
pub(crate) const ALCF_ENDPOINTS_URL: &str = "https://inference-api.alcf.anl.gov/resource_server/list-endpoints";

/// Catalog frameworks must serve this route to be usable for chat.
const CHAT_ROUTE: &str = "/v1/chat/completions";

/// Model ids containing any of these are not chat models.
const NON_CHAT_MARKERS: &[&str] = &["embed", "tts", "whisper", "dall-e", "davinci", "babbage", "moderation"];

pub struct OpenAIProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    /// Bearer auth only when a key is configured; local servers take none.
    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.config.api_key)
        }
    }

    /// Chat models from the ALCF endpoint catalog.
    async fn list_catalog(&self, url: &str) -> Result<Vec<CatalogModel>> {
        let req = self.with_key(self.client.get(url));
        let catalog: EndpointCatalog = fetch_json("alcf", "openai::list_catalog", req)
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::AuthenticationFailed {
                    Error::new(ErrorKind::AuthenticationFailed, "ALCF: auth failed - token may be expired")
                        .permanent()
                        .with_operation("openai::list_catalog")
                } else {
                    err
                }
            })?;

        let mut models = catalog.chat_models();
        models.sort_by_key(CatalogModel::label);
        Ok(models)
    }
}

/// A chat model served by one ALCF cluster framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogModel {
    pub model: String,
    pub cluster: String,
    /// OpenAI-compatible base URL for this cluster and framework
    pub base_url: String,
}

impl CatalogModel {
    pub fn label(&self) -> String {
        format!("{} ({})", self.model, self.cluster)
    }
}

impl LlmProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    fn source_label(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base == OPENAI_BASE_URL {
            return "OpenAI".to_string();
        }
        reqwest::Url::parse(base)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| base.to_string())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request.model.clone().unwrap_or_else(|| self.config.model.clone());
        let body = WireRequest::build(&model, request);

        let req = self.client.post(self.config.endpoint("chat/completions")).json(&body);
        let reply: WireResponse = fetch_json("openai", "openai::complete", self.with_key(req))
            .await
            .map_err(|e| e.with_context("model", model.clone()))?;

        let choice = reply.choices.into_iter().next().ok_or_else(|| {
            Error::inference_failed("no choices in response").with_operation("openai::complete")
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(CompletionResponse {
            id: reply.id,
            model: if reply.model.is_empty() { model } else { reply.model },
            content: choice.message.content,
            tool_calls,
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
            usage: reply
                .usage
                .map(|u| Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        if let Some(url) = &self.config.catalog_url {
            let mut models: Vec<String> =
                self.list_catalog(url).await?.into_iter().map(|m| m.model).collect();
            models.sort();
            models.dedup();
            return Ok(models);
        }

        let req = self.client.get(self.config.endpoint("models"));
        let listing: ModelList = fetch_json("openai", "openai::list_models", self.with_key(req)).await?;

        let mut models: Vec<String> = listing
            .data
            .into_iter()
            .map(|m| m.id)
            .filter(|id| is_chat_model(id))
            .collect();
        models.sort();
        Ok(models)
    }

    async fn list_choices(&self) -> Result<Vec<ModelChoice>> {
        let Some(url) = &self.config.catalog_url else {
            let source = self.source_label();
            let models = self.list_models().await?;
            return Ok(models
                .into_iter()
                .map(|model| ModelChoice {
                    label: format!("{} ({})", model, source),
                    model,
                    provider: self.name().to_string(),
                    base_url: None,
                })
                .collect());
        };

        let models = self.list_catalog(url).await?;
        Ok(models
            .into_iter()
            .map(|entry| ModelChoice {
                label: entry.label(),
                model: entry.model,
                provider: self.name().to_string(),
                base_url: Some(entry.base_url),
            })
            .collect())
    }
}

fn finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn is_chat_model(id: &str) -> bool {
    let id = id.to_lowercase();
    !NON_CHAT_MARKERS.iter().any(|marker| id.contains(marker))
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

impl WireRequest {
    fn build(model: &str, request: CompletionRequest) -> Self {
        Self {
            model: model.to_string(),
            messages: request.messages.into_iter().map(WireMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request
                .tools
                .into_iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.parameters,
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<ChatMessage> for WireMessage {
    fn from(msg: ChatMessage) -> Self {
        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|call| WireToolCall {
                    id: call.id,
                    kind: "function".into(),
                    function: WireCall {
                        name: call.name,
                        arguments: call.arguments,
                    },
                })
                .collect()
        });
        Self {
            role: msg.role,
            content: msg.content,
            tool_calls,
            tool_call_id: msg.tool_call_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    function: WireCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EndpointCatalog {
    #[serde(default)]
    clusters: BTreeMap<String, CatalogCluster>,
}

#[derive(Debug, Deserialize)]
struct CatalogCluster {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    frameworks: BTreeMap<String, CatalogFramework>,
}

#[derive(Debug, Deserialize)]
struct CatalogFramework {
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    models: Vec<String>,
}

impl EndpointCatalog {
    fn chat_models(&self) -> Vec<CatalogModel> {
        let mut found = Vec::new();
        for (cluster, info) in &self.clusters {
            for (framework, fw) in &info.frameworks {
                if !fw.endpoints.iter().any(|e| e == CHAT_ROUTE) {
                    continue;
                }
                let base_url = format!("{}{}/{}/v1", ALCF_API_BASE, info.base_url, framework);
                for model in &fw.models {
                    let lower = model.to_lowercase();
                    if lower.contains("embed") || lower.contains("genslm") {
                        continue;
                    }
                    found.push(CatalogModel {
                        model: model.clone(),
                        cluster: cluster.clone(),
                        base_url: base_url.clone(),
                    });
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn completions(
        State(seen): State<Seen>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let wants_tool = body.get("tools").is_some();
        seen.lock().unwrap().push(body);
        if wants_tool {
            Json(serde_json::json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "CreateLibEnsembleScripts", "arguments": "{\"num_workers\":4}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }))
        } else {
            Json(serde_json::json!({
                "id": "chatcmpl-2",
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }]
            }))
        }
    }

    async fn models() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "data": [
                {"id": "gpt-4o"},
                {"id": "text-embedding-3-small"},
                {"id": "whisper-1"},
                {"id": "gpt-4o-mini"},
                {"id": "dall-e-3"}
            ]
        }))
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    async fn fake_openai() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route("/v1/chat/completions", post(completions))
            .route("/v1/models", get(models))
            .with_state(seen.clone());
        (serve(router).await, seen)
    }

    #[tokio::test]
    async fn test_plain_completion() {
        let (base, seen) = fake_openai().await;
        let provider = OpenAIProvider::new(ProviderConfig::local(base, "gpt-4o-mini")).unwrap();

        let text = provider.prompt("say hello").await.unwrap();
        assert_eq!(text, "hello");

        let body = seen.lock().unwrap()[0].clone();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_tool_call_completion() {
        let (base, seen) = fake_openai().await;
        let provider = OpenAIProvider::new(ProviderConfig::local(base, "gpt-4o-mini")).unwrap();

        let request = CompletionRequest::new(vec![ChatMessage::user("make scripts")])
            .with_tools(vec![ToolDefinition::new("CreateLibEnsembleScripts", "generate")]);
        let response = provider.complete(request).await.unwrap();

        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "CreateLibEnsembleScripts");
        assert_eq!(response.usage.total(), 15);

        let body = seen.lock().unwrap()[0].clone();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "CreateLibEnsembleScripts");
    }

    #[tokio::test]
    async fn test_list_models_filters_non_chat() {
        let (base, _) = fake_openai().await;
        let provider = OpenAIProvider::new(ProviderConfig::local(base, "gpt-4o-mini")).unwrap();

        let models = provider.list_models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);
        assert_eq!(provider.source_label(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_auth_failure_maps_to_error_kind() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::FORBIDDEN, "expired") }),
        );
        let base = serve(router).await;
        let provider = OpenAIProvider::new(ProviderConfig::openai("sk-old").with_base_url(base)).unwrap();

        let err = provider.check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(describe_check_failure(&err, "gpt-4o-mini", false).contains("Token likely expired"));
    }

    async fn endpoint_catalog() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "clusters": {
                "sophia": {
                    "base_url": "/resource_server/sophia",
                    "frameworks": {
                        "vllm": {
                            "endpoints": ["/v1/chat/completions", "/v1/completions"],
                            "models": ["meta-llama/Llama-3.3-70B-Instruct", "mistralai/Mistral-Large", "nvidia/NV-Embed-v2"]
                        },
                        "infinity": {
                            "endpoints": ["/v1/embeddings"],
                            "models": ["BAAI/bge-large"]
                        }
                    }
                },
                "polaris": {
                    "base_url": "/resource_server/polaris",
                    "frameworks": {
                        "vllm": {
                            "endpoints": ["/v1/chat/completions"],
                            "models": ["genslm-25M", "Qwen/Qwen2.5-7B-Instruct"]
                        }
                    }
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_list_models_reads_alcf_catalog() {
        let seen_auth: Arc<Mutex<Option<String>>> = Arc::default();
        let router = Router::new()
            .route(
                "/resource_server/list-endpoints",
                get(|State(seen): State<Arc<Mutex<Option<String>>>>, headers: axum::http::HeaderMap| async move {
                    *seen.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    endpoint_catalog().await
                }),
            )
            .with_state(seen_auth.clone());
        let base = serve(router).await;
        let catalog = base.replace("/v1", "/resource_server/list-endpoints");
        let config = ProviderConfig::openai("alcf-token")
            .with_base_url(format!("{}/unused", base))
            .with_catalog_url(catalog);
        let provider = OpenAIProvider::new(config).unwrap();

        let models = provider.list_models().await.unwrap();
        assert_eq!(
            models,
            vec![
                "Qwen/Qwen2.5-7B-Instruct".to_string(),
                "meta-llama/Llama-3.3-70B-Instruct".to_string(),
                "mistralai/Mistral-Large".to_string(),
            ]
        );
        assert_eq!(seen_auth.lock().unwrap().as_deref(), Some("Bearer alcf-token"));

        let choices = provider.list_choices().await.unwrap();
        let labels: Vec<&str> = choices.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "Qwen/Qwen2.5-7B-Instruct (polaris)",
                "meta-llama/Llama-3.3-70B-Instruct (sophia)",
                "mistralai/Mistral-Large (sophia)",
            ]
        );
        assert_eq!(
            choices[0].base_url.as_deref(),
            Some("https://inference-api.alcf.anl.gov/resource_server/polaris/vllm/v1")
        );
    }

    #[tokio::test]
    async fn test_alcf_catalog_auth_failure() {
        let router = Router::new().route(
            "/resource_server/list-endpoints",
            get(|| async { (StatusCode::UNAUTHORIZED, "token expired") }),
        );
        let base = serve(router).await;
        let config = ProviderConfig::openai("stale")
            .with_catalog_url(base.replace("/v1", "/resource_server/list-endpoints"));
        let provider = OpenAIProvider::new(config).unwrap();

        let err = provider.list_models().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.to_string().contains("ALCF: auth failed"));
        assert!(err.to_string().contains("token may be expired"));
    }

    #[test]
    fn test_catalog_cluster_base_urls() {
        let catalog: EndpointCatalog = serde_json::from_value(serde_json::json!({
            "clusters": {"sophia": {"base_url": "/resource_server/sophia", "frameworks": {
                "vllm": {"endpoints": ["/v1/chat/completions"], "models": ["m1"]}
            }}}
        }))
        .unwrap();
        let models = catalog.chat_models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].base_url, "https://inference-api.alcf.anl.gov/resource_server/sophia/vllm/v1");
        assert_eq!(models[0].label(), "m1 (sophia)");
    }

    #[test]
    fn test_alcf_base_url_selects_catalog() {
        let config = ProviderConfig::openai("tok")
            .with_base_url("https://inference-api.alcf.anl.gov/resource_server/metis/api/v1");
        assert_eq!(config.catalog_url.as_deref(), Some(ALCF_ENDPOINTS_URL));
        assert!(ProviderConfig::openai("tok")
            .with_base_url("http://localhost:8000/v1")
            .catalog_url
            .is_none());
    }

    #[test]
    fn test_default_source_label() {
        let provider = OpenAIProvider::new(ProviderConfig::openai("sk")).unwrap();
        assert_eq!(provider.source_label(), "OpenAI");
        assert_eq!(provider.default_model(), "gpt-4o-mini");
    }

    #[test]
    fn test_is_chat_model() {
        assert!(is_chat_model("gpt-4o"));
        assert!(is_chat_model("meta-llama/Llama-3.3-70B-Instruct"));
        assert!(!is_chat_model("text-embedding-ada-002"));
        assert!(!is_chat_model("omni-moderation-latest"));
    }
}
