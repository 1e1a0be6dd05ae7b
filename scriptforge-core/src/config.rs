//! Environment-driven settings.
//!
//! Everything scriptforge needs to know about the outside world comes from
//! environment variables: API keys, the model to use, where the generator
//! MCP server lives and how to talk to the PBS queue. CLI flags override a
//! few of these after loading.

use crate::pbs::PbsSettings;
use crate::provider::{AnthropicProvider, AnyProvider, OpenAIProvider, ProviderConfig};
use scriptforge_error::{Error, ErrorKind, Result};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// Which backend a model name is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            ProviderKind::Anthropic
        } else {
            ProviderKind::OpenAI
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// `GENERATOR_MCP_SERVER`
    pub mcp_server: Option<String>,
    pub pbs: PbsSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let openai_api_key = get("OPENAI_API_KEY");
        let anthropic_api_key = get("ANTHROPIC_API_KEY");
        let model = get("LLM_MODEL").unwrap_or_else(|| {
            default_model(openai_api_key.is_some(), anthropic_api_key.is_some()).to_string()
        });

        Ok(Self {
            model,
            openai_api_key,
            openai_base_url: get("OPENAI_BASE_URL"),
            anthropic_api_key,
            mcp_server: get("GENERATOR_MCP_SERVER"),
            pbs: PbsSettings::from_lookup(&get)?,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.openai_base_url = Some(base_url.into());
        self
    }

    pub fn provider_kind(&self) -> ProviderKind {
        ProviderKind::for_model(&self.model)
    }

    /// Human-readable label for the configured model, tagged with where it
    /// is served from.
    pub fn model_label(&self) -> String {
        if self.provider_kind() == ProviderKind::Anthropic {
            return format!("{} (Anthropic)", self.model);
        }
        let base = self.openai_base_url.as_deref().unwrap_or("");
        let source = if base.contains("metis") {
            "metis"
        } else if base.contains("sophia") {
            "sophia"
        } else if base.to_lowercase().contains("alcf") {
            "alcf"
        } else if !base.is_empty() {
            "custom"
        } else {
            "OpenAI"
        };
        format!("{} ({})", self.model, source)
    }

    /// Build the provider for the configured model.
    pub fn provider(&self) -> Result<AnyProvider> {
        match self.provider_kind() {
            ProviderKind::Anthropic => {
                let key = self.anthropic_api_key.clone().ok_or_else(|| {
                    Error::new(
                        ErrorKind::ProviderUnavailable,
                        "ANTHROPIC_API_KEY not set. Required for Claude models.",
                    )
                    .permanent()
                    .with_operation("settings::provider")
                })?;
                let config = ProviderConfig::anthropic(key).with_model(&self.model);
                Ok(AnyProvider::Anthropic(AnthropicProvider::new(config)?))
            }
            ProviderKind::OpenAI => Ok(AnyProvider::OpenAI(OpenAIProvider::new(
                self.openai_config(&self.model),
            )?)),
        }
    }

    /// Every provider we hold a key for, used for model listing.
    pub fn configured_providers(&self) -> Result<Vec<AnyProvider>> {
        let mut providers = Vec::new();
        if self.openai_api_key.is_some() {
            providers.push(AnyProvider::OpenAI(OpenAIProvider::new(
                self.openai_config(DEFAULT_OPENAI_MODEL),
            )?));
        }
        if let Some(key) = &self.anthropic_api_key {
            providers.push(AnyProvider::Anthropic(AnthropicProvider::new(
                ProviderConfig::anthropic(key.clone()),
            )?));
        }
        Ok(providers)
    }

    fn openai_config(&self, model: &str) -> ProviderConfig {
        let mut config =
            ProviderConfig::openai(self.openai_api_key.clone().unwrap_or_default()).with_model(model);
        if let Some(base) = &self.openai_base_url {
            config = config.with_base_url(base.clone());
        }
        config
    }
}

/// Pick the default model from which API keys are available.
pub fn default_model(has_openai_key: bool, has_anthropic_key: bool) -> &'static str {
    if has_openai_key || !has_anthropic_key {
        DEFAULT_OPENAI_MODEL
    } else {
        DEFAULT_ANTHROPIC_MODEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_model_choice() {
        assert_eq!(default_model(true, true), DEFAULT_OPENAI_MODEL);
        assert_eq!(default_model(false, false), DEFAULT_OPENAI_MODEL);
        assert_eq!(default_model(false, true), DEFAULT_ANTHROPIC_MODEL);
    }

    #[test]
    fn test_llm_model_overrides_default() {
        let settings = Settings::from_lookup(lookup(&[
            ("LLM_MODEL", "gpt-4o"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
        ]))
        .unwrap();
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.provider_kind(), ProviderKind::OpenAI);
    }

    #[test]
    fn test_anthropic_only_selects_claude() {
        let settings = Settings::from_lookup(lookup(&[("ANTHROPIC_API_KEY", "sk-ant")])).unwrap();
        assert_eq!(settings.model, DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(settings.model_label(), "claude-sonnet-4-20250514 (Anthropic)");
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings = Settings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", ""),
            ("GENERATOR_MCP_SERVER", "  "),
        ]))
        .unwrap();
        assert!(settings.openai_api_key.is_none());
        assert!(settings.mcp_server.is_none());
    }

    #[test]
    fn test_model_label_by_base_url() {
        let label = |base: &str| {
            Settings::from_lookup(lookup(&[("OPENAI_BASE_URL", base)]))
                .unwrap()
                .model_label()
        };
        assert_eq!(label("https://inference-api.alcf.anl.gov/resource_server/metis/api/v1"), "gpt-4o-mini (metis)");
        assert_eq!(label("https://x.alcf.anl.gov/sophia/vllm/v1"), "gpt-4o-mini (sophia)");
        assert_eq!(label("https://data.ALCF.gov/v1"), "gpt-4o-mini (alcf)");
        assert_eq!(label("http://localhost:11434/v1"), "gpt-4o-mini (custom)");
        assert_eq!(
            Settings::from_lookup(lookup(&[])).unwrap().model_label(),
            "gpt-4o-mini (OpenAI)"
        );
    }

    #[test]
    fn test_base_url_override_relabels_and_finds_catalog() {
        let settings = Settings::from_lookup(lookup(&[("OPENAI_API_KEY", "tok")]))
            .unwrap()
            .with_model("meta-llama/Llama-3.3-70B-Instruct")
            .with_base_url("https://inference-api.alcf.anl.gov/resource_server/sophia/vllm/v1");
        assert_eq!(settings.model_label(), "meta-llama/Llama-3.3-70B-Instruct (sophia)");

        let config = settings.openai_config(&settings.model);
        assert_eq!(
            config.catalog_url.as_deref(),
            Some("https://inference-api.alcf.anl.gov/resource_server/list-endpoints")
        );
        assert!(Settings::default().openai_config("gpt-4o").catalog_url.is_none());
    }

    #[test]
    fn test_claude_without_key_is_unavailable() {
        let settings = Settings::from_lookup(lookup(&[("LLM_MODEL", "claude-3-5-haiku")])).unwrap();
        let err = settings.provider().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_bad_pbs_value_is_config_error() {
        let err = Settings::from_lookup(lookup(&[("PBS_MAX_NODES", "lots")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("LLM_MODEL", "env-model");
        std::env::set_var("PBS_QUEUE", "prod");
        let settings = Settings::from_env().unwrap();
        std::env::remove_var("LLM_MODEL");
        std::env::remove_var("PBS_QUEUE");

        assert_eq!(settings.model, "env-model");
        assert_eq!(settings.pbs.queue, "prod");
    }
}
