use anyhow::{Context, Result, bail};
use forgehook_core::config::{AiAnalysisConfig, AnalysisRole, LlmProviderKind};

use crate::{
    LlmClient,
    common::{ClientConfig, validate_base_url},
    gemini::{self, GeminiClient},
    openai::{self, OpenAiClient},
};

pub fn default_model(provider: LlmProviderKind) -> &'static str {
    match provider {
        LlmProviderKind::OpenAi => openai::DEFAULT_MODEL,
        LlmProviderKind::Gemini => gemini::DEFAULT_MODEL,
    }
}

pub fn validate(config: &AiAnalysisConfig) -> Result<()> {
    if config.api_key.is_empty() {
        bail!("API key is required");
    }
    if let Some(api_url) = config.api_url.as_deref().filter(|u| !u.is_empty()) {
        validate_base_url(api_url).context("invalid api_url")?;
    }
    if config.timeout_seconds < 0 {
        bail!("timeout seconds must be non-negative");
    }
    if config.max_tokens < 0 {
        bail!("max tokens must be non-negative");
    }
    Ok(())
}

/// Client for one analysis role. The role's model wins over the provider default.
pub fn create_client(config: &AiAnalysisConfig, role: &AnalysisRole) -> Result<Box<dyn LlmClient>> {
    validate(config).context("invalid client configuration")?;
    let client_config = ClientConfig {
        api_key: config.api_key.clone(),
        base_url: config.api_url.clone().unwrap_or_default(),
        model: role
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_model(config.provider).to_string()),
        timeout_seconds: config.timeout_seconds,
        max_tokens: config.max_tokens,
    };
    let client: Box<dyn LlmClient> = match config.provider {
        LlmProviderKind::OpenAi => Box::new(OpenAiClient::new(client_config)?),
        LlmProviderKind::Gemini => Box::new(GeminiClient::new(client_config)?),
    };
    client
        .validate_config()
        .with_context(|| format!("failed to create {} client", config.provider))?;
    Ok(client)
}
