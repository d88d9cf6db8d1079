//! OpenAI chat completions.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    AnalysisRequest, AnalysisResponse, LlmClient,
    common::{AnalysisError, ClientConfig, ErrorKind, build_prompt, classify_status},
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-5-mini";
const PROVIDER: &str = "openai";

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

pub struct OpenAiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            config.base_url = DEFAULT_BASE_URL.to_string();
        }
        if config.model.is_empty() {
            config.model = DEFAULT_MODEL.to_string();
        }
        let config = config.with_defaults();
        let http = config.http_client()?;
        Ok(Self { config, http })
    }

    fn error(kind: ErrorKind, message: impl Into<String>) -> AnalysisError {
        AnalysisError::new(PROVIDER, kind, message)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, AnalysisError> {
        let start = Instant::now();
        let prompt = build_prompt(request)
            .map_err(|e| Self::error(ErrorKind::PromptBuild, format!("failed to build prompt: {e:#}")))?;
        let max_tokens = if request.max_tokens > 0 { request.max_tokens } else { self.config.max_tokens };
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![Message { role: "user", content: &prompt }],
            max_tokens: Some(max_tokens),
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.http.post(url).bearer_auth(&self.config.api_key).json(&body);
        if request.timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(request.timeout_seconds as u64));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Self::error(ErrorKind::Http, format!("HTTP request failed: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::error(ErrorKind::Http, format!("HTTP request failed: {e}")))?;

        if status != StatusCode::OK {
            let message = match serde_json::from_slice::<ErrorResponse>(&bytes) {
                Ok(body) => format!("OpenAI API error: {}", body.error.message),
                Err(_) => format!("OpenAI API error (status {})", status.as_u16()),
            };
            return Err(Self::error(classify_status(status), message));
        }

        let parsed: ChatResponse = serde_json::from_slice(&bytes).map_err(|e| {
            Self::error(ErrorKind::ResponseParse, format!("failed to parse response: {e}"))
        })?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(Self::error(ErrorKind::EmptyResponse, "no choices in API response"));
        };

        Ok(AnalysisResponse {
            content: choice.message.content.unwrap_or_default(),
            tokens_used: parsed.usage.total_tokens,
            provider: PROVIDER,
            timestamp: OffsetDateTime::now_utc(),
            duration: start.elapsed(),
        })
    }

    fn provider_name(&self) -> &'static str { PROVIDER }

    fn validate_config(&self) -> Result<()> { self.config.validate() }
}
