//! Google Gemini `generateContent`.

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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";
const PROVIDER: &str = "gemini";

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

pub struct GeminiClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl GeminiClient {
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

/// Gemini reports no usage for this call; whitespace-separated words of the
/// prompt and the answer stand in for tokens.
fn approximate_tokens(prompt: &str, content: &str) -> u64 {
    format!("{content}{prompt}").split_whitespace().count() as u64
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, AnalysisError> {
        let start = Instant::now();
        let prompt = build_prompt(request)
            .map_err(|e| Self::error(ErrorKind::PromptBuild, format!("failed to build prompt: {e:#}")))?;
        let max_tokens = if request.max_tokens > 0 { request.max_tokens } else { self.config.max_tokens };
        let body = GenerateRequest {
            contents: vec![Content { parts: vec![Part { text: prompt.clone() }] }],
            generation_config: GenerationConfig { max_output_tokens: Some(max_tokens) },
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let mut builder = self.http.post(url).query(&[("key", &self.config.api_key)]).json(&body);
        if request.timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(request.timeout_seconds as u64));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Self::error(ErrorKind::Http, format!("HTTP request failed: {}", e.without_url())))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::error(ErrorKind::Http, format!("HTTP request failed: {}", e.without_url())))?;

        if status != StatusCode::OK {
            let message = match serde_json::from_slice::<GenerateResponse>(&bytes) {
                Ok(GenerateResponse { error: Some(error), .. }) => {
                    format!("Gemini API error: {}", error.message)
                }
                _ => format!("Gemini API error (status {})", status.as_u16()),
            };
            return Err(Self::error(classify_status(status), message));
        }

        let parsed: GenerateResponse = serde_json::from_slice(&bytes).map_err(|e| {
            Self::error(ErrorKind::ResponseParse, format!("failed to parse response: {e}"))
        })?;
        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return Err(Self::error(ErrorKind::EmptyResponse, "no candidates in API response"));
        };
        let Some(part) = candidate.content.parts.into_iter().next() else {
            return Err(Self::error(ErrorKind::EmptyResponse, "no content parts in API response"));
        };

        Ok(AnalysisResponse {
            tokens_used: approximate_tokens(&prompt, &part.text),
            content: part.text,
            provider: PROVIDER,
            timestamp: OffsetDateTime::now_utc(),
            duration: start.elapsed(),
        })
    }

    fn provider_name(&self) -> &'static str { PROVIDER }

    fn validate_config(&self) -> Result<()> { self.config.validate() }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path, query_param},
    };

    use super::*;

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new(ClientConfig {
            api_key: "g-key".into(),
            base_url: server.uri(),
            model: String::new(),
            timeout_seconds: 10,
            max_tokens: 256,
        })
        .unwrap()
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest { prompt: "Explain the failure".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_analyze() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash-lite:generateContent"))
            .and(query_param("key", "g-key"))
            .and(body_json(json!({
                "contents": [{"parts": [{"text": "Explain the failure\n\n"}]}],
                "generationConfig": {"maxOutputTokens": 256},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"parts": [{"text": "Missing dependency"}]},
                    "finishReason": "STOP",
                }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server).analyze(&request()).await.unwrap();
        assert_eq!(response.content, "Missing dependency");
        // "Missing dependencyExplain the failure" has four words
        assert_eq!(response.tokens_used, 4);
        assert_eq!(response.provider, "gemini");
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"error": {"message": "Rate limit exceeded"}})),
            )
            .mount(&server)
            .await;
        let err = client(&server).analyze(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
        assert_eq!(err.kind.as_str(), "rate_limit_exceeded");
        assert!(err.retryable);
        assert_eq!(err.message, "Gemini API error: Rate limit exceeded");
    }

    #[tokio::test]
    async fn test_empty_responses() {
        let cases = [
            (json!({"candidates": []}), "no candidates in API response"),
            (json!({"candidates": [{"content": {"parts": []}}]}), "no content parts in API response"),
        ];
        for (body, message) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
            let err = client(&server).analyze(&request()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::EmptyResponse);
            assert!(!err.retryable);
            assert_eq!(err.message, message);
        }
    }

    #[tokio::test]
    async fn test_unparseable_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let err = client(&server).analyze(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResponseParse);
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable() {
        let server = MockServer::start().await;
        let client = client(&server);
        drop(server);
        let err = client.analyze(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Http);
        assert!(err.retryable);
        assert!(!err.message.contains("g-key"));
    }

    #[test]
    fn test_validate_config() {
        let client = GeminiClient::new(ClientConfig {
            api_key: "k".into(),
            base_url: "ftp://example.com".into(),
            model: String::new(),
            timeout_seconds: 0,
            max_tokens: 0,
        })
        .unwrap();
        assert_eq!(client.provider_name(), "gemini");
        let err = client.validate_config().unwrap_err().to_string();
        assert!(err.starts_with("base URL must use http or https scheme"), "{err}");
    }
}
