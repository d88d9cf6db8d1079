use std::{fmt, fmt::Write as _, time::Duration};

use anyhow::{Result, anyhow, bail};
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use crate::AnalysisRequest;

pub const DEFAULT_TIMEOUT_SECONDS: i64 = 30;
pub const DEFAULT_MAX_TOKENS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PromptBuild,
    RequestMarshal,
    HttpRequest,
    Http,
    InvalidApiKey,
    RateLimitExceeded,
    ServerError,
    Api,
    ResponseParse,
    EmptyResponse,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PromptBuild => "prompt_build_error",
            ErrorKind::RequestMarshal => "request_marshal_error",
            ErrorKind::HttpRequest => "http_request_error",
            ErrorKind::Http => "http_error",
            ErrorKind::InvalidApiKey => "invalid_api_key",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Api => "api_error",
            ErrorKind::ResponseParse => "response_parse_error",
            ErrorKind::EmptyResponse => "empty_response",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} analysis failed ({kind}): {message}")]
pub struct AnalysisError {
    pub provider: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl AnalysisError {
    pub fn new(provider: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ErrorKind::Http | ErrorKind::RateLimitExceeded | ErrorKind::ServerError
        );
        Self { provider, kind, message: message.into(), retryable }
    }
}

/// Error class of a non-200 answer.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::InvalidApiKey,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
        s if s.is_server_error() => ErrorKind::ServerError,
        _ => ErrorKind::Api,
    }
}

/// Settings shared by every provider client.
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: i64,
    pub max_tokens: i64,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Zero timeout and token limits fall back to the defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.timeout_seconds == 0 {
            self.timeout_seconds = DEFAULT_TIMEOUT_SECONDS;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            bail!("API key is required");
        }
        if self.timeout_seconds < 0 {
            bail!("timeout seconds must be non-negative");
        }
        if self.max_tokens < 0 {
            bail!("max tokens must be non-negative");
        }
        validate_base_url(&self.base_url)
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let timeout = if self.timeout_seconds > 0 { self.timeout_seconds } else { DEFAULT_TIMEOUT_SECONDS };
        Ok(reqwest::Client::builder().timeout(Duration::from_secs(timeout as u64)).build()?)
    }
}

pub fn validate_base_url(base_url: &str) -> Result<()> {
    if base_url.is_empty() {
        bail!("base URL is required");
    }
    if base_url.contains(char::is_whitespace) {
        bail!("invalid base URL: contains whitespace characters");
    }
    let url = match Url::parse(base_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            bail!("base URL must use http or https scheme, got: ")
        }
        Err(e) => bail!("invalid base URL: {e}"),
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("base URL must use http or https scheme, got: {}", url.scheme());
    }
    if url.host_str().is_none_or(str::is_empty) {
        bail!("base URL must have a valid host");
    }
    Ok(())
}

/// Prompt followed by a blank line and one `=== KEY ===` section per
/// context entry.
pub fn build_prompt(request: &AnalysisRequest) -> Result<String> {
    let mut prompt = String::new();
    prompt.push_str(&request.prompt);
    prompt.push_str("\n\n");
    if request.context.is_empty() {
        return Ok(prompt);
    }

    prompt.push_str("Context Information:\n");
    for (key, value) in &request.context {
        writeln!(prompt, "=== {} ===", key.to_uppercase())?;
        match value {
            Value::String(s) => prompt.push_str(s),
            Value::Object(_) | Value::Array(_) => {
                let json = serde_json::to_string_pretty(value)
                    .map_err(|e| anyhow!("failed to marshal context {key}: {e}"))?;
                prompt.push_str(&json);
            }
            other => write!(prompt, "{other}")?,
        }
        prompt.push_str("\n\n");
    }
    Ok(prompt)
}
