//! Runs the configured analysis roles against a failed pipeline run and
//! reports each answer on the pull request.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Result, anyhow, bail};
use forgehook_core::config::AiAnalysisConfig;
use forgehook_forge::{Provider, event::Event};
use serde_json::Value;
use tokio::time::sleep;

use crate::{
    AnalysisRequest, AnalysisResponse, LlmClient,
    common::{AnalysisError, DEFAULT_MAX_TOKENS, DEFAULT_TIMEOUT_SECONDS},
    factory,
};

pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
const PR_COMMENT_OUTPUT: &str = "pr-comment";

#[derive(Debug)]
pub struct AnalysisResult {
    pub role: String,
    pub outcome: Result<AnalysisResponse>,
}

pub fn validate_roles(config: &AiAnalysisConfig) -> Result<()> {
    if config.roles.is_empty() {
        bail!("at least one analysis role is required");
    }
    for (i, role) in config.roles.iter().enumerate() {
        if role.name.is_empty() {
            bail!("role[{i}]: name is required");
        }
        if role.prompt.is_empty() {
            bail!("role[{i}]: prompt is required");
        }
        if role.output != PR_COMMENT_OUTPUT {
            bail!(
                "role[{i}]: invalid output destination '{}' (only '{PR_COMMENT_OUTPUT}' is currently supported)",
                role.output
            );
        }
    }
    Ok(())
}

/// Call `client` up to [`MAX_ATTEMPTS`] times, waiting `delay` between
/// attempts. Only retryable errors are attempted again.
pub async fn analyze_with_retry(
    client: &dyn LlmClient,
    request: &AnalysisRequest,
    delay: Duration,
) -> Result<AnalysisResponse, AnalysisError> {
    let mut attempt = 1;
    loop {
        match client.analyze(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.retryable && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    provider = client.provider_name(),
                    "LLM analysis attempt {attempt}/{MAX_ATTEMPTS} failed: {e}"
                );
                attempt += 1;
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct Analyzer<'a> {
    config: &'a AiAnalysisConfig,
    retry_delay: Duration,
}

impl<'a> Analyzer<'a> {
    pub fn new(config: &'a AiAnalysisConfig) -> Self { Self { config, retry_delay: RETRY_DELAY } }

    /// One result per role, in configuration order. Per-role failures are
    /// reported in the result rather than aborting the others.
    pub async fn analyze(&self, context: &BTreeMap<String, Value>) -> Result<Vec<AnalysisResult>> {
        if !self.config.enabled {
            tracing::debug!("AI analysis is disabled, skipping analysis");
            return Ok(vec![]);
        }
        validate_roles(self.config).map_err(|e| anyhow!("invalid AI analysis configuration: {e}"))?;
        tracing::info!(provider = %self.config.provider, roles = self.config.roles.len(), "Starting LLM analysis");

        let mut results = Vec::with_capacity(self.config.roles.len());
        for role in &self.config.roles {
            let client = match factory::create_client(self.config, role) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(role = %role.name, "Failed to create LLM client: {e:#}");
                    results.push(AnalysisResult { role: role.name.clone(), outcome: Err(e) });
                    continue;
                }
            };
            let request = AnalysisRequest {
                prompt: role.prompt.clone(),
                context: context.clone(),
                max_tokens: if self.config.max_tokens > 0 { self.config.max_tokens } else { DEFAULT_MAX_TOKENS },
                timeout_seconds: if self.config.timeout_seconds > 0 {
                    self.config.timeout_seconds
                } else {
                    DEFAULT_TIMEOUT_SECONDS
                },
            };
            let outcome = analyze_with_retry(client.as_ref(), &request, self.retry_delay).await;
            match &outcome {
                Ok(response) => tracing::info!(
                    role = %role.name,
                    tokens_used = response.tokens_used,
                    duration_ms = response.duration.as_millis() as u64,
                    "LLM analysis completed"
                ),
                Err(e) => tracing::warn!(role = %role.name, "LLM analysis failed after all retries: {e}"),
            }
            results.push(AnalysisResult { role: role.name.clone(), outcome: outcome.map_err(Into::into) });
        }
        Ok(results)
    }
}

/// Hidden tag identifying a role's comment so reruns edit it in place.
pub fn comment_marker(role: &str) -> String { format!("<!-- forgehook-ai-analysis:{role} -->") }

pub fn format_comment(role: &str, response: &AnalysisResponse) -> String {
    format!("### AI analysis: {role}\n\n{}\n\n{}", response.content.trim(), comment_marker(role))
}

/// Post every successful result on the pull request. Returns how many were posted.
pub async fn post_results(provider: &dyn Provider, event: &Event, results: &[AnalysisResult]) -> usize {
    if event.pull_request_number == 0 {
        tracing::debug!("Not a pull request, AI analysis results are not posted");
        return 0;
    }
    let mut posted = 0;
    for result in results {
        let Ok(response) = &result.outcome else {
            continue;
        };
        let marker = comment_marker(&result.role);
        match provider.create_comment(event, &format_comment(&result.role, response), Some(&marker)).await {
            Ok(()) => posted += 1,
            Err(e) => tracing::warn!(role = %result.role, "Failed to post AI analysis: {e:#}"),
        }
    }
    posted
}
