//! LLM clients used to explain failed pipeline runs.

pub mod analyzer;
pub mod common;
pub mod factory;
pub mod gemini;
pub mod openai;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

pub use crate::common::{AnalysisError, ErrorKind};

#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub prompt: String,
    /// Extra sections appended to the prompt, one per key.
    pub context: BTreeMap<String, Value>,
    pub max_tokens: i64,
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct AnalysisResponse {
    pub content: String,
    pub tokens_used: u64,
    pub provider: &'static str,
    pub timestamp: OffsetDateTime,
    pub duration: Duration,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse, AnalysisError>;

    fn provider_name(&self) -> &'static str;

    fn validate_config(&self) -> anyhow::Result<()>;
}
