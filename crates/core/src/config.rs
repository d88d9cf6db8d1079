use std::{fmt, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::normalize_repo_url;

pub const DEFAULT_APPLICATION_NAME: &str = "Pipelines as Code CI";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_true")]
    pub remember_ok_to_test: bool,
    #[serde(default = "default_tekton_dir")]
    pub tekton_dir: String,
    #[serde(default = "default_command_prefix")]
    pub gitops_command_prefix: String,
    #[serde(default)]
    pub skip_emoji: bool,
    #[serde(default)]
    pub pipeline_engine: Option<PipelineEngineConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

/// Where run annotations (log URL) get patched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineEngineConfig {
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_annotation_group")]
    pub annotation_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ProviderKind {
    #[serde(rename = "azure-devops")]
    AzureDevOps,
    #[serde(rename = "bitbucket-datacenter")]
    BitbucketDataCenter,
    #[serde(rename = "gitea")]
    Gitea,
    #[serde(rename = "github")]
    GitHub,
}

impl ProviderKind {
    /// Detection order. Gitea also sends `X-GitHub-Event`, so it must be tried first.
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Gitea,
        ProviderKind::GitHub,
        ProviderKind::BitbucketDataCenter,
        ProviderKind::AzureDevOps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::AzureDevOps => "azure-devops",
            ProviderKind::BitbucketDataCenter => "bitbucket-datacenter",
            ProviderKind::Gitea => "gitea",
            ProviderKind::GitHub => "github",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Which revision pipeline manifests are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Source,
    DefaultBranch,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Source => f.write_str("source"),
            Provenance::DefaultBranch => f.write_str("default_branch"),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct RepositoryConfig {
    pub url: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub settings: RepositorySettings,
}

impl fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("url", &self.url)
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("provenance", &self.provenance)
            .field("settings", &self.settings)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositorySettings {
    #[serde(default)]
    pub allowed_teams: Vec<String>,
    #[serde(default)]
    pub ai_analysis: Option<AiAnalysisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAi,
    Gemini,
}

impl fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProviderKind::OpenAi => f.write_str("openai"),
            LlmProviderKind::Gemini => f.write_str("gemini"),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct AiAnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub provider: LlmProviderKind,
    #[serde(default)]
    pub api_url: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default)]
    pub roles: Vec<AnalysisRole>,
}

impl fmt::Debug for AiAnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiAnalysisConfig")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_tokens", &self.max_tokens)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisRole {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_role_output")]
    pub output: String,
}

fn default_application_name() -> String { DEFAULT_APPLICATION_NAME.to_string() }

fn default_true() -> bool { true }

fn default_tekton_dir() -> String { ".tekton".to_string() }

fn default_command_prefix() -> String { "/".to_string() }

fn default_annotation_group() -> String { "pipelinesascode.tekton.dev".to_string() }

fn default_role_output() -> String { "pr-comment".to_string() }

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        let config: Config = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Find the repository entry serving `url`. Trailing slashes, `.git`
    /// suffixes and host case are ignored.
    pub fn find_repository(&self, url: &str) -> Option<&RepositoryConfig> {
        let wanted = normalize_repo_url(url);
        self.repositories.iter().find(|r| normalize_repo_url(&r.url) == wanted)
    }
}
