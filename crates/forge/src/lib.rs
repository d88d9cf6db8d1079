pub mod authorize;
pub mod azure;
pub mod bitbucket;
pub mod client;
pub mod comments;
pub mod error;
pub mod event;
pub mod gitea;
pub mod github;
pub mod manifest;
pub mod signature;
pub mod status;

use anyhow::{Context, Result};
use async_trait::async_trait;
use forgehook_core::{
    changed_files::ChangedFiles,
    config::{Config, Provenance, ProviderKind, RepositoryConfig},
};
use http::HeaderMap;

use crate::{
    comments::CommentCommands,
    event::Event,
    status::{StatusOpts, StatusSettings},
};

/// Outcome of inspecting a delivery's headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Not sent by this forge.
    NotForge,
    /// This forge, but nothing to do. Carries the reason.
    Skip(String),
    /// This forge and a supported event.
    Process,
}

/// Behaviour knobs shared by every adapter, installed once from [`Config`].
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub status: StatusSettings,
    pub remember_ok_to_test: bool,
    pub commands: CommentCommands,
}

impl ProviderSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let commands = CommentCommands::new(&config.gitops_command_prefix).with_context(|| {
            format!("Invalid gitops command prefix {:?}", config.gitops_command_prefix)
        })?;
        Ok(Self {
            status: StatusSettings {
                application_name: config.application_name.clone(),
                skip_emoji: config.skip_emoji,
            },
            remember_ok_to_test: config.remember_ok_to_test,
            commands,
        })
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            status: StatusSettings {
                application_name: forgehook_core::config::DEFAULT_APPLICATION_NAME.to_string(),
                skip_emoji: false,
            },
            remember_ok_to_test: true,
            commands: CommentCommands::default_prefix().clone(),
        }
    }
}

/// One forge's view of a webhook delivery. An instance serves a single event:
/// `set_client` binds it to the repository, and per-event lookups such as
/// changed files are cached on it.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Classify a delivery without touching the network. An error means the
    /// delivery belongs to this forge but is malformed.
    fn detect(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Detection>;

    fn parse_payload(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Event>;

    /// Check the delivery signature against `event.provider.webhook_secret`.
    fn validate(&self, event: &Event, headers: &HeaderMap, payload: &[u8]) -> Result<()>;

    /// Bind an authenticated API client. Fills `event.provider` from `repo`.
    async fn set_client(&mut self, event: &mut Event, repo: &RepositoryConfig) -> Result<()>;

    /// Resolve commit details and the default branch tip.
    async fn get_commit_info(&self, event: &mut Event) -> Result<()>;

    /// Concatenated YAML under `path`, or an empty string when the path is absent.
    async fn get_tekton_dir(
        &self,
        event: &Event,
        path: &str,
        provenance: Provenance,
    ) -> Result<String>;

    async fn get_file_inside_repo(&self, event: &Event, path: &str, target: &str)
    -> Result<String>;

    /// Files changed by the event, fetched once per provider instance.
    async fn get_files(&self, event: &Event) -> Result<ChangedFiles>;

    async fn create_status(&self, event: &Event, opts: &StatusOpts) -> Result<()>;

    /// Post `body` on the pull request. With a `marker`, forges that support
    /// it edit the first comment containing the marker instead.
    async fn create_comment(&self, event: &Event, body: &str, marker: Option<&str>) -> Result<()>;

    async fn is_allowed(&self, event: &Event) -> Result<bool>;

    async fn is_allowed_owners_file(&self, event: &Event) -> Result<bool>;

    /// Whether the sender belongs to one of `teams`, with a human readable reason.
    async fn check_policy_allowing(&self, event: &Event, teams: &[String]) -> (bool, String);
}

pub fn new_provider(kind: ProviderKind, settings: ProviderSettings) -> Box<dyn Provider> {
    match kind {
        ProviderKind::AzureDevOps => Box::new(azure::AzureDevOps::new(settings)),
        ProviderKind::BitbucketDataCenter => {
            Box::new(bitbucket::BitbucketDataCenter::new(settings))
        }
        ProviderKind::Gitea => Box::new(gitea::Gitea::new(settings)),
        ProviderKind::GitHub => Box::new(github::GitHub::new(settings)),
    }
}

/// Find the forge that sent a delivery. Returns `None` when no forge claims it.
pub fn detect_provider(
    settings: &ProviderSettings,
    headers: &HeaderMap,
    payload: &[u8],
) -> Result<Option<(Box<dyn Provider>, Detection)>> {
    for kind in ProviderKind::ALL {
        let provider = new_provider(kind, settings.clone());
        match provider.detect(headers, payload).with_context(|| format!("{kind} payload"))? {
            Detection::NotForge => continue,
            detection => {
                tracing::debug!("Detected {kind} delivery: {detection:?}");
                return Ok(Some((provider, detection)));
            }
        }
    }
    Ok(None)
}

/// First value of a header as a string, empty when absent.
pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_detect_provider() {
        let settings = ProviderSettings::default();
        let cases: &[(&str, &str, &str, Option<ProviderKind>)] = &[
            ("X-Gitea-Event-Type", "push", r#"{"pusher":{"login":"a"}}"#, Some(ProviderKind::Gitea)),
            ("X-GitHub-Event", "push", r#"{"pusher":{"name":"a"}}"#, Some(ProviderKind::GitHub)),
            (
                "X-Event-Key",
                "repo:refs_changed",
                r#"{"changes":[{"toHash":"abc"}]}"#,
                Some(ProviderKind::BitbucketDataCenter),
            ),
            (
                "X-Azure-DevOps-EventType",
                "git.push",
                r#"{"eventType":"git.push","resource":{}}"#,
                Some(ProviderKind::AzureDevOps),
            ),
            ("X-Unknown", "x", "{}", None),
        ];
        for &(name, value, body, expected) in cases {
            let mut headers = HeaderMap::new();
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
            if name == "X-Event-Key" {
                headers.insert("X-Request-Id", HeaderValue::from_static("1"));
            }
            let detected = detect_provider(&settings, &headers, body.as_bytes()).unwrap();
            assert_eq!(detected.as_ref().map(|(p, _)| p.kind()), expected, "{name}");
            if let Some((_, detection)) = detected {
                assert_eq!(detection, Detection::Process, "{name}");
            }
        }
    }
}
