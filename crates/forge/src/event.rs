use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{azure, bitbucket, gitea, github};

/// What kind of pipeline trigger an event maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
    PullRequestClosed,
    PullRequestLabeled,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Push => "push",
            TriggerType::PullRequest => "pull_request",
            TriggerType::PullRequestClosed => "pull_request_closed",
            TriggerType::PullRequestLabeled => "pull_request_labeled",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Credentials and endpoint of the forge the event came from.
#[derive(Clone, Default)]
pub struct ProviderAuth {
    pub url: String,
    pub user: String,
    pub token: String,
    pub webhook_secret: String,
}

impl fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAuth")
            .field("url", &self.url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// The forge-specific payload an event was parsed from.
#[derive(Debug, Clone)]
pub enum RawPayload {
    AzureDevOps(Box<azure::types::WebhookEvent>),
    BitbucketDataCenter(Box<bitbucket::types::WebhookEvent>),
    Gitea(Box<gitea::types::WebhookEvent>),
    GitHub(Box<github::WebhookPayload>),
}

/// A webhook normalized across forges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    pub sender: String,
    pub organization: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    pub url: String,
    pub sha: String,
    #[serde(default)]
    pub sha_url: String,
    #[serde(default)]
    pub sha_title: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub head_url: String,
    #[serde(default)]
    pub default_branch: String,
    /// Tip of the default branch, filled by `get_commit_info` where the forge exposes it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_branch_sha: String,
    #[serde(default)]
    pub pull_request_number: u64,
    #[serde(default)]
    pub pull_request_title: String,
    #[serde(default)]
    pub pull_request_labels: Vec<String>,
    pub trigger_target: Option<TriggerType>,
    pub event_type: String,
    #[serde(default)]
    pub trigger_comment: String,
    #[serde(default)]
    pub target_test_pipeline_run: String,
    #[serde(default)]
    pub target_cancel_pipeline_run: String,
    #[serde(default)]
    pub cancel_pipeline_runs: bool,
    #[serde(default)]
    pub has_skip_command: bool,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub sha_message: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub author_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub committer_name: String,
    #[serde(default)]
    pub committer_email: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub committer_date: Option<OffsetDateTime>,
    #[serde(skip)]
    pub provider: ProviderAuth,
    #[serde(skip)]
    pub payload: Option<RawPayload>,
}

impl Event {
    pub fn is_pull_request(&self) -> bool {
        self.trigger_target == Some(TriggerType::PullRequest)
    }

    /// Copy of the event as seen from another user, used when re-running the
    /// ACL checks for the author of an `/ok-to-test` comment.
    pub fn with_sender(&self, sender: &str, account_id: &str) -> Event {
        Event {
            sender: sender.to_string(),
            account_id: account_id.to_string(),
            event_type: String::new(),
            trigger_target: None,
            ..self.clone()
        }
    }

    /// Revision of the default branch: the tip seen by `get_commit_info`, else the branch name.
    pub fn default_branch_tip(&self) -> &str {
        if self.default_branch_sha.is_empty() { &self.default_branch } else { &self.default_branch_sha }
    }
}

/// Commit messages asking for CI to be skipped.
pub const SKIP_CI_COMMANDS: [&str; 4] = ["[skip ci]", "[ci skip]", "[skip tkn]", "[tkn skip]"];

pub fn skip_ci(message: &str) -> bool {
    SKIP_CI_COMMANDS.iter().any(|command| message.contains(command))
}

/// All-zero commit id, used by forges for deleted refs.
pub fn is_zero_sha(sha: &str) -> bool { !sha.is_empty() && sha.bytes().all(|b| b == b'0') }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_ci() {
        let cases: &[(&str, bool)] = &[
            ("fix: typo [skip ci]", true),
            ("[ci skip] docs", true),
            ("chore\n\n[skip tkn]", true),
            ("[tkn skip]", true),
            ("[SKIP CI]", false),
            ("skip ci", false),
        ];
        for &(message, expected) in cases {
            assert_eq!(skip_ci(message), expected, "{message:?}");
        }
    }

    #[test]
    fn test_default_branch_tip() {
        let mut event = Event { default_branch: "main".into(), ..Default::default() };
        assert_eq!(event.default_branch_tip(), "main");
        event.default_branch_sha = "fff000".into();
        assert_eq!(event.default_branch_tip(), "fff000");
    }

    #[test]
    fn test_with_sender() {
        let event = Event {
            sender: "outsider".into(),
            organization: "org".into(),
            event_type: "pull_request".into(),
            trigger_target: Some(TriggerType::PullRequest),
            provider: ProviderAuth { token: "secret".into(), ..Default::default() },
            ..Default::default()
        };
        let other = event.with_sender("owner", "42");
        assert_eq!(other.sender, "owner");
        assert_eq!(other.account_id, "42");
        assert_eq!(other.organization, "org");
        assert!(other.trigger_target.is_none());
        assert_eq!(other.provider.token, "secret");
        assert!(!format!("{:?}", other.provider).contains("secret"));
    }

    #[test]
    fn test_serialize_skips_secrets() {
        let event = Event {
            trigger_target: Some(TriggerType::PullRequestLabeled),
            provider: ProviderAuth { token: "secret".into(), ..Default::default() },
            ..Default::default()
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["trigger_target"], "pull_request_labeled");
        assert!(json.get("provider").is_none());
        assert!(!json.to_string().contains("secret"));
    }
}
