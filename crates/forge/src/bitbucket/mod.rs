//! Bitbucket Data Center: `/rest/api/1.0` for repository data and
//! `/rest/build-status/1.0` for commit statuses.

mod acl;
pub mod parse;
pub mod types;

use std::pin::pin;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use forgehook_core::{
    changed_files::ChangedFiles,
    config::{Provenance, ProviderKind, RepositoryConfig},
    util::{base_url, first_line},
};
use futures_util::TryStreamExt;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use self::types::{Branch, BuildStatus, Commit, FileChange, Paged};
use crate::{
    Detection, Provider, ProviderSettings,
    authorize::{self, AclOptions},
    client::{Auth, Page, RestClient, paginate},
    error::ForgeError,
    event::{Event, ProviderAuth, TriggerType, skip_ci},
    manifest::{ManifestBuilder, is_yaml_file},
    signature::validate_request,
    status::{Conclusion, StatusOpts, target_url},
};

const API_RESPONSE_LIMIT: usize = 100;

pub struct BitbucketDataCenter {
    settings: ProviderSettings,
    client: Option<RestClient>,
    /// `scheme://host` of the server, for web links.
    base_url: String,
    /// Raw project key, `~USER` for personal projects.
    project_key: String,
    allowed_teams: Vec<String>,
    files: OnceCell<ChangedFiles>,
}

impl BitbucketDataCenter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            client: None,
            base_url: String::new(),
            project_key: String::new(),
            allowed_teams: vec![],
            files: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&RestClient> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("no token has been set, cannot use the bitbucket-datacenter API"))
    }

    fn repo_path(&self, event: &Event) -> String {
        format!("api/1.0/projects/{}/repos/{}", self.project_key, event.repository)
    }

    /// Every value of a paged listing.
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let client = self.client()?;
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut pages = pin!(paginate(API_RESPONSE_LIMIT, 0, |start| {
            let url = format!("{path}{separator}start={start}&limit={API_RESPONSE_LIMIT}");
            async move {
                let page: Paged<T> = client.get_json(&url).await?;
                let next = page.next();
                Ok(Page { items: page.values, next })
            }
        }));
        let mut out = vec![];
        while let Some(items) = pages.try_next().await? {
            out.extend(items);
        }
        Ok(out)
    }

    async fn get_raw(&self, event: &Event, at: Option<&str>, path: &str) -> Result<String> {
        let mut url = format!("{}/raw/{path}", self.repo_path(event));
        if let Some(at) = at.filter(|a| !a.is_empty()) {
            url.push_str(&format!("?at={at}"));
        }
        self.client()?
            .get_text(&url)
            .await
            .with_context(|| format!("cannot find {path} inside the {} repository", event.repository))
    }

    async fn fetch_changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let path = match event.trigger_target {
            Some(TriggerType::PullRequest) => {
                format!("{}/pull-requests/{}/changes", self.repo_path(event), event.pull_request_number)
            }
            Some(TriggerType::Push) => format!("{}/commits/{}/changes", self.repo_path(event), event.sha),
            _ => return Ok(ChangedFiles::default()),
        };
        let changes: Vec<FileChange> =
            self.list_all(&path).await.context("failed to list changes")?;
        let mut files = ChangedFiles::default();
        for change in changes {
            let path = change.path.to_string;
            match change.kind.as_str() {
                "ADD" | "COPY" => files.added.push(path.clone()),
                "MODIFY" => files.modified.push(path.clone()),
                "DELETE" => files.deleted.push(path.clone()),
                "MOVE" => files.renamed.push(path.clone()),
                _ => {}
            }
            files.all.push(path);
        }
        Ok(files)
    }

    async fn create_pr_comment(&self, event: &Event, body: &str) -> Result<()> {
        let path =
            format!("{}/pull-requests/{}/comments", self.repo_path(event), event.pull_request_number);
        self.client()?
            .post_json(&path, &json!({ "text": body }))
            .await
            .context("cannot create pull request comment")?;
        Ok(())
    }
}

/// Build status state and display title for a run.
fn build_state(opts: &StatusOpts) -> (&'static str, Option<&'static str>) {
    if opts.is_in_progress() {
        return ("INPROGRESS", Some("⚡ CI has started"));
    }
    match opts.conclusion {
        Conclusion::Skipped | Conclusion::NotApplicable => ("FAILED", Some("➖ Skipping this commit")),
        Conclusion::Neutral => ("FAILED", Some("➖ CI has stopped")),
        Conclusion::Failure | Conclusion::Error => ("FAILED", Some("❌ Failed")),
        Conclusion::Pending if opts.status == crate::status::RunStatus::Queued => ("UNKNOWN", None),
        Conclusion::Pending => ("INPROGRESS", Some("⚡ CI has started")),
        Conclusion::Success => ("SUCCESSFUL", Some("Commit has been validated")),
        Conclusion::Completed => ("SUCCESSFUL", Some("Completed")),
    }
}

fn from_millis(ms: Option<i64>) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms?) * 1_000_000).ok()
}

#[async_trait]
impl Provider for BitbucketDataCenter {
    fn kind(&self) -> ProviderKind { ProviderKind::BitbucketDataCenter }

    fn detect(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Detection> {
        parse::detect(headers, payload, &self.settings.commands)
    }

    fn parse_payload(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Event> {
        parse::parse(headers, payload, &self.settings.commands)
    }

    fn validate(&self, event: &Event, headers: &HeaderMap, payload: &[u8]) -> Result<()> {
        validate_request("bitbucket-datacenter", headers, payload, &event.provider.webhook_secret)
    }

    async fn set_client(&mut self, event: &mut Event, repo: &RepositoryConfig) -> Result<()> {
        let user = repo.user.clone().filter(|u| !u.is_empty()).ok_or(ForgeError::MissingConfig(
            "no spec.git_provider.user has been set in the repo crd",
        ))?;
        let token = repo.token.clone().filter(|t| !t.is_empty()).ok_or(ForgeError::MissingConfig(
            "no spec.git_provider.secret has been set in the repo crd",
        ))?;
        let mut url = match repo.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => base_url(&event.url)
                .map_err(|_| ForgeError::MissingConfig("no spec.git_provider.url has been set in the repo crd"))?,
        };
        url = url.trim_end_matches('/').to_string();
        if !url.ends_with("/rest") {
            url.push_str("/rest");
        }

        let client = RestClient::new(&url, Auth::Bearer(token.clone()))?;
        if let Err(e) = client.get_json::<types::User>(&format!("api/1.0/users/{user}")).await {
            return Err(match e.downcast_ref::<ForgeError>() {
                Some(ForgeError::Unauthorized(_)) => anyhow!("cannot get user {user} with token: {e}"),
                _ => anyhow!("cannot get user {user}: {e}"),
            });
        }
        tracing::info!("bitbucket-datacenter: initialized client for user={user} providerURL={url}");

        self.base_url = base_url(&event.url)?;
        self.project_key =
            if event.project_id.is_empty() { event.organization.clone() } else { event.project_id.clone() };
        self.allowed_teams = repo.settings.allowed_teams.clone();
        self.client = Some(client);
        event.provider = ProviderAuth {
            url,
            user,
            token,
            webhook_secret: repo.webhook_secret.clone().unwrap_or_default(),
        };
        Ok(())
    }

    async fn get_commit_info(&self, event: &mut Event) -> Result<()> {
        let client = self.client()?;
        let commit: Commit = client
            .get_json(&format!("{}/commits/{}", self.repo_path(event), event.sha))
            .await
            .with_context(|| format!("cannot get commit {}", event.sha))?;
        event.sha_title = first_line(&commit.message).to_string();
        event.sha_url = format!(
            "{}/projects/{}/repos/{}/commits/{}",
            self.base_url, self.project_key, event.repository, event.sha
        );
        event.has_skip_command = skip_ci(&commit.message);
        event.author_name = commit.author.name;
        event.author_email = commit.author.email_address;
        event.author_date = from_millis(commit.author_timestamp);
        event.committer_name = commit.committer.name;
        event.committer_email = commit.committer.email_address;
        event.committer_date = from_millis(commit.committer_timestamp);
        event.sha_message = commit.message;

        let branch: Branch = client
            .get_json(&format!("{}/branches/default", self.repo_path(event)))
            .await
            .context("cannot get default branch")?;
        event.default_branch = branch.display_id;
        event.default_branch_sha = branch.latest_commit;
        Ok(())
    }

    async fn get_tekton_dir(&self, event: &Event, path: &str, provenance: Provenance) -> Result<String> {
        let at = match provenance {
            Provenance::Source => {
                tracing::info!("Using PipelineRun definition from source commit SHA: {}", event.sha);
                Some(event.sha.as_str())
            }
            Provenance::DefaultBranch => {
                tracing::info!("Using PipelineRun definition from default_branch: {}", event.default_branch);
                Some(event.default_branch_sha.as_str()).filter(|s| !s.is_empty())
            }
        };
        let mut listing = format!("{}/files/{path}", self.repo_path(event));
        if let Some(at) = at {
            listing.push_str(&format!("?at={at}"));
        }
        let entries: Vec<String> = match self.list_all(&listing).await {
            Ok(entries) => entries,
            Err(e) if crate::error::is_not_found(&e) => return Ok(String::new()),
            Err(e) => return Err(e).with_context(|| format!("cannot list content of {path} directory")),
        };

        let mut builder = ManifestBuilder::default();
        for entry in entries {
            let file = format!("{}/{entry}", path.trim_end_matches('/'));
            if !is_yaml_file(&file) {
                continue;
            }
            let data = self.get_raw(event, at, &file).await?;
            builder.push(&file, &data)?;
        }
        Ok(builder.finish())
    }

    async fn get_file_inside_repo(&self, event: &Event, path: &str, target: &str) -> Result<String> {
        let at = if target == event.default_branch { &event.default_branch_sha } else { &event.sha };
        self.get_raw(event, Some(at), path).await
    }

    async fn get_files(&self, event: &Event) -> Result<ChangedFiles> {
        self.files.get_or_try_init(|| self.fetch_changed_files(event)).await.cloned()
    }

    async fn create_status(&self, event: &Event, opts: &StatusOpts) -> Result<()> {
        let client = self.client()?;
        let (state, title) = build_state(opts);
        let mut opts = opts.clone();
        if let Some(title) = title {
            opts.title = title.to_string();
        }
        opts.title = self.settings.status.title(&opts.title);
        let key = self.settings.status.status_key(&opts);
        let status = BuildStatus {
            state,
            key: &key,
            name: &key,
            url: target_url(event, &opts),
            description: &opts.title,
        };
        client
            .post_json(&format!("build-status/1.0/commits/{}", event.sha), &status)
            .await
            .with_context(|| format!("cannot create build status on {}", event.sha))?;

        if let Some(comment) = self.settings.status.completion_comment(event, &opts) {
            self.create_pr_comment(event, &comment).await?;
        }
        Ok(())
    }

    async fn create_comment(&self, event: &Event, body: &str, _marker: Option<&str>) -> Result<()> {
        if event.pull_request_number == 0 {
            return Err(anyhow!("create comment only works on pull requests"));
        }
        self.create_pr_comment(event, body).await
    }

    async fn is_allowed(&self, event: &Event) -> Result<bool> {
        let opts = AclOptions {
            remember_ok_to_test: self.settings.remember_ok_to_test,
            allowed_teams: &self.allowed_teams,
        };
        authorize::is_allowed(self, event, opts).await
    }

    async fn is_allowed_owners_file(&self, event: &Event) -> Result<bool> {
        authorize::owners_file_allows(self, event).await
    }

    async fn check_policy_allowing(&self, _event: &Event, _teams: &[String]) -> (bool, String) {
        (false, "team policy is not supported on bitbucket-datacenter".to_string())
    }
}
