//! Gitea and Forgejo through the `/api/v1` REST API.

mod acl;
pub mod parse;
pub mod types;

use std::{pin::pin, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use forgehook_core::{
    changed_files::ChangedFiles,
    config::{Provenance, ProviderKind, RepositoryConfig},
    util::{base_url, first_line},
};
use futures_util::TryStreamExt;
use http::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{sync::OnceCell, time::sleep};

use self::types::{
    Blob, Branch, ChangedFile, Comment, Commit, Contents, CreateStatus, PullRequest, Tree,
    WebhookEvent,
};
use crate::{
    Detection, Provider, ProviderSettings,
    authorize::{self, AclOptions},
    client::{Auth, Page, RestClient, paginate},
    error::{ForgeError, is_not_found},
    event::{Event, ProviderAuth, RawPayload, TriggerType, skip_ci},
    manifest::{ManifestBuilder, is_yaml_file},
    signature::validate_request,
    status::{Conclusion, StatusOpts, target_url},
};

const PAGE_SIZE: usize = 50;
const STATUS_RETRIES: u32 = 3;

pub struct Gitea {
    settings: ProviderSettings,
    client: Option<RestClient>,
    allowed_teams: Vec<String>,
    files: OnceCell<ChangedFiles>,
}

impl Gitea {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings, client: None, allowed_teams: vec![], files: OnceCell::new() }
    }

    fn client(&self) -> Result<&RestClient> {
        self.client.as_ref().ok_or_else(|| {
            anyhow!(
                "no gitea client has been initialized, exiting... (hint: did you forget setting a secret on your repo?)"
            )
        })
    }

    fn repo_path(event: &Event) -> String {
        format!("repos/{}/{}", event.organization, event.repository)
    }

    /// `true` on a 2xx answer, `false` on 404.
    async fn exists(&self, path: &str) -> Result<bool> {
        let client = self.client()?;
        match client.send(client.request(Method::GET, path)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every item of a `page`/`limit` listing.
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let client = self.client()?;
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut pages = pin!(paginate(PAGE_SIZE, 1, |page| {
            let url = format!("{path}{separator}page={page}&limit={PAGE_SIZE}");
            async move {
                let items: Vec<T> = client.get_json(&url).await?;
                Ok(Page { items, next: Some(page + 1) })
            }
        }));
        let mut out = vec![];
        while let Some(items) = pages.try_next().await? {
            out.extend(items);
        }
        Ok(out)
    }

    async fn pull_request_comments(&self, event: &Event) -> Result<Vec<Comment>> {
        self.list_all(&format!(
            "{}/issues/{}/comments",
            Self::repo_path(event),
            event.pull_request_number
        ))
        .await
    }

    async fn post_issue_comment(&self, event: &Event, body: &str) -> Result<()> {
        let path = format!("{}/issues/{}/comments", Self::repo_path(event), event.pull_request_number);
        self.client()?.post_json(&path, &json!({ "body": body })).await?;
        Ok(())
    }

    async fn get_blob(&self, event: &Event, sha: &str) -> Result<String> {
        let blob: Blob =
            self.client()?.get_json(&format!("{}/git/blobs/{sha}", Self::repo_path(event))).await?;
        decode_base64(&blob.content)
    }

    /// Files of a pull request, following the `x-pagecount` header.
    async fn pull_request_files(&self, event: &Event) -> Result<ChangedFiles> {
        let client = self.client()?;
        let mut files = ChangedFiles::default();
        let mut page = 1u64;
        loop {
            let path = format!(
                "{}/pulls/{}/files?page={page}&limit={PAGE_SIZE}",
                Self::repo_path(event),
                event.pull_request_number
            );
            let response = client.send(client.request(Method::GET, &path)).await?;
            let page_count = response
                .headers()
                .get("x-pagecount")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let changed: Vec<ChangedFile> =
                response.json().await.context("Failed to decode pull request files")?;
            for file in changed {
                match file.status.as_str() {
                    "added" => files.added.push(file.filename.clone()),
                    "deleted" => files.deleted.push(file.filename.clone()),
                    "changed" | "modified" => files.modified.push(file.filename.clone()),
                    "renamed" => files.renamed.push(file.filename.clone()),
                    _ => {}
                }
                files.all.push(file.filename);
            }
            match page_count {
                Some(count) if page < count => page += 1,
                _ => break,
            }
        }
        Ok(files)
    }

    async fn fetch_changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        match event.trigger_target {
            Some(TriggerType::PullRequest | TriggerType::PullRequestClosed) => {
                self.pull_request_files(event).await
            }
            Some(TriggerType::Push) => {
                let Some(RawPayload::Gitea(raw)) = &event.payload else {
                    bail!("failed to get changed files: push payload is missing");
                };
                let WebhookEvent::Push(push) = raw.as_ref() else {
                    bail!("failed to get changed files: not a push payload");
                };
                let mut files = ChangedFiles::default();
                for commit in &push.commits {
                    files.all.extend(commit.added.iter().chain(&commit.modified).chain(&commit.removed).cloned());
                    files.added.extend(commit.added.iter().cloned());
                    files.modified.extend(commit.modified.iter().cloned());
                    files.deleted.extend(commit.removed.iter().cloned());
                }
                Ok(files)
            }
            other => bail!(
                "unable to get changed files. Unknown trigger type of '{}'. Expected pull_request or push",
                other.map(|t| t.as_str()).unwrap_or_default()
            ),
        }
    }
}

fn decode_base64(content: &str) -> Result<String> {
    let cleaned = content.split_whitespace().collect::<String>();
    let bytes = STANDARD.decode(cleaned).context("invalid base64 content")?;
    String::from_utf8(bytes).context("file content is not valid UTF-8")
}

/// Commit status state and display title for a run.
fn commit_state(opts: &StatusOpts) -> (&'static str, String) {
    if opts.is_in_progress() {
        return ("pending", "CI has Started".to_string());
    }
    let keep = |fallback: &str| {
        if opts.title.is_empty() { fallback.to_string() } else { opts.title.clone() }
    };
    match opts.conclusion {
        Conclusion::Success => ("success", "Success".to_string()),
        Conclusion::Failure | Conclusion::Error => ("failure", "Failed".to_string()),
        Conclusion::Pending => ("pending", keep("Pending")),
        // No neutral state on Gitea
        Conclusion::Neutral => ("success", "Unknown".to_string()),
        Conclusion::Skipped | Conclusion::NotApplicable => ("pending", keep("Skipped")),
        Conclusion::Completed => ("success", keep("Completed")),
    }
}

fn parse_date(date: &str) -> Option<OffsetDateTime> { OffsetDateTime::parse(date, &Rfc3339).ok() }

#[async_trait]
impl Provider for Gitea {
    fn kind(&self) -> ProviderKind { ProviderKind::Gitea }

    fn detect(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Detection> {
        parse::detect(headers, payload, &self.settings.commands)
    }

    fn parse_payload(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Event> {
        parse::parse(headers, payload, &self.settings.commands)
    }

    fn validate(&self, event: &Event, headers: &HeaderMap, payload: &[u8]) -> Result<()> {
        validate_request("gitea", headers, payload, &event.provider.webhook_secret)
    }

    async fn set_client(&mut self, event: &mut Event, repo: &RepositoryConfig) -> Result<()> {
        let token = repo.token.clone().filter(|t| !t.is_empty()).ok_or(ForgeError::MissingConfig(
            "no spec.git_provider.secret has been set in the repo crd",
        ))?;
        let mut url = match repo.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => base_url(&event.url).map_err(|_| {
                ForgeError::MissingConfig("no spec.git_provider.url has been set in the repo crd")
            })?,
        };
        if !url.ends_with("/api/v1") {
            url.push_str("/api/v1");
        }
        let client = RestClient::new(&url, Auth::Token(token.clone()))?;
        let user = repo.user.clone().unwrap_or_default();
        tracing::info!("gitea: initialized API client with provided credentials user={user} providerURL={url}");

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
        let repo_path = Self::repo_path(event);
        if event.sha.is_empty() && !event.head_branch.is_empty() {
            let branch: Branch =
                client.get_json(&format!("{repo_path}/branches/{}", event.head_branch)).await?;
            event.sha = branch.commit.id;
        } else if event.sha.is_empty() && event.pull_request_number != 0 {
            let pr: PullRequest =
                client.get_json(&format!("{repo_path}/pulls/{}", event.pull_request_number)).await?;
            event.sha = pr.head.sha;
            event.head_branch = pr.head.ref_;
            event.base_branch = pr.base.ref_;
        }

        let commit: Commit = client
            .get_json(&format!("{repo_path}/git/commits/{}", event.sha))
            .await
            .with_context(|| format!("cannot get commit {}", event.sha))?;
        event.sha_url = commit.html_url;
        event.sha = commit.sha;
        event.sha_title = first_line(&commit.commit.message).to_string();
        event.has_skip_command = skip_ci(&commit.commit.message);
        if let Some(author) = commit.commit.author {
            event.author_name = author.name;
            event.author_email = author.email;
            event.author_date = parse_date(&author.date);
        }
        if let Some(committer) = commit.commit.committer {
            event.committer_name = committer.name;
            event.committer_email = committer.email;
            event.committer_date = parse_date(&committer.date);
        }
        event.sha_message = commit.commit.message;

        if !event.default_branch.is_empty() {
            let branch: Branch = client
                .get_json(&format!("{repo_path}/branches/{}", event.default_branch))
                .await
                .with_context(|| format!("cannot get default branch {}", event.default_branch))?;
            event.default_branch_sha = branch.commit.id;
        }
        Ok(())
    }

    async fn get_tekton_dir(&self, event: &Event, path: &str, provenance: Provenance) -> Result<String> {
        let revision = match provenance {
            Provenance::DefaultBranch => {
                tracing::info!("Using PipelineRun definition from default_branch: {}", event.default_branch);
                event.default_branch_tip()
            }
            Provenance::Source => {
                tracing::info!("Using PipelineRun definition from source commit SHA: {}", event.sha);
                event.sha.as_str()
            }
        };
        let client = self.client()?;
        let repo_path = Self::repo_path(event);
        let root: Tree = client.get_json(&format!("{repo_path}/git/trees/{revision}")).await?;
        let Some(dir) = root.tree.iter().find(|entry| entry.path == path) else {
            return Ok(String::new());
        };
        if dir.kind != "tree" {
            bail!("{path} has been found but is not a directory");
        }

        let objects: Tree = client.get_json(&format!("{repo_path}/git/trees/{}", dir.sha)).await?;
        let mut builder = ManifestBuilder::default();
        for entry in objects.tree.iter().filter(|e| is_yaml_file(&e.path)) {
            let data = self.get_blob(event, &entry.sha).await?;
            builder.push(&entry.path, &data)?;
        }
        Ok(builder.finish())
    }

    async fn get_file_inside_repo(&self, event: &Event, path: &str, target: &str) -> Result<String> {
        let reference = match target {
            "" => event.sha.as_str(),
            target if target == event.default_branch => event.default_branch_tip(),
            target => target,
        };
        let contents: Contents = self
            .client()?
            .get_json(&format!("{}/contents/{path}?ref={reference}", Self::repo_path(event)))
            .await
            .with_context(|| format!("cannot find {path} inside the {} repository", event.repository))?;
        decode_base64(contents.content.as_deref().unwrap_or_default())
    }

    async fn get_files(&self, event: &Event) -> Result<ChangedFiles> {
        self.files.get_or_try_init(|| self.fetch_changed_files(event)).await.cloned()
    }

    async fn create_status(&self, event: &Event, opts: &StatusOpts) -> Result<()> {
        let client = self.client()?;
        let (state, title) = commit_state(opts);
        let opts = StatusOpts { title: self.settings.status.title(&title), ..opts.clone() };
        let context = self.settings.status.status_key(&opts);
        let status = CreateStatus {
            state,
            target_url: target_url(event, &opts),
            description: &opts.title,
            context: &context,
        };
        let path = format!("{}/statuses/{}", Self::repo_path(event), event.sha);

        // Freshly created users are not always visible yet
        let mut attempt = 0;
        loop {
            match client.post_json(&path, &status).await {
                Ok(_) => break,
                Err(e) if attempt + 1 < STATUS_RETRIES && format!("{e:#}").contains("user does not exist") => {
                    attempt += 1;
                    tracing::warn!("CreateStatus failed with transient error, retrying {attempt}/{STATUS_RETRIES}: {e}");
                    sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e).context("cannot create commit status"),
            }
        }

        if let Some(comment) = self.settings.status.completion_comment(event, &opts) {
            self.post_issue_comment(event, &comment).await?;
        }
        Ok(())
    }

    async fn create_comment(&self, event: &Event, body: &str, marker: Option<&str>) -> Result<()> {
        let client = self.client()?;
        if event.pull_request_number == 0 {
            bail!("create comment only works on pull requests");
        }
        if let Some(marker) = marker.filter(|m| !m.is_empty()) {
            let comments = self.pull_request_comments(event).await?;
            if let Some(existing) = comments.iter().find(|c| c.body.contains(marker)) {
                let path = format!("{}/issues/comments/{}", Self::repo_path(event), existing.id);
                client.patch_json(&path, &json!({ "body": body }), "application/json").await?;
                return Ok(());
            }
        }
        self.post_issue_comment(event, body).await
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

    async fn check_policy_allowing(&self, event: &Event, teams: &[String]) -> (bool, String) {
        acl::check_policy_allowing(self, event, teams).await
    }
}
