//! GitHub and GitHub Enterprise through octocrab.

mod acl;
pub mod parse;
pub mod types;

use std::pin::pin;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use forgehook_core::{
    changed_files::ChangedFiles,
    config::{Provenance, ProviderKind, RepositoryConfig},
    util::{base_url, first_line},
};
use futures_util::TryStreamExt;
use http::{HeaderMap, StatusCode};
use octocrab::Octocrab;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::OnceCell;

pub use self::types::WebhookPayload;
use self::types::{
    Blob, Branch, Commit, Contents, CreateStatus, IssueComment, PullRequest, PullRequestFile, Tree,
};
use crate::{
    Detection, Provider, ProviderSettings,
    authorize::{self, AclOptions},
    client::{Page, paginate},
    error::ForgeError,
    event::{Event, ProviderAuth, RawPayload, TriggerType, skip_ci},
    manifest::{ManifestBuilder, is_yaml_file},
    signature::validate_request,
    status::{Conclusion, StatusOpts, target_url},
};

const PUBLIC_API_URL: &str = "https://api.github.com";
const PAGE_SIZE: u8 = 100;

#[derive(Serialize)]
struct PageParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    per_page: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

pub struct GitHub {
    settings: ProviderSettings,
    client: Option<Octocrab>,
    allowed_teams: Vec<String>,
    files: OnceCell<ChangedFiles>,
}

/// API root for a repository URL: the public API for github.com, `/api/v3`
/// on Enterprise hosts.
fn api_url_for(repo_url: &str) -> Result<String> {
    let base = base_url(repo_url)?;
    if base == "https://github.com" || base == "http://github.com" {
        Ok(PUBLIC_API_URL.to_string())
    } else {
        Ok(format!("{base}/api/v3"))
    }
}

impl GitHub {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings, client: None, allowed_teams: vec![], files: OnceCell::new() }
    }

    fn client(&self) -> Result<&Octocrab> {
        self.client.as_ref().ok_or_else(|| {
            anyhow!(
                "no github client has been initialized, exiting... (hint: did you forget setting a secret on your repo?)"
            )
        })
    }

    fn repo_path(event: &Event) -> String {
        format!("/repos/{}/{}", event.organization, event.repository)
    }

    async fn get<T: DeserializeOwned>(&self, route: &str) -> Result<T> {
        Ok(self.client()?.get(route, None::<&()>).await?)
    }

    /// `true` on a 2xx answer, `false` on 404. Membership endpoints answer 204
    /// without a body.
    async fn exists(&self, route: &str) -> Result<bool> {
        let response = self.client()?._get(route).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        octocrab::map_github_error(response).await?;
        Ok(true)
    }

    /// Every item of a `per_page`/`page` listing.
    async fn list_all<T: DeserializeOwned>(&self, route: &str) -> Result<Vec<T>> {
        let client = self.client()?;
        let mut pages = pin!(paginate(PAGE_SIZE as usize, 1, |page| async move {
            let params = PageParams { per_page: Some(PAGE_SIZE), page: Some(page as u32) };
            let items: Vec<T> = client.get(route, Some(&params)).await?;
            Ok(Page { items, next: Some(page + 1) })
        }));
        let mut out = vec![];
        while let Some(items) = pages.try_next().await? {
            out.extend(items);
        }
        Ok(out)
    }

    async fn pull_request_comments(&self, event: &Event) -> Result<Vec<IssueComment>> {
        self.list_all(&format!(
            "{}/issues/{}/comments",
            Self::repo_path(event),
            event.pull_request_number
        ))
        .await
    }

    async fn post_issue_comment(&self, event: &Event, body: &str) -> Result<()> {
        let route = format!("{}/issues/{}/comments", Self::repo_path(event), event.pull_request_number);
        let _: Value = self.client()?.post(route, Some(&json!({ "body": body }))).await?;
        Ok(())
    }

    async fn fetch_changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        match event.trigger_target {
            Some(TriggerType::PullRequest | TriggerType::PullRequestClosed) => {
                let route =
                    format!("{}/pulls/{}/files", Self::repo_path(event), event.pull_request_number);
                let mut files = ChangedFiles::default();
                for file in self.list_all::<PullRequestFile>(&route).await? {
                    match file.status.as_str() {
                        "added" => files.added.push(file.filename.clone()),
                        "removed" => files.deleted.push(file.filename.clone()),
                        "modified" | "changed" => files.modified.push(file.filename.clone()),
                        "renamed" => files.renamed.push(file.filename.clone()),
                        _ => {}
                    }
                    files.all.push(file.filename);
                }
                Ok(files)
            }
            Some(TriggerType::Push) => {
                let Some(RawPayload::GitHub(raw)) = &event.payload else {
                    bail!("failed to get changed files: push payload is missing");
                };
                let WebhookPayload::Push(push) = raw.as_ref() else {
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
        Conclusion::Failure => ("failure", "Failed".to_string()),
        Conclusion::Error => ("error", "Failed".to_string()),
        Conclusion::Pending => ("pending", keep("Pending")),
        Conclusion::Neutral => ("success", "Unknown".to_string()),
        Conclusion::Skipped | Conclusion::NotApplicable => ("success", keep("Skipped")),
        Conclusion::Completed => ("success", keep("Completed")),
    }
}

fn parse_date(date: &str) -> Option<OffsetDateTime> { OffsetDateTime::parse(date, &Rfc3339).ok() }

#[async_trait]
impl Provider for GitHub {
    fn kind(&self) -> ProviderKind { ProviderKind::GitHub }

    fn detect(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Detection> {
        parse::detect(headers, payload, &self.settings.commands)
    }

    fn parse_payload(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Event> {
        parse::parse(headers, payload, &self.settings.commands)
    }

    fn validate(&self, event: &Event, headers: &HeaderMap, payload: &[u8]) -> Result<()> {
        validate_request("github", headers, payload, &event.provider.webhook_secret)
    }

    async fn set_client(&mut self, event: &mut Event, repo: &RepositoryConfig) -> Result<()> {
        let token = repo.token.clone().filter(|t| !t.is_empty()).ok_or(ForgeError::MissingConfig(
            "no spec.git_provider.secret has been set in the repo crd",
        ))?;
        let url = match repo.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => api_url_for(&event.url).map_err(|_| {
                ForgeError::MissingConfig("no spec.git_provider.url has been set in the repo crd")
            })?,
        };
        let client = Octocrab::builder()
            .base_uri(url.as_str())
            .context("Invalid GitHub API URL")?
            .personal_token(token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        let user = repo.user.clone().unwrap_or_default();
        tracing::info!("github: initialized API client with provided credentials user={user} providerURL={url}");

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
        let repo_path = Self::repo_path(event);
        if event.sha.is_empty() && event.pull_request_number != 0 {
            let pr: PullRequest = self.get(&format!("{repo_path}/pulls/{}", event.pull_request_number)).await?;
            event.sha = pr.head.sha;
            event.head_branch = pr.head.ref_;
            event.base_branch = pr.base.ref_;
            event.pull_request_title = pr.title;
            event.pull_request_labels = pr.labels.into_iter().map(|l| l.name).collect();
        } else if event.sha.is_empty() && !event.head_branch.is_empty() {
            let branch: Branch = self.get(&format!("{repo_path}/branches/{}", event.head_branch)).await?;
            event.sha = branch.commit.sha;
        }
        if event.sha.is_empty() {
            bail!("unable to determine commit SHA");
        }

        let commit: Commit = self
            .get(&format!("{repo_path}/commits/{}", event.sha))
            .await
            .with_context(|| format!("cannot get commit {}", event.sha))?;
        event.sha = commit.sha;
        event.sha_url = commit.html_url;
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
            let branch: Branch = self
                .get(&format!("{repo_path}/branches/{}", event.default_branch))
                .await
                .with_context(|| format!("cannot get default branch {}", event.default_branch))?;
            event.default_branch_sha = branch.commit.sha;
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
        let repo_path = Self::repo_path(event);
        let path = path.trim_end_matches('/');
        let tree: Tree = self.get(&format!("{repo_path}/git/trees/{revision}?recursive=1")).await?;
        if tree.truncated {
            tracing::warn!("Tree of {revision} is truncated, some files under {path} may be missing");
        }
        let Some(dir) = tree.tree.iter().find(|entry| entry.path == path) else {
            return Ok(String::new());
        };
        if dir.kind != "tree" {
            bail!("{path} has been found but is not a directory");
        }

        let prefix = format!("{path}/");
        let mut builder = ManifestBuilder::default();
        for entry in tree
            .tree
            .iter()
            .filter(|e| e.kind == "blob" && e.path.starts_with(&prefix) && is_yaml_file(&e.path))
        {
            let blob: Blob = self.get(&format!("{repo_path}/git/blobs/{}", entry.sha)).await?;
            builder.push(&entry.path, &decode_base64(&blob.content)?)?;
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
            .get(&format!("{}/contents/{path}?ref={reference}", Self::repo_path(event)))
            .await
            .with_context(|| format!("cannot find {path} inside the {} repository", event.repository))?;
        decode_base64(contents.content.as_deref().unwrap_or_default())
    }

    async fn get_files(&self, event: &Event) -> Result<ChangedFiles> {
        self.files.get_or_try_init(|| self.fetch_changed_files(event)).await.cloned()
    }

    async fn create_status(&self, event: &Event, opts: &StatusOpts) -> Result<()> {
        let (state, title) = commit_state(opts);
        let opts = StatusOpts { title: self.settings.status.title(&title), ..opts.clone() };
        let context = self.settings.status.status_key(&opts);
        let status = CreateStatus {
            state,
            target_url: target_url(event, &opts),
            description: &opts.title,
            context: &context,
        };
        let route = format!("{}/statuses/{}", Self::repo_path(event), event.sha);
        let _: Value =
            self.client()?.post(route, Some(&status)).await.context("cannot create commit status")?;

        if let Some(comment) = self.settings.status.completion_comment(event, &opts) {
            self.post_issue_comment(event, &comment).await?;
        }
        Ok(())
    }

    async fn create_comment(&self, event: &Event, body: &str, marker: Option<&str>) -> Result<()> {
        if event.pull_request_number == 0 {
            bail!("create comment only works on pull requests");
        }
        if let Some(marker) = marker.filter(|m| !m.is_empty()) {
            let comments = self.pull_request_comments(event).await?;
            if let Some(existing) = comments.iter().find(|c| c.body.contains(marker)) {
                let route = format!("{}/issues/comments/{}", Self::repo_path(event), existing.id);
                let _: Value = self.client()?.patch(route, Some(&json!({ "body": body }))).await?;
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
