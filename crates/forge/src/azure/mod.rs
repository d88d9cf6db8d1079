//! Azure DevOps Services through the Git and Core REST APIs.

mod acl;
pub mod parse;
pub mod types;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use forgehook_core::{
    changed_files::ChangedFiles,
    config::{Provenance, ProviderKind, RepositoryConfig},
    util::{branch_name, first_line},
};
use http::HeaderMap;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::OnceCell;

use self::types::{
    Changes, Commit, GitItem, GitRef, GitStatus, PullRequest, StatusContext, StatusRef, Tree,
    ValueList,
};
use crate::{
    Detection, Provider, ProviderSettings,
    authorize::{self, AclOptions},
    client::{Auth, RestClient},
    error::ForgeError,
    event::{Event, ProviderAuth, TriggerType, skip_ci},
    manifest::{ManifestBuilder, is_yaml_file},
    signature::validate_request,
    status::{Conclusion, StatusOpts, target_url},
};

const API_VERSION: &str = "7.1";
const STATUS_GENRE: &str = "PAC";

pub struct AzureDevOps {
    settings: ProviderSettings,
    client: Option<RestClient>,
    allowed_teams: Vec<String>,
    files: OnceCell<ChangedFiles>,
}

/// A version of the repository tree: a commit or a branch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version<'a> {
    Commit(&'a str),
    Branch(&'a str),
}

impl Version<'_> {
    fn query(self) -> [(&'static str, String); 2] {
        let (version, kind) = match self {
            Version::Commit(sha) => (sha, "commit"),
            Version::Branch(name) => (name, "branch"),
        };
        [
            ("versionDescriptor.version", version.to_string()),
            ("versionDescriptor.versionType", kind.to_string()),
        ]
    }
}

impl AzureDevOps {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings, client: None, allowed_teams: vec![], files: OnceCell::new() }
    }

    fn client(&self) -> Result<&RestClient> {
        self.client.as_ref().ok_or_else(|| {
            anyhow!(
                "no Azure DevOps client has been initialized, exiting... (hint: did you forget setting a secret on your repo?)"
            )
        })
    }

    /// Request against `path`, relative to the organization URL.
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client()?.request(method, path).query(&[("api-version", API_VERSION)]))
    }

    fn git_path(event: &Event, rest: &str) -> String {
        format!("{}/_apis/git/repositories/{}/{rest}", event.project_id, event.repository_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.client()?.send(builder).await?;
        response.json().await.context("Failed to decode Azure DevOps response")
    }

    async fn get_text(&self, builder: RequestBuilder) -> Result<String> {
        let response = self.client()?.send(builder).await?;
        let bytes = response.bytes().await.context("Failed to read Azure DevOps response")?;
        String::from_utf8(bytes.to_vec()).context("file content is not valid UTF-8")
    }

    async fn send_json<B: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<()> {
        let builder = self.request(method, path)?.json(body);
        self.client()?.send(builder).await?;
        Ok(())
    }

    /// Object id of `refs/heads/<branch>`.
    async fn branch_tip(&self, event: &Event, branch: &str) -> Result<Option<String>> {
        let filter = format!("heads/{branch}");
        let builder = self
            .request(Method::GET, &Self::git_path(event, "refs"))?
            .query(&[("filter", filter.as_str())]);
        let refs: ValueList<GitRef> = self.get_json(builder).await.context("failed to get branch info")?;
        let full = format!("refs/heads/{branch}");
        Ok(refs.value.into_iter().find(|r| r.name == full).map(|r| r.object_id))
    }

    async fn get_item(&self, event: &Event, path: &str, version: Version<'_>) -> Result<GitItem> {
        let builder = self
            .request(Method::GET, &Self::git_path(event, "items"))?
            .query(&[("path", path), ("$format", "json")])
            .query(&version.query());
        self.get_json(builder).await
    }

    async fn post_thread(&self, event: &Event, body: &str) -> Result<()> {
        let path = Self::git_path(event, &format!("pullRequests/{}/threads", event.pull_request_number));
        let thread = json!({
            "comments": [{ "parentCommentId": 0, "content": body, "commentType": 1 }],
            "status": 1,
        });
        self.send_json(Method::POST, &path, &thread).await.context("failed to create comment thread")
    }

    async fn fetch_changed_files(&self, event: &Event) -> Result<ChangedFiles> {
        let path = Self::git_path(event, &format!("commits/{}/changes", event.sha));
        let changes: Changes = self
            .get_json(self.request(Method::GET, &path)?)
            .await
            .with_context(|| format!("failed to get changes for commit {}", event.sha))?;
        let mut files = ChangedFiles::default();
        for change in changes.changes.into_iter().filter(|c| !c.item.is_folder) {
            let path = change.item.path.trim_start_matches('/').to_string();
            // changeType is a comma separated set such as "edit, rename"
            let kinds = change.change_type.split(',').map(str::trim).collect::<Vec<_>>();
            if kinds.contains(&"rename") {
                files.renamed.push(path.clone());
            } else if kinds.contains(&"add") {
                files.added.push(path.clone());
            } else if kinds.contains(&"delete") {
                files.deleted.push(path.clone());
            } else if kinds.contains(&"edit") {
                files.modified.push(path.clone());
            }
            files.all.push(path);
        }
        Ok(files)
    }

    async fn publish_pull_request_status(&self, event: &Event, status: &GitStatus<'_>) -> Result<()> {
        let path = Self::git_path(event, &format!("pullRequests/{}/statuses", event.pull_request_number));
        let existing: ValueList<StatusRef> = self
            .get_json(self.request(Method::GET, &path)?)
            .await
            .context("failed to fetch pull request statuses")?;

        // Statuses cannot be updated in place, only removed and created again
        if let Some(previous) = existing.value.first() {
            tracing::debug!("Removing pull request status {} ({})", previous.id, previous.context.name);
            let patch = json!([{ "op": "remove", "path": format!("/{}", previous.id) }]);
            let body = serde_json::to_vec(&patch).context("Failed to encode status patch")?;
            let builder = self
                .request(Method::PATCH, &path)?
                .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
                .body(body);
            self.client()?.send(builder).await.context("failed to update pull request status")?;
        }
        self.send_json(Method::POST, &path, status).await.context("failed to create pull request status")
    }
}

/// State, title and summary of a status for a run.
fn git_state(opts: &StatusOpts) -> (&'static str, &'static str, &'static str) {
    if opts.is_in_progress() {
        return ("pending", "In Progress", "is in progress.");
    }
    match opts.conclusion {
        Conclusion::Success => ("succeeded", "Success", "has successfully validated your commit."),
        Conclusion::Completed => ("succeeded", "Completed", "has successfully validated your commit."),
        Conclusion::Failure => ("failed", "Failed", "has failed."),
        Conclusion::Pending => ("pending", "Pending", "is waiting to start."),
        Conclusion::Error => ("error", "Error", "encountered an error during processing."),
        Conclusion::Skipped | Conclusion::NotApplicable => {
            ("notApplicable", "Not Applicable", "is not applicable for this commit.")
        }
        Conclusion::Neutral => ("notSet", "Unknown", "doesn't know what happened with this commit."),
    }
}

fn parse_date(date: &str) -> Option<OffsetDateTime> { OffsetDateTime::parse(date, &Rfc3339).ok() }

#[async_trait]
impl Provider for AzureDevOps {
    fn kind(&self) -> ProviderKind { ProviderKind::AzureDevOps }

    fn detect(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Detection> {
        parse::detect(headers, payload, &self.settings.commands)
    }

    fn parse_payload(&self, headers: &HeaderMap, payload: &[u8]) -> Result<Event> {
        parse::parse(headers, payload, &self.settings.commands)
    }

    fn validate(&self, event: &Event, headers: &HeaderMap, payload: &[u8]) -> Result<()> {
        validate_request("azure-devops", headers, payload, &event.provider.webhook_secret)
    }

    async fn set_client(&mut self, event: &mut Event, repo: &RepositoryConfig) -> Result<()> {
        let token = repo.token.clone().filter(|t| !t.is_empty()).ok_or(ForgeError::MissingConfig(
            "no spec.git_provider.secret has been set in the repo crd",
        ))?;
        let url = match repo.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if !event.organization.is_empty() => event.organization.clone(),
            None => {
                return Err(ForgeError::MissingConfig(
                    "no spec.git_provider.url has been set in the repo crd",
                )
                .into());
            }
        };
        // Personal access tokens go in the password of basic auth
        let client = RestClient::new(&url, Auth::Basic { user: String::new(), password: token.clone() })?;
        tracing::info!("azure-devops: initialized API client organizationURL={url}");

        self.allowed_teams = repo.settings.allowed_teams.clone();
        self.client = Some(client);
        event.provider = ProviderAuth {
            url,
            user: repo.user.clone().unwrap_or_default(),
            token,
            webhook_secret: repo.webhook_secret.clone().unwrap_or_default(),
        };
        Ok(())
    }

    async fn get_commit_info(&self, event: &mut Event) -> Result<()> {
        if event.sha.is_empty() && !event.head_branch.is_empty() {
            let branch = event.head_branch.clone();
            event.sha = self.branch_tip(event, &branch).await?.unwrap_or_default();
        } else if event.sha.is_empty() && event.pull_request_number != 0 {
            let path = Self::git_path(event, &format!("pullrequests/{}", event.pull_request_number));
            let pr: PullRequest = self
                .get_json(self.request(Method::GET, &path)?)
                .await
                .context("failed to get pull request")?;
            event.sha = pr.last_merge_source_commit.map(|c| c.commit_id).unwrap_or_default();
            event.head_branch = branch_name(&pr.source_ref_name).to_string();
            event.base_branch = branch_name(&pr.target_ref_name).to_string();
        }
        if event.sha.is_empty() {
            bail!("unable to determine commit SHA");
        }

        let path = Self::git_path(event, &format!("commits/{}", event.sha));
        let commit: Commit =
            self.get_json(self.request(Method::GET, &path)?).await.context("failed to get commit")?;
        event.sha_url = commit.remote_url;
        event.sha_title = first_line(&commit.comment).to_string();
        event.has_skip_command = skip_ci(&commit.comment);
        event.sha_message = commit.comment;
        if !commit.commit_id.is_empty() {
            event.sha = commit.commit_id;
        }
        if let Some(author) = commit.author {
            event.author_name = author.name;
            event.author_email = author.email;
            event.author_date = parse_date(&author.date);
        }
        if let Some(committer) = commit.committer {
            event.committer_name = committer.name;
            event.committer_email = committer.email;
            event.committer_date = parse_date(&committer.date);
        }

        if !event.default_branch.is_empty() {
            let default_branch = event.default_branch.clone();
            event.default_branch_sha = self.branch_tip(event, &default_branch).await?.unwrap_or_default();
        }
        Ok(())
    }

    async fn get_tekton_dir(&self, event: &Event, path: &str, provenance: Provenance) -> Result<String> {
        let version = match provenance {
            Provenance::DefaultBranch if !event.default_branch_sha.is_empty() => {
                Version::Commit(&event.default_branch_sha)
            }
            Provenance::DefaultBranch => Version::Branch(&event.default_branch),
            Provenance::Source => Version::Commit(&event.sha),
        };
        tracing::info!("Using PipelineRun definition from {version:?}");

        let item = match self.get_item(event, path, version).await {
            Ok(item) => item,
            Err(e) if crate::error::is_not_found(&e) => return Ok(String::new()),
            Err(e) => return Err(e).context("failed to fetch the item"),
        };
        if !item.is_folder && item.git_object_type != "tree" {
            bail!("{path} has been found but is not a directory");
        }

        let tree_path = Self::git_path(event, &format!("trees/{}", item.object_id));
        let builder = self.request(Method::GET, &tree_path)?.query(&[("recursive", "true")]);
        let tree: Tree = self.get_json(builder).await.context("failed to fetch the tree")?;

        let mut manifests = ManifestBuilder::default();
        for entry in tree
            .tree_entries
            .iter()
            .filter(|e| e.git_object_type == "blob" && is_yaml_file(&e.relative_path))
        {
            let blob_path = Self::git_path(event, &format!("blobs/{}", entry.object_id));
            let builder = self.request(Method::GET, &blob_path)?.query(&[("$format", "octetstream")]);
            let data = self.get_text(builder).await?;
            manifests.push(&entry.relative_path, &data)?;
        }
        Ok(manifests.finish())
    }

    async fn get_file_inside_repo(&self, event: &Event, path: &str, target: &str) -> Result<String> {
        let version = if target.is_empty() || target != event.default_branch {
            Version::Commit(&event.sha)
        } else if event.default_branch_sha.is_empty() {
            Version::Branch(target)
        } else {
            Version::Commit(&event.default_branch_sha)
        };
        let builder = self
            .request(Method::GET, &Self::git_path(event, "items"))?
            .query(&[("path", path), ("includeContent", "true"), ("$format", "octetStream")])
            .query(&version.query());
        self.get_text(builder)
            .await
            .with_context(|| format!("cannot find {path} inside the {} repository", event.repository))
    }

    async fn get_files(&self, event: &Event) -> Result<ChangedFiles> {
        self.files.get_or_try_init(|| self.fetch_changed_files(event)).await.cloned()
    }

    async fn create_status(&self, event: &Event, opts: &StatusOpts) -> Result<()> {
        self.client().context("cannot set status on azuredevops no token or url set")?;
        let (state, title, summary) = git_state(opts);
        let opts = StatusOpts { title: self.settings.status.title(title), ..opts.clone() };
        let on_run = if opts.pipeline_run_name.is_empty() {
            String::new()
        } else {
            format!("/{}", opts.pipeline_run_name)
        };
        let description = format!("{}{on_run} {summary}", self.settings.status.application_name);
        let key = self.settings.status.status_key(&opts);
        let status = GitStatus {
            state,
            description: &description,
            target_url: target_url(event, &opts),
            context: StatusContext { name: &key, genre: STATUS_GENRE },
        };

        match event.trigger_target {
            Some(TriggerType::Push) => {
                let path = Self::git_path(event, &format!("commits/{}/statuses", event.sha));
                self.send_json(Method::POST, &path, &status).await.context("failed to create commit status")?;
            }
            Some(TriggerType::PullRequest | TriggerType::PullRequestClosed | TriggerType::PullRequestLabeled) => {
                self.publish_pull_request_status(event, &status).await?;
            }
            None => bail!("cannot set status on an event without a trigger type"),
        }

        if let Some(comment) = self.settings.status.completion_comment(event, &opts) {
            self.post_thread(event, &comment).await?;
        }
        Ok(())
    }

    /// Threads cannot be edited by marker; every call starts a new one.
    async fn create_comment(&self, event: &Event, body: &str, _marker: Option<&str>) -> Result<()> {
        if event.pull_request_number == 0 {
            bail!("create comment only works on pull requests");
        }
        self.post_thread(event, body).await
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

#[cfg(test)]
mod tests {
    use forgehook_core::config::RepositorySettings;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, body_partial_json, header, method, path, query_param},
    };

    use super::*;
    use crate::status::RunStatus;

    const GIT: &str = "/project-id/_apis/git/repositories/repo-id";

    pub(super) fn repo_config(server: &MockServer, token: Option<&str>) -> RepositoryConfig {
        RepositoryConfig {
            url: "https://dev.azure.com/org/project/_git/repo".into(),
            provider: ProviderKind::AzureDevOps,
            api_url: Some(server.uri()),
            user: None,
            token: token.map(str::to_string),
            webhook_secret: None,
            provenance: Provenance::Source,
            settings: RepositorySettings::default(),
        }
    }

    pub(super) fn pr_event() -> Event {
        Event {
            sender: "author-id".into(),
            account_id: "author@example.com".into(),
            organization: "https://dev.azure.com/org".into(),
            repository: "repo".into(),
            repository_id: "repo-id".into(),
            project_id: "project-id".into(),
            url: "https://dev.azure.com/org/project/_git/repo".into(),
            sha: "abc123".into(),
            default_branch: "main".into(),
            pull_request_number: 21,
            trigger_target: Some(TriggerType::PullRequest),
            event_type: "git.pullrequest.created".into(),
            ..Default::default()
        }
    }

    pub(super) async fn connected(server: &MockServer) -> (AzureDevOps, Event) {
        let mut provider = AzureDevOps::new(ProviderSettings::default());
        let mut event = pr_event();
        provider.set_client(&mut event, &repo_config(server, Some("pat"))).await.unwrap();
        (provider, event)
    }

    #[tokio::test]
    async fn test_set_client() {
        let server = MockServer::start().await;
        let (_, event) = connected(&server).await;
        assert_eq!(event.provider.url, server.uri());
        assert_eq!(event.provider.token, "pat");

        let mut provider = AzureDevOps::new(ProviderSettings::default());
        let err = provider.set_client(&mut pr_event(), &repo_config(&server, None)).await.unwrap_err();
        assert_eq!(err.to_string(), "no spec.git_provider.secret has been set in the repo crd");
    }

    #[test]
    fn test_git_state() {
        let cases: &[(Conclusion, RunStatus, &str, &str)] = &[
            (Conclusion::Success, RunStatus::Completed, "succeeded", "Success"),
            (Conclusion::Completed, RunStatus::Completed, "succeeded", "Completed"),
            (Conclusion::Failure, RunStatus::Completed, "failed", "Failed"),
            (Conclusion::Pending, RunStatus::Queued, "pending", "Pending"),
            (Conclusion::Neutral, RunStatus::Completed, "notSet", "Unknown"),
            (Conclusion::Skipped, RunStatus::Completed, "notApplicable", "Not Applicable"),
            (Conclusion::Error, RunStatus::Completed, "error", "Error"),
            (Conclusion::NotApplicable, RunStatus::Completed, "notApplicable", "Not Applicable"),
            (Conclusion::Success, RunStatus::InProgress, "pending", "In Progress"),
        ];
        for &(conclusion, status, state, title) in cases {
            let opts = StatusOpts { conclusion, status, ..Default::default() };
            let (got_state, got_title, _) = git_state(&opts);
            assert_eq!((got_state, got_title), (state, title), "{conclusion:?} {status:?}");
        }
    }

    #[tokio::test]
    async fn test_pull_request_status_replaces_existing() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        let statuses = format!("{GIT}/pullRequests/21/statuses");
        Mock::given(method("GET"))
            .and(path(statuses.as_str()))
            .and(query_param("api-version", "7.1"))
            .and(header("authorization", "Basic OnBhdA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 2, "value": [
                {"id": 7, "context": {"name": "Pipelines as Code CI / pr-run", "genre": "PAC"}},
                {"id": 8, "context": {"name": "other / check", "genre": "other"}},
            ]})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(statuses.as_str()))
            .and(header("content-type", "application/json-patch+json"))
            .and(body_json(json!([{"op": "remove", "path": "/7"}])))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(statuses.as_str()))
            .and(body_partial_json(json!({
                "state": "failed",
                "description": "Pipelines as Code CI/pr-run has failed.",
                "context": {"name": "Pipelines as Code CI / pr-run", "genre": "PAC"},
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let opts = StatusOpts {
            conclusion: Conclusion::Failure,
            status: RunStatus::Completed,
            pipeline_run_name: "pr-run".into(),
            ..Default::default()
        };
        provider.create_status(&event, &opts).await.unwrap();

        let methods = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.method.to_string())
            .collect::<Vec<_>>();
        assert_eq!(methods, ["GET", "PATCH", "POST"]);
    }

    #[tokio::test]
    async fn test_pull_request_status_replaces_other_context() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        let statuses = format!("{GIT}/pullRequests/21/statuses");
        Mock::given(method("GET"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 1, "value": [
                {"id": 7, "context": {"name": "Pipelines as Code CI"}},
            ]})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(statuses.as_str()))
            .and(body_json(json!([{"op": "remove", "path": "/7"}])))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let opts = StatusOpts {
            conclusion: Conclusion::Success,
            status: RunStatus::Completed,
            pipeline_run_name: "pr-run".into(),
            ..Default::default()
        };
        provider.create_status(&event, &opts).await.unwrap();

        let methods = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.method.to_string())
            .collect::<Vec<_>>();
        assert_eq!(methods, ["GET", "PATCH", "POST"]);
    }

    #[tokio::test]
    async fn test_pull_request_status_without_existing() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        let statuses = format!("{GIT}/pullRequests/21/statuses");
        Mock::given(method("GET"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 0, "value": []})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH")).respond_with(ResponseTemplate::new(204)).expect(0).mount(&server).await;
        Mock::given(method("POST"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let opts = StatusOpts { conclusion: Conclusion::Pending, ..Default::default() };
        provider.create_status(&event, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_status_and_completion_comment() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        event.trigger_target = Some(TriggerType::Push);
        Mock::given(method("POST"))
            .and(path(format!("{GIT}/commits/abc123/statuses").as_str()))
            .and(body_partial_json(json!({"state": "succeeded"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{GIT}/pullRequests/21/threads").as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let opts = StatusOpts {
            conclusion: Conclusion::Success,
            status: RunStatus::Completed,
            text: "report".into(),
            ..Default::default()
        };
        provider.create_status(&event, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_request_completion_comment() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        let statuses = format!("{GIT}/pullRequests/21/statuses");
        Mock::given(method("GET"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 0, "value": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(statuses.as_str()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{GIT}/pullRequests/21/threads").as_str()))
            .and(body_partial_json(json!({
                "comments": [{"content": "**Pipelines as Code CI/pr** - Success\n\nreport"}],
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let opts = StatusOpts {
            conclusion: Conclusion::Success,
            status: RunStatus::Completed,
            text: "report".into(),
            original_pipeline_run_name: "pr".into(),
            ..Default::default()
        };
        provider.create_status(&event, &opts).await.unwrap();
    }

    async fn mount_ref(server: &MockServer, branch: &str, sha: &str) {
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/refs").as_str()))
            .and(query_param("filter", format!("heads/{branch}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"name": format!("refs/heads/{branch}"), "objectId": sha},
            ]})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_get_commit_info() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        event.sha = String::new();
        event.head_branch = "feature".into();
        mount_ref(&server, "feature", "abc123").await;
        mount_ref(&server, "main", "fff999").await;
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/commits/abc123").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commitId": "abc123",
                "comment": "Add pipeline\n\n[skip ci]",
                "remoteUrl": "https://dev.azure.com/org/project/_git/repo/commit/abc123",
                "author": {"name": "A", "email": "a@example.com", "date": "2024-05-01T10:00:00Z"},
            })))
            .mount(&server)
            .await;
        provider.get_commit_info(&mut event).await.unwrap();
        assert_eq!(event.sha, "abc123");
        assert_eq!(event.sha_title, "Add pipeline");
        assert_eq!(event.sha_url, "https://dev.azure.com/org/project/_git/repo/commit/abc123");
        assert!(event.has_skip_command);
        assert_eq!(event.author_email, "a@example.com");
        assert_eq!(event.default_branch_sha, "fff999");

        let mut unknown = pr_event();
        unknown.sha = String::new();
        unknown.pull_request_number = 0;
        let err = provider.get_commit_info(&mut unknown).await.unwrap_err();
        assert_eq!(err.to_string(), "unable to determine commit SHA");
    }

    #[tokio::test]
    async fn test_get_tekton_dir() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        event.default_branch_sha = "fff999".into();
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/items").as_str()))
            .and(query_param("path", ".tekton"))
            .and(query_param("versionDescriptor.version", "fff999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objectId": "tree1", "gitObjectType": "tree", "isFolder": true,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/items").as_str()))
            .and(query_param("path", "README.md"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objectId": "blob9", "gitObjectType": "blob",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/trees/tree1").as_str()))
            .and(query_param("recursive", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"treeEntries": [
                {"relativePath": "pr.yaml", "objectId": "b1", "gitObjectType": "blob"},
                {"relativePath": "sub", "objectId": "t2", "gitObjectType": "tree"},
                {"relativePath": "sub/push.yml", "objectId": "b2", "gitObjectType": "blob"},
                {"relativePath": "README.md", "objectId": "b3", "gitObjectType": "blob"},
            ]})))
            .mount(&server)
            .await;
        for (sha, data) in [("b1", "kind: PipelineRun"), ("b2", "---\nkind: Pipeline")] {
            Mock::given(method("GET"))
                .and(path(format!("{GIT}/blobs/{sha}").as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_string(data))
                .mount(&server)
                .await;
        }

        let out = provider.get_tekton_dir(&event, ".tekton", Provenance::DefaultBranch).await.unwrap();
        assert_eq!(out, "\nkind: PipelineRun\n\n---\nkind: Pipeline\n");
        assert_eq!(provider.get_tekton_dir(&event, ".ci", Provenance::Source).await.unwrap(), "");
        let err = provider.get_tekton_dir(&event, "README.md", Provenance::Source).await.unwrap_err();
        assert_eq!(err.to_string(), "README.md has been found but is not a directory");
    }

    #[tokio::test]
    async fn test_get_file_inside_repo() {
        let server = MockServer::start().await;
        let (provider, mut event) = connected(&server).await;
        event.default_branch_sha = "fff999".into();
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/items").as_str()))
            .and(query_param("path", "OWNERS"))
            .and(query_param("versionDescriptor.version", "fff999"))
            .and(query_param("versionDescriptor.versionType", "commit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("approvers:\n- author-id\n"))
            .mount(&server)
            .await;
        let content = provider.get_file_inside_repo(&event, "OWNERS", "main").await.unwrap();
        assert_eq!(content, "approvers:\n- author-id\n");

        let err = provider.get_file_inside_repo(&event, "OWNERS", "feature").await.unwrap_err();
        assert!(crate::error::is_not_found(&err));
        assert!(err.to_string().starts_with("cannot find OWNERS inside the repo repository"));
    }

    #[tokio::test]
    async fn test_get_files() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{GIT}/commits/abc123/changes").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"changes": [
                {"item": {"path": "/src", "isFolder": true}, "changeType": "edit"},
                {"item": {"path": "/src/a.rs"}, "changeType": "edit"},
                {"item": {"path": "/b.yaml"}, "changeType": "add"},
                {"item": {"path": "/c.txt"}, "changeType": "delete"},
                {"item": {"path": "/d.txt"}, "changeType": "edit, rename"},
            ]})))
            .expect(1)
            .mount(&server)
            .await;
        let files = provider.get_files(&event).await.unwrap();
        assert_eq!(files.all, ["src/a.rs", "b.yaml", "c.txt", "d.txt"]);
        assert_eq!(files.modified, ["src/a.rs"]);
        assert_eq!(files.added, ["b.yaml"]);
        assert_eq!(files.deleted, ["c.txt"]);
        assert_eq!(files.renamed, ["d.txt"]);
        provider.get_files(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_comment() {
        let server = MockServer::start().await;
        let (provider, event) = connected(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("{GIT}/pullRequests/21/threads").as_str()))
            .and(body_json(json!({
                "comments": [{"parentCommentId": 0, "content": "hello", "commentType": 1}],
                "status": 1,
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        provider.create_comment(&event, "hello", Some("<!-- marker -->")).await.unwrap();
    }
}
