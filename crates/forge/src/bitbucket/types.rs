use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email_address: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryLinks {
    #[serde(default)]
    pub clone: Vec<Link>,
    #[serde(rename = "self", default)]
    pub self_: Vec<Link>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub project: Option<Project>,
    pub links: Option<RepositoryLinks>,
}

impl Repository {
    pub fn self_link(&self) -> Option<&str> {
        self.links.as_ref()?.self_.first().map(|l| l.href.as_str())
    }

    pub fn http_clone_link(&self) -> Option<&str> {
        self.links.as_ref()?.clone.iter().find(|l| l.name == "http").map(|l| l.href.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_id: String,
    #[serde(default)]
    pub latest_commit: String,
    #[serde(default)]
    pub repository: Repository,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub from_ref: PullRequestRef,
    #[serde(default)]
    pub to_ref: PullRequestRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author: User,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestEvent {
    #[serde(default)]
    pub actor: User,
    #[serde(default)]
    pub pull_request: PullRequest,
    #[serde(default)]
    pub event_key: String,
    /// Set on `pr:comment:added` and `pr:comment:edited`.
    #[serde(default)]
    pub comment: Option<Comment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(default)]
    pub from_hash: String,
    #[serde(default)]
    pub to_hash: String,
    #[serde(default)]
    pub ref_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    #[serde(default)]
    pub event_key: String,
    #[serde(default)]
    pub actor: User,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub changes: Option<Vec<Change>>,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PullRequest(PullRequestEvent),
    Push(PushEvent),
}

/// Paged listing envelope of the REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    #[serde(default = "Vec::new")]
    pub values: Vec<T>,
    #[serde(default)]
    pub is_last_page: bool,
    #[serde(default)]
    pub next_page_start: Option<u64>,
}

impl<T> Paged<T> {
    pub fn next(&self) -> Option<u64> {
        if self.is_last_page { None } else { self.next_page_start }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: User,
    #[serde(default)]
    pub author_timestamp: Option<i64>,
    #[serde(default)]
    pub committer: User,
    #[serde(default)]
    pub committer_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    #[serde(default)]
    pub id: String,
    pub display_id: String,
    #[serde(default)]
    pub latest_commit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePath {
    #[serde(rename = "toString")]
    pub to_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileChange {
    pub path: ChangePath,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPermission {
    pub user: User,
    #[serde(default)]
    pub permission: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub comment: Option<Comment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildStatus<'a> {
    pub state: &'a str,
    pub key: &'a str,
    pub name: &'a str,
    pub url: &'a str,
    pub description: &'a str,
}
