use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Service hook envelope. `resource` depends on `eventType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHookEvent {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub resource: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub unique_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub project: Project,
    #[serde(default)]
    pub default_branch: String,
    #[serde(default)]
    pub remote_url: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitUserDate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub remote_url: String,
    #[serde(default)]
    pub author: Option<GitUserDate>,
    #[serde(default)]
    pub committer: Option<GitUserDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub old_object_id: String,
    #[serde(default)]
    pub new_object_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResource {
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub ref_updates: Vec<RefUpdate>,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub pushed_by: IdentityRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestResource {
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub pull_request_id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_by: IdentityRef,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_ref_name: String,
    #[serde(default)]
    pub target_ref_name: String,
    #[serde(default)]
    pub last_merge_source_commit: Commit,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: IdentityRef,
    #[serde(default)]
    pub comment_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestCommentResource {
    #[serde(default)]
    pub comment: Comment,
    #[serde(default)]
    pub pull_request: PullRequestResource,
}

/// Parsed `resource` of a supported service hook.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Push(PushResource),
    PullRequest(PullRequestResource),
    PullRequestComment(PullRequestCommentResource),
}

/// `{"count": n, "value": [...]}` list envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueList<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    pub name: String,
    pub object_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default)]
    pub source_ref_name: String,
    #[serde(default)]
    pub target_ref_name: String,
    #[serde(default)]
    pub last_merge_source_commit: Option<Commit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitItem {
    pub object_id: String,
    #[serde(default)]
    pub git_object_type: String,
    #[serde(default)]
    pub is_folder: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub relative_path: String,
    pub object_id: String,
    #[serde(default)]
    pub git_object_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    #[serde(default)]
    pub tree_entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_folder: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub item: ChangeItem,
    #[serde(default)]
    pub change_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Changes {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusContextRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub genre: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRef {
    pub id: i64,
    #[serde(default)]
    pub context: StatusContextRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusContext<'a> {
    pub name: &'a str,
    pub genre: &'a str,
}

/// Body of both commit and pull request statuses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus<'a> {
    pub state: &'a str,
    pub description: &'a str,
    pub target_url: &'a str,
    pub context: StatusContext<'a>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentThread {
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamMember {
    pub identity: IdentityRef,
}
