use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow, bail};
use forgehook_core::util::{branch_name, first_line};
use http::HeaderMap;
use regex::Regex;
use serde::de::DeserializeOwned;

use super::types::{
    PullRequestCommentResource, PullRequestResource, PushResource, ServiceHookEvent, WebhookEvent,
};
use crate::{
    Detection,
    comments::CommentCommands,
    event::{Event, RawPayload, TriggerType, is_zero_sha},
    header,
};

pub const EVENT_TYPE_HEADER: &str = "X-Azure-DevOps-EventType";

const PUSH_EVENT: &str = "git.push";
const PULL_REQUEST_EVENTS: [&str; 2] = ["git.pullrequest.created", "git.pullrequest.updated"];
const COMMENT_EVENT: &str = "git.pullrequest.comment";

/// `https://dev.azure.com/<organization>` part of a repository URL.
pub fn organization_url(url: &str) -> Result<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(https://dev\.azure\.com/[^/]+)").unwrap());
    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("base URL could not be extracted"))
}

fn resource<T: DeserializeOwned>(hook: &ServiceHookEvent, what: &str) -> Result<T> {
    serde_json::from_value(hook.resource.clone())
        .with_context(|| format!("error unmarshalling {what} event resource"))
}

fn decode(event_type: &str, payload: &[u8]) -> Result<Option<WebhookEvent>> {
    let hook: ServiceHookEvent =
        serde_json::from_slice(payload).context("error unmarshalling payload into Event")?;
    if hook.event_type.is_none() {
        bail!("event type is nil");
    }
    Ok(Some(match event_type {
        PUSH_EVENT => WebhookEvent::Push(resource(&hook, "push")?),
        t if PULL_REQUEST_EVENTS.contains(&t) => {
            WebhookEvent::PullRequest(resource(&hook, "pull request")?)
        }
        COMMENT_EVENT => WebhookEvent::PullRequestComment(resource(&hook, "pull request comment")?),
        _ => return Ok(None),
    }))
}

pub fn detect(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Detection> {
    let event_type = header(headers, EVENT_TYPE_HEADER);
    if event_type.is_empty() {
        return Ok(Detection::NotForge);
    }
    let Some(event) = decode(event_type, payload)? else {
        return Ok(Detection::Skip(format!("event \"{event_type}\" is not supported")));
    };
    Ok(match event {
        WebhookEvent::PullRequestComment(e) if !commands.is_command(&e.comment.content) => {
            Detection::Skip("comment is not a gitops command".to_string())
        }
        _ => Detection::Process,
    })
}

/// Fields shared by pull request and pull request comment events.
fn fill_pull_request(event: &mut Event, pr: &PullRequestResource) -> Result<()> {
    event.pull_request_number = pr.pull_request_id;
    event.pull_request_title = pr.title.clone();
    event.pull_request_labels = pr.labels.iter().map(|l| l.name.clone()).collect();
    event.sha = pr.last_merge_source_commit.commit_id.clone();
    event.sha_url = pr.last_merge_source_commit.url.clone();
    event.sha_title = first_line(&pr.last_merge_source_commit.comment).to_string();
    event.base_branch = branch_name(&pr.target_ref_name).to_string();
    event.head_branch = branch_name(&pr.source_ref_name).to_string();
    event.default_branch = branch_name(&pr.repository.default_branch).to_string();

    let web_url = pr.repository.web_url.clone().unwrap_or_default();
    event.organization = organization_url(&web_url)
        .map_err(|_| anyhow!("not able to extract organization url"))?
        .to_string();
    event.repository = pr.repository.name.clone();
    event.repository_id = pr.repository.id.clone();
    event.project_id = pr.repository.project.id.clone();
    event.clone_url = pr.repository.remote_url.clone();
    event.base_url = web_url.clone();
    event.head_url = web_url.clone();
    event.url = web_url;
    event.trigger_target = Some(TriggerType::PullRequest);
    Ok(())
}

fn fill_push(event: &mut Event, push: &PushResource) -> Result<()> {
    let update = push.ref_updates.first();
    if let Some(update) = update
        && is_zero_sha(&update.new_object_id)
    {
        bail!("branch delete not supported");
    }
    match push.commits.first() {
        Some(commit) => {
            event.sha = commit.commit_id.clone();
            event.sha_url = commit.url.clone();
            event.sha_title = first_line(&commit.comment).to_string();
        }
        None => match update {
            Some(update) if !update.new_object_id.is_empty() => {
                event.sha = update.new_object_id.clone();
            }
            _ => bail!("push event contains no commits"),
        },
    }

    let repo = &push.repository;
    event.sender = push.pushed_by.id.clone();
    event.account_id = push.pushed_by.unique_name.clone();
    event.organization = organization_url(&repo.remote_url)
        .map_err(|_| anyhow!("not able to extract organization url"))?
        .to_string();
    event.repository = repo.name.clone();
    event.repository_id = repo.id.clone();
    event.project_id = repo.project.id.clone();
    event.url = repo.remote_url.clone();
    event.clone_url = repo.remote_url.clone();
    event.default_branch = branch_name(&repo.default_branch).to_string();
    event.base_url = repo.url.clone();
    event.head_url = repo.url.clone();
    if let Some(update) = update {
        event.base_branch = branch_name(&update.name).to_string();
        event.head_branch = branch_name(&update.name).to_string();
    }
    event.trigger_target = Some(TriggerType::Push);
    event.event_type = PUSH_EVENT.to_string();
    Ok(())
}

pub fn parse(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Event> {
    let event_type = header(headers, EVENT_TYPE_HEADER);
    let Some(raw) = decode(event_type, payload)? else {
        bail!("event type {event_type} is not supported");
    };

    let mut event = Event::default();
    match &raw {
        WebhookEvent::Push(push) => fill_push(&mut event, push)?,
        WebhookEvent::PullRequest(pr) => {
            fill_pull_request(&mut event, pr)?;
            event.sender = pr.created_by.id.clone();
            event.account_id = pr.created_by.unique_name.clone();
            event.event_type = event_type.to_string();
        }
        WebhookEvent::PullRequestComment(PullRequestCommentResource { comment, pull_request }) => {
            fill_pull_request(&mut event, pull_request)?;
            event.sender = comment.author.id.clone();
            event.account_id = comment.author.unique_name.clone();
            commands.apply(&mut event, &comment.content);
        }
    }
    event.payload = Some(RawPayload::AzureDevOps(Box::new(raw)));
    Ok(event)
}

#[cfg(test)]
pub(crate) mod tests {
    use http::HeaderValue;
    use serde_json::{Value, json};

    use super::*;

    pub fn headers(event_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, HeaderValue::from_str(event_type).unwrap());
        headers
    }

    fn repository() -> Value {
        json!({
            "id": "repo-id",
            "name": "repo",
            "url": "https://dev.azure.com/org/project/_apis/git/repositories/repo-id",
            "project": {"id": "project-id", "name": "project"},
            "defaultBranch": "refs/heads/main",
            "remoteUrl": "https://dev.azure.com/org/project/_git/repo",
            "webUrl": "https://dev.azure.com/org/project/_git/repo"
        })
    }

    pub fn pull_request() -> Value {
        json!({
            "repository": repository(),
            "pullRequestId": 21,
            "status": "active",
            "createdBy": {"id": "author-id", "displayName": "Author", "uniqueName": "author@example.com"},
            "title": "Add pipeline",
            "sourceRefName": "refs/heads/feature/x",
            "targetRefName": "refs/heads/main",
            "lastMergeSourceCommit": {
                "commitId": "abc123",
                "comment": "Add pipeline\n\nBody",
                "url": "https://dev.azure.com/org/project/_apis/git/repositories/repo-id/commits/abc123"
            }
        })
    }

    pub fn hook(event_type: &str, resource: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"eventType": event_type, "resource": resource})).unwrap()
    }

    fn push() -> Value {
        json!({
            "commits": [{"commitId": "def456", "comment": "Fix\n\nmore", "url": "https://c/def456"}],
            "refUpdates": [{"name": "refs/heads/main", "oldObjectId": "111", "newObjectId": "def456"}],
            "repository": repository(),
            "pushedBy": {"id": "pusher-id", "uniqueName": "pusher@example.com"}
        })
    }

    fn comment(content: &str) -> Value {
        json!({
            "comment": {"id": 3, "content": content, "author": {"id": "reviewer-id", "uniqueName": "reviewer@example.com"}},
            "pullRequest": pull_request()
        })
    }

    #[test]
    fn test_detect() {
        let commands = CommentCommands::default_prefix();
        let cases: &[(&str, Vec<u8>, Detection)] = &[
            ("git.push", hook("git.push", push()), Detection::Process),
            ("git.pullrequest.created", hook("git.pullrequest.created", pull_request()), Detection::Process),
            ("git.pullrequest.updated", hook("git.pullrequest.updated", pull_request()), Detection::Process),
            ("git.pullrequest.comment", hook("git.pullrequest.comment", comment("/retest")), Detection::Process),
            (
                "git.pullrequest.comment",
                hook("git.pullrequest.comment", comment("nice")),
                Detection::Skip("comment is not a gitops command".into()),
            ),
            (
                "git.pullrequest.merged",
                hook("git.pullrequest.merged", pull_request()),
                Detection::Skip("event \"git.pullrequest.merged\" is not supported".into()),
            ),
        ];
        for (event_type, payload, expected) in cases {
            assert_eq!(&detect(&headers(event_type), payload, commands).unwrap(), expected, "{event_type}");
        }
        assert_eq!(detect(&HeaderMap::new(), b"{}", commands).unwrap(), Detection::NotForge);
        assert!(detect(&headers("git.push"), b"not json", commands).is_err());
        let err = detect(&headers("git.push"), br#"{"resource":{}}"#, commands).unwrap_err();
        assert_eq!(err.to_string(), "event type is nil");
    }

    #[test]
    fn test_parse_pull_request() {
        let commands = CommentCommands::default_prefix();
        let payload = hook("git.pullrequest.created", pull_request());
        let event = parse(&headers("git.pullrequest.created"), &payload, commands).unwrap();
        assert_eq!(event.organization, "https://dev.azure.com/org");
        assert_eq!(event.repository, "repo");
        assert_eq!(event.repository_id, "repo-id");
        assert_eq!(event.project_id, "project-id");
        assert_eq!(event.sender, "author-id");
        assert_eq!(event.account_id, "author@example.com");
        assert_eq!(event.sha, "abc123");
        assert_eq!(event.sha_title, "Add pipeline");
        assert_eq!(event.head_branch, "feature/x");
        assert_eq!(event.base_branch, "main");
        assert_eq!(event.default_branch, "main");
        assert_eq!(event.pull_request_number, 21);
        assert_eq!(event.url, "https://dev.azure.com/org/project/_git/repo");
        assert_eq!(event.event_type, "git.pullrequest.created");
        assert_eq!(event.trigger_target, Some(TriggerType::PullRequest));
    }

    #[test]
    fn test_parse_push() {
        let commands = CommentCommands::default_prefix();
        let event = parse(&headers("git.push"), &hook("git.push", push()), commands).unwrap();
        assert_eq!(event.sha, "def456");
        assert_eq!(event.sha_title, "Fix");
        assert_eq!(event.sender, "pusher-id");
        assert_eq!(event.head_branch, "main");
        assert_eq!(event.base_url, event.head_url);
        assert_eq!(event.trigger_target, Some(TriggerType::Push));

        let mut deleted = push();
        deleted["refUpdates"][0]["newObjectId"] = json!("0000000000000000000000000000000000000000");
        let err = parse(&headers("git.push"), &hook("git.push", deleted), commands).unwrap_err();
        assert_eq!(err.to_string(), "branch delete not supported");

        let mut empty = push();
        empty["commits"] = json!([]);
        empty["refUpdates"] = json!([]);
        let err = parse(&headers("git.push"), &hook("git.push", empty), commands).unwrap_err();
        assert_eq!(err.to_string(), "push event contains no commits");

        let mut foreign = push();
        foreign["repository"]["remoteUrl"] = json!("https://example.com/org/repo");
        let err = parse(&headers("git.push"), &hook("git.push", foreign), commands).unwrap_err();
        assert_eq!(err.to_string(), "not able to extract organization url");
    }

    #[test]
    fn test_parse_comment() {
        let commands = CommentCommands::default_prefix();
        let cases: &[(&str, &str, &str, &str, bool)] = &[
            ("/retest", "retest-all-comment", "", "", false),
            ("/test my-run", "test-comment", "my-run", "", false),
            ("/ok-to-test", "ok-to-test-comment", "", "", false),
            ("/cancel slow", "cancel-comment", "", "slow", true),
        ];
        for &(content, event_type, test_target, cancel_target, cancel) in cases {
            let payload = hook(COMMENT_EVENT, comment(content));
            let event = parse(&headers(COMMENT_EVENT), &payload, commands).unwrap();
            assert_eq!(event.event_type, event_type, "{content}");
            assert_eq!(event.target_test_pipeline_run, test_target, "{content}");
            assert_eq!(event.target_cancel_pipeline_run, cancel_target, "{content}");
            assert_eq!(event.cancel_pipeline_runs, cancel, "{content}");
            assert_eq!(event.trigger_comment, content);
            assert_eq!(event.sender, "reviewer-id");
            assert_eq!(event.pull_request_number, 21);
            assert_eq!(event.trigger_target, Some(TriggerType::PullRequest));
        }
    }

    #[test]
    fn test_organization_url() {
        assert_eq!(
            organization_url("https://dev.azure.com/org/project/_git/repo").unwrap(),
            "https://dev.azure.com/org"
        );
        assert!(organization_url("https://org.visualstudio.com/project").is_err());
    }
}
