use anyhow::{Context, Result, bail};
use forgehook_core::util::first_line;
use http::HeaderMap;

use super::types::{IssueCommentEvent, PullRequestEvent, PushEvent, WebhookEvent};
use crate::{
    Detection,
    comments::CommentCommands,
    event::{Event, RawPayload, TriggerType},
    header,
};

pub const EVENT_TYPE_HEADER: &str = "X-Gitea-Event-Type";

const PROCESSED_PR_ACTIONS: [&str; 5] = ["opened", "synchronize", "synchronized", "reopened", "label_updated"];

fn decode(event_type: &str, payload: &[u8]) -> Result<Option<WebhookEvent>> {
    Ok(Some(match event_type {
        "push" => WebhookEvent::Push(serde_json::from_slice::<PushEvent>(payload)?),
        "pull_request" | "pull_request_sync" | "pull_request_label" => {
            WebhookEvent::PullRequest(serde_json::from_slice::<PullRequestEvent>(payload)?)
        }
        "issue_comment" | "pull_request_comment" => {
            WebhookEvent::IssueComment(serde_json::from_slice::<IssueCommentEvent>(payload)?)
        }
        _ => return Ok(None),
    }))
}

pub fn detect(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Detection> {
    let event_type = header(headers, EVENT_TYPE_HEADER);
    if event_type.is_empty() {
        return Ok(Detection::NotForge);
    }
    let Some(event) = decode(event_type, payload).context("invalid gitea payload")? else {
        return Ok(Detection::Skip(format!("gitea: event \"{event_type}\" is not supported")));
    };
    Ok(match event {
        WebhookEvent::Push(e) if e.pusher.is_some() => Detection::Process,
        WebhookEvent::Push(_) => Detection::Skip("invalid payload: no pusher in event".to_string()),
        WebhookEvent::PullRequest(e) if PROCESSED_PR_ACTIONS.contains(&e.action.as_str()) => {
            Detection::Process
        }
        WebhookEvent::PullRequest(e) => {
            Detection::Skip(format!("pull_request: unsupported action \"{}\"", e.action))
        }
        WebhookEvent::IssueComment(e)
            if e.action == "created"
                && e.issue.pull_request.is_some()
                && e.issue.state == "open"
                && commands.is_command(&e.comment.body) =>
        {
            Detection::Process
        }
        WebhookEvent::IssueComment(_) => Detection::Skip("skip: not a PAC gitops comment".to_string()),
    })
}

pub fn parse(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Event> {
    let event_type = header(headers, EVENT_TYPE_HEADER);
    if event_type.is_empty() {
        bail!("failed to find event type in request header");
    }
    let Some(raw) = decode(event_type, payload).context("invalid gitea payload")? else {
        bail!("event {event_type} is not supported");
    };

    let mut event = Event::default();
    match &raw {
        WebhookEvent::PullRequest(e) => {
            let pr = &e.pull_request;
            event.sender = e.sender.login.clone();
            event.default_branch = e.repository.default_branch.clone();
            event.url = e.repository.html_url.clone();
            event.sha = pr.head.sha.clone();
            event.sha_url = format!("{}/commit/{}", pr.html_url, event.sha);
            event.head_branch = pr.head.ref_.clone();
            event.base_branch = pr.base.ref_.clone();
            if let Some(repo) = &pr.head.repo {
                event.head_url = repo.html_url.clone();
                event.clone_url = repo.clone_url.clone();
            }
            if let Some(repo) = &pr.base.repo {
                event.base_url = repo.html_url.clone();
            }
            event.pull_request_number = if e.number > 0 { e.number } else { pr.number };
            event.pull_request_title = pr.title.clone();
            event.pull_request_labels = pr.labels.iter().map(|l| l.name.clone()).collect();
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.trigger_target = Some(TriggerType::PullRequest);
            event.event_type = if e.action == "label_updated" {
                TriggerType::PullRequestLabeled.as_str().to_string()
            } else {
                TriggerType::PullRequest.as_str().to_string()
            };
        }
        WebhookEvent::Push(e) => {
            let head = e.head_commit.as_ref();
            event.sha = head
                .map(|c| c.id.clone())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| e.before.clone());
            event.sha_url = head.map(|c| c.url.clone()).unwrap_or_default();
            event.sha_title = head.map(|c| first_line(&c.message).to_string()).unwrap_or_default();
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.default_branch = e.repository.default_branch.clone();
            event.url = e.repository.html_url.clone();
            event.clone_url = e.repository.clone_url.clone();
            event.sender = e.sender.login.clone();
            event.base_branch = e.ref_.clone();
            event.head_branch = e.ref_.clone();
            event.base_url = e.repository.html_url.clone();
            event.head_url = e.repository.html_url.clone();
            event.trigger_target = Some(TriggerType::Push);
            event.event_type = TriggerType::Push.as_str().to_string();
        }
        WebhookEvent::IssueComment(e) => {
            if e.issue.pull_request.is_none() {
                bail!("issue comment is not coming from a pull_request");
            }
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.sender = e.sender.login.clone();
            event.trigger_target = Some(TriggerType::PullRequest);
            commands.apply(&mut event, &e.comment.body);
            event.pull_request_number = e.issue.number;
            event.url = e.repository.html_url.clone();
            event.clone_url = e.repository.clone_url.clone();
            event.default_branch = e.repository.default_branch.clone();
        }
    }
    event.payload = Some(RawPayload::Gitea(Box::new(raw)));
    Ok(event)
}
