use anyhow::{Context, Result, bail};
use forgehook_core::util::{branch_name, first_line};
use http::HeaderMap;

use super::types::{IssueCommentEvent, PullRequestEvent, PushEvent, WebhookPayload};
use crate::{
    Detection,
    comments::CommentCommands,
    event::{Event, RawPayload, TriggerType, is_zero_sha},
    gitea::parse::EVENT_TYPE_HEADER as GITEA_EVENT_TYPE_HEADER,
    header,
};

pub const EVENT_HEADER: &str = "X-GitHub-Event";

const PROCESSED_PR_ACTIONS: [&str; 5] = ["opened", "synchronize", "synchronized", "reopened", "labeled"];

fn decode(event_type: &str, payload: &[u8]) -> Result<Option<WebhookPayload>> {
    Ok(Some(match event_type {
        "push" => WebhookPayload::Push(serde_json::from_slice::<PushEvent>(payload)?),
        "pull_request" => WebhookPayload::PullRequest(serde_json::from_slice::<PullRequestEvent>(payload)?),
        "issue_comment" => {
            WebhookPayload::IssueComment(serde_json::from_slice::<IssueCommentEvent>(payload)?)
        }
        _ => return Ok(None),
    }))
}

pub fn detect(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Detection> {
    let event_type = header(headers, EVENT_HEADER);
    // Gitea also sends X-GitHub-Event
    if event_type.is_empty() || !header(headers, GITEA_EVENT_TYPE_HEADER).is_empty() {
        return Ok(Detection::NotForge);
    }
    let Some(event) = decode(event_type, payload).context("invalid github payload")? else {
        return Ok(Detection::Skip(format!("github: event \"{event_type}\" is not supported")));
    };
    Ok(match event {
        WebhookPayload::Push(e) if e.pusher.is_some() => Detection::Process,
        WebhookPayload::Push(_) => Detection::Skip("invalid payload: no pusher in event".to_string()),
        WebhookPayload::PullRequest(e) if PROCESSED_PR_ACTIONS.contains(&e.action.as_str()) => {
            Detection::Process
        }
        WebhookPayload::PullRequest(e) => {
            Detection::Skip(format!("pull_request: unsupported action \"{}\"", e.action))
        }
        WebhookPayload::IssueComment(e)
            if e.action == "created"
                && e.issue.pull_request.is_some()
                && e.issue.state == "open"
                && commands.is_command(&e.comment.body) =>
        {
            Detection::Process
        }
        WebhookPayload::IssueComment(_) => {
            Detection::Skip("skip: not a PAC gitops comment".to_string())
        }
    })
}

pub fn parse(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Event> {
    let event_type = header(headers, EVENT_HEADER);
    if event_type.is_empty() {
        bail!("failed to find event type in request header");
    }
    let Some(raw) = decode(event_type, payload).context("invalid github payload")? else {
        bail!("event {event_type} is not supported");
    };

    let mut event = Event::default();
    match &raw {
        WebhookPayload::PullRequest(e) => {
            let pr = &e.pull_request;
            event.sender = e.sender.login.clone();
            event.account_id = e.sender.id.to_string();
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.default_branch = e.repository.default_branch.clone();
            event.url = e.repository.html_url.clone();
            event.clone_url = e.repository.clone_url.clone();
            event.sha = pr.head.sha.clone();
            event.sha_url = format!("{}/commit/{}", e.repository.html_url, event.sha);
            event.head_branch = pr.head.ref_.clone();
            event.base_branch = pr.base.ref_.clone();
            event.head_url = pr.head.repo.as_ref().map(|r| r.html_url.clone()).unwrap_or_default();
            event.base_url = pr.base.repo.as_ref().map(|r| r.html_url.clone()).unwrap_or_default();
            event.pull_request_number = if e.number > 0 { e.number } else { pr.number };
            event.pull_request_title = pr.title.clone();
            event.pull_request_labels = pr.labels.iter().map(|l| l.name.clone()).collect();
            event.trigger_target = Some(TriggerType::PullRequest);
            event.event_type = if e.action == "labeled" {
                TriggerType::PullRequestLabeled.as_str().to_string()
            } else {
                TriggerType::PullRequest.as_str().to_string()
            };
        }
        WebhookPayload::Push(e) => {
            if e.deleted || is_zero_sha(&e.after) {
                bail!("branch delete not supported");
            }
            let head = e.head_commit.as_ref();
            event.sender = e.sender.login.clone();
            event.account_id = e.sender.id.to_string();
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.default_branch = e.repository.default_branch.clone();
            event.url = e.repository.html_url.clone();
            event.clone_url = e.repository.clone_url.clone();
            event.sha = head.map(|c| c.id.clone()).filter(|id| !id.is_empty()).unwrap_or_else(|| e.after.clone());
            event.sha_url = head.map(|c| c.url.clone()).unwrap_or_default();
            event.sha_title = head.map(|c| first_line(&c.message).to_string()).unwrap_or_default();
            event.base_branch = branch_name(&e.ref_).to_string();
            event.head_branch = event.base_branch.clone();
            event.base_url = e.repository.html_url.clone();
            event.head_url = e.repository.html_url.clone();
            event.trigger_target = Some(TriggerType::Push);
            event.event_type = TriggerType::Push.as_str().to_string();
        }
        WebhookPayload::IssueComment(e) => {
            if e.issue.pull_request.is_none() {
                bail!("issue comment is not coming from a pull_request");
            }
            event.sender = e.sender.login.clone();
            event.account_id = e.sender.id.to_string();
            event.organization = e.repository.owner.login.clone();
            event.repository = e.repository.name.clone();
            event.default_branch = e.repository.default_branch.clone();
            event.url = e.repository.html_url.clone();
            event.clone_url = e.repository.clone_url.clone();
            event.pull_request_number = e.issue.number;
            event.trigger_target = Some(TriggerType::PullRequest);
            commands.apply(&mut event, &e.comment.body);
        }
    }
    event.payload = Some(RawPayload::GitHub(Box::new(raw)));
    Ok(event)
}
