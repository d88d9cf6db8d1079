use anyhow::{Context, Result, anyhow, bail};
use forgehook_core::util::base_url;
use http::HeaderMap;

use super::types::{PullRequestEvent, PushEvent, WebhookEvent};
use crate::{
    Detection,
    comments::{CommentCommands, CommentEventType},
    event::{Event, RawPayload, TriggerType, is_zero_sha},
    header,
};

pub const EVENT_KEY_HEADER: &str = "X-Event-Key";

const PULL_REQUEST_EVENTS: [&str; 2] = ["pr:from_ref_updated", "pr:opened"];
const COMMENT_EVENTS: [&str; 2] = ["pr:comment:added", "pr:comment:edited"];
const PUSH_EVENT: &str = "repo:refs_changed";

fn decode(event_key: &str, payload: &[u8]) -> Result<Option<WebhookEvent>> {
    if PULL_REQUEST_EVENTS.contains(&event_key) || COMMENT_EVENTS.contains(&event_key) {
        let event: PullRequestEvent =
            serde_json::from_slice(payload).context("invalid pull request payload")?;
        Ok(Some(WebhookEvent::PullRequest(event)))
    } else if event_key == PUSH_EVENT {
        let event: PushEvent = serde_json::from_slice(payload).context("invalid push payload")?;
        Ok(Some(WebhookEvent::Push(event)))
    } else {
        Ok(None)
    }
}

pub fn detect(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Detection> {
    let event_key = header(headers, EVENT_KEY_HEADER);
    if event_key.is_empty() {
        return Ok(Detection::NotForge);
    }
    let Some(event) = decode(event_key, payload)? else {
        return Ok(Detection::Skip(format!("event \"{event_key}\" is not supported")));
    };
    Ok(match event {
        WebhookEvent::PullRequest(_) if PULL_REQUEST_EVENTS.contains(&event_key) => {
            Detection::Process
        }
        WebhookEvent::PullRequest(e) => {
            let text = e.comment.as_ref().map(|c| c.text.as_str()).unwrap_or_default();
            if commands.is_command(text) {
                Detection::Process
            } else {
                Detection::Skip("comment is not a gitops command".to_string())
            }
        }
        WebhookEvent::Push(e) if e.changes.as_ref().is_some_and(|c| !c.is_empty()) => {
            Detection::Process
        }
        WebhookEvent::Push(_) => Detection::Skip("push event without changes".to_string()),
    })
}

/// Structural checks on a pull request payload, in the order fields are used.
fn check_valid_payload(e: &PullRequestEvent) -> Result<()> {
    let pr = &e.pull_request;
    let (to, from) = (&pr.to_ref, &pr.from_ref);
    let Some(to_project) = &to.repository.project else {
        bail!("bitbucket toRef project is nil");
    };
    if to_project.key.is_empty() {
        bail!("bitbucket toRef project key is empty");
    }
    if to.repository.name.is_empty() {
        bail!("bitbucket toRef repository name is empty");
    }
    if to.latest_commit.is_empty() {
        bail!("bitbucket toRef latest commit is empty");
    }
    let Some(from_project) = &from.repository.project else {
        bail!("bitbucket fromRef project is nil");
    };
    if from_project.key.is_empty() {
        bail!("bitbucket fromRef project key is empty");
    }
    if from.repository.name.is_empty() {
        bail!("bitbucket fromRef repository name is empty");
    }
    if from.latest_commit.is_empty() {
        bail!("bitbucket fromRef latest commit is empty");
    }
    if pr.id == 0 {
        bail!("bitbucket pull request ID is zero");
    }
    if to.repository.self_link().is_none() {
        bail!("bitbucket toRef repository links are nil or empty");
    }
    if to.display_id.is_empty() {
        bail!("bitbucket toRef display ID is empty");
    }
    if from.display_id.is_empty() {
        bail!("bitbucket fromRef display ID is empty");
    }
    if from.repository.self_link().is_none() {
        bail!("bitbucket fromRef repository links are nil or empty");
    }
    if to.repository.links.as_ref().is_none_or(|l| l.clone.is_empty()) {
        bail!("bitbucket toRef repository clone links are empty");
    }
    if from.repository.links.as_ref().is_none_or(|l| l.clone.is_empty()) {
        bail!("bitbucket fromRef repository clone links are empty");
    }
    if e.actor.id == 0 {
        bail!("bitbucket actor ID is zero");
    }
    if e.actor.name.is_empty() {
        bail!("bitbucket actor name is empty");
    }
    Ok(())
}

/// Repository URL without the trailing `/browse` of web links.
pub fn sanitize_event_url(url: &str) -> &str { url.strip_suffix("/browse").unwrap_or(url) }

/// Personal project keys carry a `~` prefix.
pub fn sanitize_owner(owner: &str) -> String { owner.replace('~', "") }

fn apply_comment(event: &mut Event, text: &str, commands: &CommentCommands) {
    if commands.is_test_retest(text) {
        let command = if text.contains(&format!("{}test", commands.prefix())) {
            event.event_type = CommentEventType::TestSingle.as_str().to_string();
            "test"
        } else {
            event.event_type = CommentEventType::RetestSingle.as_str().to_string();
            "retest"
        };
        event.target_test_pipeline_run = commands.target_name(command, text);
        event.trigger_comment = text.to_string();
    } else {
        commands.apply(event, text);
    }
    event.trigger_target = Some(TriggerType::PullRequest);
}

pub fn parse(headers: &HeaderMap, payload: &[u8], commands: &CommentCommands) -> Result<Event> {
    let event_key = header(headers, EVENT_KEY_HEADER);
    let raw = decode(event_key, payload)?
        .ok_or_else(|| anyhow!("event {event_key} is not supported"))?;
    let mut event = Event::default();
    match &raw {
        WebhookEvent::PullRequest(e) => {
            if PULL_REQUEST_EVENTS.contains(&event_key) {
                event.trigger_target = Some(TriggerType::PullRequest);
                event.event_type = TriggerType::PullRequest.as_str().to_string();
            } else {
                let text = e.comment.as_ref().map(|c| c.text.as_str()).unwrap_or_default();
                apply_comment(&mut event, text, commands);
            }
            check_valid_payload(e)?;

            let pr = &e.pull_request;
            let (to, from) = (&pr.to_ref, &pr.from_ref);
            let to_link = to.repository.self_link().unwrap_or_default();
            event.organization =
                to.repository.project.as_ref().map(|p| p.key.clone()).unwrap_or_default();
            event.repository = to.repository.name.clone();
            event.sha = from.latest_commit.clone();
            event.pull_request_number = pr.id;
            event.pull_request_title = pr.title.clone();
            event.url = to_link.to_string();
            event.base_branch = to.display_id.clone();
            event.head_branch = from.display_id.clone();
            event.base_url = to_link.to_string();
            event.head_url = from.repository.self_link().unwrap_or_default().to_string();
            event.account_id = e.actor.id.to_string();
            event.sender = e.actor.name.clone();
            if let Some(clone) = from.repository.http_clone_link() {
                event.clone_url = clone.to_string();
            }
        }
        WebhookEvent::Push(e) => {
            event.trigger_target = Some(TriggerType::Push);
            event.event_type = TriggerType::Push.as_str().to_string();
            event.organization =
                e.repository.project.as_ref().map(|p| p.key.clone()).unwrap_or_default();
            event.repository = e.repository.slug.clone();

            let changes = e.changes.as_deref().unwrap_or_default();
            let Some(first) = changes.first() else {
                bail!("push event contains no commits under 'changes'; cannot proceed");
            };
            if changes.iter().any(|c| is_zero_sha(&c.to_hash) && c.kind == "DELETE") {
                bail!("branch delete event is not supported; cannot proceed");
            }
            if e.commits.is_empty() {
                bail!("push event contains no commits; cannot proceed");
            }
            let link = e.repository.self_link().unwrap_or_default();
            event.sha = first.to_hash.clone();
            event.url = link.to_string();
            event.base_branch = first.ref_id.clone();
            event.head_branch = first.ref_id.clone();
            event.base_url = link.to_string();
            event.head_url = link.to_string();
            event.account_id = e.actor.id.to_string();
            event.sender = e.actor.name.clone();
            if let Some(clone) = e.repository.http_clone_link() {
                event.clone_url = clone.to_string();
            }
        }
    }

    event.project_id = event.organization.clone();
    event.organization = sanitize_owner(&event.organization);
    event.url = sanitize_event_url(&event.url).to_string();
    // Validates the URL; the API root is derived from it in `set_client`.
    base_url(&event.url).with_context(|| format!("invalid repository URL {:?}", event.url))?;
    event.payload = Some(RawPayload::BitbucketDataCenter(Box::new(raw)));
    Ok(event)
}
