use axum::{
    Router,
    routing::{get, post},
};
use forgehook_forge::event::{Event, TriggerType};

use crate::AppState;

mod report;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook::webhook))
        .route("/api/v1/runs/report", post(report::report))
}

async fn healthz() -> &'static str { "ok" }

/// Events that target a pull request and therefore go through the ACL.
fn targets_pull_request(event: &Event) -> bool {
    matches!(
        event.trigger_target,
        Some(TriggerType::PullRequest | TriggerType::PullRequestLabeled)
    )
}
