use anyhow::Context;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use forgehook_core::{
    AppError,
    changed_files::ChangedFiles,
    config::{ProviderKind, RepositoryConfig},
};
use forgehook_forge::{
    Detection, Provider, detect_provider,
    event::Event,
    status::{Conclusion, RunStatus, StatusOpts},
};
use serde::Serialize;
use tracing::{Instrument, field};

use crate::{AppState, handlers::targets_pull_request};

const REQUEST_ID_HEADERS: [&str; 2] = ["X-Request-Id", "X-GitHub-Delivery"];

/// What a processed delivery resolved to.
#[derive(Debug, Serialize)]
pub struct WebhookSummary {
    pub provider: ProviderKind,
    pub event: Event,
    pub changed_files: ChangedFiles,
    pub manifest_bytes: usize,
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Some((provider, detection)) = detect_provider(&state.settings, &headers, &body)
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?
    else {
        tracing::info!("Received webhook from an unknown forge");
        return Ok((StatusCode::OK, "no forge recognized this delivery").into_response());
    };
    if let Detection::Skip(reason) = detection {
        tracing::info!(provider = %provider.kind(), "Skipping webhook: {reason}");
        return Ok((StatusCode::OK, reason).into_response());
    }

    let request_id = REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .unwrap_or_default();
    let span = tracing::info_span!(
        "webhook",
        provider = %provider.kind(),
        event_type = field::Empty,
        request_id = %request_id,
    );
    process(state, provider, headers, body).instrument(span).await
}

async fn process(
    state: AppState,
    mut provider: Box<dyn Provider>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut event = provider
        .parse_payload(&headers, &body)
        .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    tracing::Span::current().record("event_type", event.event_type.as_str());

    let Some(repo) = state.config.find_repository(&event.url) else {
        tracing::info!("No repository configured for {}", event.url);
        return Ok((StatusCode::OK, format!("no repository configured for {}", event.url))
            .into_response());
    };
    if repo.provider != provider.kind() {
        return Err(AppError::BadRequest(format!(
            "repository {} is configured for {}, not {}",
            repo.url,
            repo.provider,
            provider.kind()
        )));
    }

    event.provider.webhook_secret = repo.webhook_secret.clone().unwrap_or_default();
    if let Err(e) = provider.validate(&event, &headers, &body) {
        tracing::warn!("Rejected webhook for {}: {e:#}", event.url);
        return Err(AppError::Status(StatusCode::UNAUTHORIZED));
    }

    provider.set_client(&mut event, repo).await?;
    provider.get_commit_info(&mut event).await.context("cannot get commit info")?;
    if event.has_skip_command {
        tracing::info!("Commit {} asks to skip CI", event.sha);
        return Ok((StatusCode::OK, format!("commit {} contains a skip command", event.sha))
            .into_response());
    }

    if let Some(reason) = authorize(provider.as_ref(), &event, repo).await? {
        return Ok((StatusCode::OK, reason).into_response());
    }

    let manifest = provider
        .get_tekton_dir(&event, &state.config.tekton_dir, repo.provenance)
        .await
        .with_context(|| format!("cannot read {} from {}", state.config.tekton_dir, event.url))?;
    if manifest.is_empty() {
        tracing::info!("No {} directory in {}", state.config.tekton_dir, event.url);
        return Ok((StatusCode::OK, format!("no {} directory found", state.config.tekton_dir))
            .into_response());
    }

    let mut changed_files = provider.get_files(&event).await.context("cannot list changed files")?;
    changed_files.remove_duplicates();
    tracing::info!(
        "Accepted {} event for {}@{} ({} changed files)",
        event.event_type,
        event.url,
        event.sha,
        changed_files.all.len()
    );
    let summary = WebhookSummary {
        provider: provider.kind(),
        event,
        changed_files,
        manifest_bytes: manifest.len(),
    };
    Ok((StatusCode::ACCEPTED, Json(summary)).into_response())
}

/// `None` when the event may proceed, otherwise the denial reason.
async fn authorize(
    provider: &dyn Provider,
    event: &Event,
    repo: &RepositoryConfig,
) -> Result<Option<String>, AppError> {
    if targets_pull_request(event) {
        if provider.is_allowed(event).await.context("cannot check permissions")? {
            return Ok(None);
        }
        let reason = format!(
            "User {} is not allowed to trigger CI via {} in this repo.",
            event.sender, event.event_type
        );
        tracing::info!("{reason}");
        let opts = StatusOpts {
            conclusion: Conclusion::Pending,
            status: RunStatus::Queued,
            title: "Pending approval".to_string(),
            summary: "is waiting for approval".to_string(),
            text: format!(
                "{reason} Waiting for an authorized user to comment /ok-to-test on the pull request."
            ),
            ..Default::default()
        };
        provider.create_status(event, &opts).await.context("cannot set pending approval status")?;
        return Ok(Some(reason));
    }

    let teams = &repo.settings.allowed_teams;
    if !teams.is_empty() {
        let (allowed, reason) = provider.check_policy_allowing(event, teams).await;
        if !allowed {
            tracing::info!("Policy denies {}: {reason}", event.sender);
            return Ok(Some(reason));
        }
        tracing::debug!("Policy allows {}: {reason}", event.sender);
    }
    Ok(None)
}
