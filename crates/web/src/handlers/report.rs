use std::collections::BTreeMap;

use anyhow::Context;
use axum::{Json, extract::State, http::StatusCode};
use forgehook_core::{
    AppError,
    config::AiAnalysisConfig,
    patch::{PipelineRun, patch_log_url},
};
use forgehook_forge::{
    Provider,
    event::Event,
    new_provider,
    status::{Conclusion, RunStatus, StatusOpts, target_url},
};
use forgehook_llm::analyzer::{Analyzer, post_results};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;

/// A run state transition sent by the downstream reconciler.
#[derive(Debug, Deserialize)]
pub struct RunReport {
    pub event: Event,
    pub status: StatusOpts,
    /// The run object to annotate with its log URL, when the engine is configured.
    #[serde(default)]
    pub pipeline_run: Option<PipelineRun>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReportOutcome {
    pub log_url_patched: bool,
    pub analyses_posted: usize,
}

pub async fn report(
    State(state): State<AppState>,
    Json(report): Json<RunReport>,
) -> Result<Json<ReportOutcome>, AppError> {
    let RunReport { mut event, status, pipeline_run } = report;
    let Some(repo) = state.config.find_repository(&event.url) else {
        tracing::warn!("Run report for unknown repository {}", event.url);
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    };
    let mut provider = new_provider(repo.provider, state.settings.as_ref().clone());
    provider.set_client(&mut event, repo).await?;
    provider
        .create_status(&event, &status)
        .await
        .with_context(|| format!("cannot create {} status on {}", status.conclusion, event.sha))?;
    tracing::info!(
        "Published {} status for {} on {}@{}",
        status.conclusion,
        status.pipeline_run_name,
        event.url,
        event.sha
    );

    let mut outcome = ReportOutcome::default();
    if let (Some(run), Some(patcher), Some(engine)) =
        (&pipeline_run, &state.patcher, &state.config.pipeline_engine)
    {
        let url = target_url(&event, &status);
        match patch_log_url(patcher.as_ref(), run, &engine.annotation_group, url).await {
            Ok(_) => outcome.log_url_patched = true,
            Err(e) => tracing::error!("{e}"),
        }
    }

    let failed = status.status == RunStatus::Completed
        && matches!(status.conclusion, Conclusion::Failure | Conclusion::Error);
    if failed && let Some(ai) = repo.settings.ai_analysis.as_ref().filter(|ai| ai.enabled) {
        outcome.analyses_posted = analyze_failure(provider.as_ref(), ai, &event, &status).await;
    }
    Ok(Json(outcome))
}

/// Context handed to every analysis role about the failed run.
fn failure_context(event: &Event, status: &StatusOpts) -> BTreeMap<String, Value> {
    let mut context = BTreeMap::from([
        ("repository".to_string(), json!(format!("{}/{}", event.organization, event.repository))),
        (
            "commit".to_string(),
            json!({
                "sha": event.sha,
                "title": event.sha_title,
                "author": event.author_name,
                "branch": event.head_branch,
            }),
        ),
        (
            "pipeline_run".to_string(),
            json!({
                "name": status.pipeline_run_name,
                "conclusion": status.conclusion,
                "title": status.title,
                "details_url": target_url(event, status),
            }),
        ),
    ]);
    if event.pull_request_number > 0 {
        context.insert(
            "pull_request".to_string(),
            json!({"number": event.pull_request_number, "title": event.pull_request_title}),
        );
    }
    if !status.summary.is_empty() {
        context.insert("summary".to_string(), json!(status.summary));
    }
    if !status.text.is_empty() {
        context.insert("details".to_string(), json!(status.text));
    }
    context
}

async fn analyze_failure(
    provider: &dyn Provider,
    config: &AiAnalysisConfig,
    event: &Event,
    status: &StatusOpts,
) -> usize {
    let context = failure_context(event, status);
    match Analyzer::new(config).analyze(&context).await {
        Ok(results) => post_results(provider, event, &results).await,
        Err(e) => {
            tracing::warn!("AI analysis skipped: {e:#}");
            0
        }
    }
}
