//! Annotation patches against pipeline runs held by the downstream engine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::retry::{DEFAULT_RETRY, retry_on_conflict};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// The object changed under us; the patch may be retried.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PatchError {
    pub fn is_conflict(&self) -> bool { matches!(self, PatchError::Conflict(_)) }
}

/// The slice of a pipeline run the controller cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[async_trait]
pub trait RunPatcher: Send + Sync {
    /// Apply a JSON merge patch and return the updated run.
    async fn merge_patch(&self, run: &PipelineRun, patch: &[u8]) -> Result<PipelineRun, PatchError>;
}

/// Final failure of a patch loop. Carries the run as it was before patching.
#[derive(Debug, thiserror::Error)]
#[error("cannot patch pipelinerun {}/{}: {error}", original.namespace, original.name)]
pub struct PatchFailure {
    pub original: PipelineRun,
    #[source]
    pub error: PatchError,
}

/// `{"metadata":{"annotations":{...}}}`
pub fn annotations_merge_patch(annotations: &BTreeMap<String, String>) -> Value {
    json!({ "metadata": { "annotations": annotations } })
}

/// Set `<group>/log-url` on `run`, retrying on conflict with the doubled
/// default schedule. The patch body is rebuilt on every attempt.
pub async fn patch_log_url(
    patcher: &dyn RunPatcher,
    run: &PipelineRun,
    group: &str,
    url: &str,
) -> Result<PipelineRun, PatchFailure> {
    let key = format!("{group}/log-url");
    let result = retry_on_conflict(DEFAULT_RETRY.doubled(), PatchError::is_conflict, || {
        let key = key.clone();
        async move {
            let annotations = BTreeMap::from([(key, url.to_string())]);
            let body = serde_json::to_vec(&annotations_merge_patch(&annotations))
                .map_err(|e| PatchError::Other(e.into()))?;
            patcher.merge_patch(run, &body).await
        }
    })
    .await;
    match result {
        Ok(updated) => {
            tracing::info!("Annotated pipelinerun {}/{} with log URL", run.namespace, run.name);
            Ok(updated)
        }
        Err(error) => Err(PatchFailure { original: run.clone(), error }),
    }
}
