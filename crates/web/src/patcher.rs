//! Merge patches against `PipelineRun` objects in the pipeline engine's
//! Kubernetes API.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use axum::http::{StatusCode, header};
use forgehook_core::{
    config::PipelineEngineConfig,
    patch::{PatchError, PipelineRun, RunPatcher},
};
use serde::Deserialize;

const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    namespace: String,
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Object {
    metadata: ObjectMeta,
}

pub struct KubeRunPatcher {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl KubeRunPatcher {
    pub fn new(config: &PipelineEngineConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn run_url(&self, run: &PipelineRun) -> String {
        format!(
            "{}/apis/tekton.dev/v1/namespaces/{}/pipelineruns/{}",
            self.api_url, run.namespace, run.name
        )
    }
}

#[async_trait]
impl RunPatcher for KubeRunPatcher {
    async fn merge_patch(&self, run: &PipelineRun, patch: &[u8]) -> Result<PipelineRun, PatchError> {
        let mut request = self
            .http
            .patch(self.run_url(run))
            .header(header::CONTENT_TYPE, MERGE_PATCH)
            .body(patch.to_vec());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("Failed to reach pipeline engine")?;
        let status = response.status();
        let body = response.text().await.context("Failed to read pipeline engine response")?;
        if status == StatusCode::CONFLICT {
            return Err(PatchError::Conflict(body));
        }
        if !status.is_success() {
            return Err(anyhow!("pipeline engine answered {status}: {body}").into());
        }
        let object: Object =
            serde_json::from_str(&body).context("Failed to parse patched pipelinerun")?;
        Ok(PipelineRun {
            namespace: object.metadata.namespace,
            name: object.metadata.name,
            annotations: object.metadata.annotations,
        })
    }
}

#[cfg(test)]
mod tests {
    use forgehook_core::patch::patch_log_url;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header as header_eq, method, path},
    };

    use super::*;

    fn patcher(server: &MockServer) -> KubeRunPatcher {
        KubeRunPatcher::new(&PipelineEngineConfig {
            api_url: format!("{}/", server.uri()),
            token: Some("kube-token".into()),
            annotation_group: "pipelinesascode.tekton.dev".into(),
        })
        .unwrap()
    }

    fn run() -> PipelineRun {
        PipelineRun { namespace: "ci".into(), name: "pr-build-x1".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_merge_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/tekton.dev/v1/namespaces/ci/pipelineruns/pr-build-x1"))
            .and(header_eq("content-type", MERGE_PATCH))
            .and(header_eq("authorization", "Bearer kube-token"))
            .and(body_json(json!({"metadata": {"annotations": {
                "pipelinesascode.tekton.dev/log-url": "https://console.example.com/run/1",
            }}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "tekton.dev/v1",
                "kind": "PipelineRun",
                "metadata": {
                    "namespace": "ci",
                    "name": "pr-build-x1",
                    "annotations": {"pipelinesascode.tekton.dev/log-url": "https://console.example.com/run/1"},
                },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let updated = patch_log_url(
            &patcher(&server),
            &run(),
            "pipelinesascode.tekton.dev",
            "https://console.example.com/run/1",
        )
        .await
        .unwrap();
        assert_eq!(
            updated.annotations["pipelinesascode.tekton.dev/log-url"],
            "https://console.example.com/run/1"
        );
    }

    #[tokio::test]
    async fn test_merge_patch_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(409).set_body_string("object has been modified"))
            .mount(&server)
            .await;
        let err = patcher(&server).merge_patch(&run(), b"{}").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "conflict: object has been modified");

        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;
        let err = patcher(&server).merge_patch(&run(), b"{}").await.unwrap_err();
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "pipeline engine answered 403 Forbidden: forbidden");
    }
}
