//! Cloud Build REST client.
//!
//! Submission creates a build and returns its long-running operation name;
//! waiting polls that operation until it reports `done`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::build::{BuildService, BuildSpec, JobHandle};
use crate::error::BuildError;
use crate::gcp::auth::AccessTokens;

const DEFAULT_BASE_URL: &str = "https://cloudbuild.googleapis.com";

/// Long-running operation as returned by `builds.create` and `operations.get`.
#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
    response: Option<BuildResult>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildResult {
    status: Option<String>,
    status_detail: Option<String>,
}

pub struct CloudBuildClient {
    http: reqwest::Client,
    tokens: Arc<AccessTokens>,
    project_id: String,
    base_url: String,
    poll_interval: Duration,
}

impl CloudBuildClient {
    pub fn new(http: reqwest::Client, tokens: Arc<AccessTokens>, project_id: impl Into<String>) -> Self {
        Self {
            http,
            tokens,
            project_id: project_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn get_operation(&self, name: &str) -> Result<Operation, BuildError> {
        let token = self.tokens.bearer().await?;
        let resp = self
            .http
            .get(format!("{}/v1/{name}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BuildError::Execution(format!("polling {name}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BuildError::Execution(format!(
                "polling {name}: Cloud Build error {status}: {body}"
            )));
        }
        resp.json::<Operation>()
            .await
            .map_err(|e| BuildError::Execution(format!("polling {name}: bad response: {e}")))
    }
}

impl BuildService for CloudBuildClient {
    async fn submit(&self, spec: &BuildSpec) -> Result<JobHandle, BuildError> {
        let token = self.tokens.bearer().await?;
        let body = serde_json::json!({
            "steps": spec.steps,
            "timeout": format!("{}s", spec.timeout.as_secs()),
        });
        let resp = self
            .http
            .post(format!(
                "{}/v1/projects/{}/builds",
                self.base_url, self.project_id
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BuildError::Submit(format!("Cloud Build unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BuildError::Submit(format!("Cloud Build error {status}: {body}")));
        }
        let op = resp
            .json::<Operation>()
            .await
            .map_err(|e| BuildError::Submit(format!("bad Cloud Build response: {e}")))?;
        Ok(JobHandle(op.name))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<(), BuildError> {
        loop {
            let op = self.get_operation(&handle.0).await?;
            if op.done {
                if let Some(err) = op.error {
                    return Err(BuildError::Execution(if err.message.is_empty() {
                        format!("operation failed with code {}", err.code)
                    } else {
                        err.message
                    }));
                }
                return match op.response.and_then(|b| b.status.map(|s| (s, b.status_detail))) {
                    Some((s, _)) if s == "SUCCESS" => Ok(()),
                    Some((s, detail)) => Err(BuildError::Execution(match detail {
                        Some(d) if !d.is_empty() => format!("{s}: {d}"),
                        _ => s,
                    })),
                    // Done without error and without a build body: treat as success.
                    None => Ok(()),
                };
            }
            tracing::trace!(job = %handle, "Build still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
