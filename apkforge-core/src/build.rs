//! Build job specification and submission.
//!
//! A build is four ordered steps: clone the source, drop the configuration
//! blob into the app directory, run the release build, upload the package to
//! the batch's artifact path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Serialize;

use crate::error::BuildError;
use crate::model::artifact_path;

/// Opaque reference to a submitted remote build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote service that runs build specifications.
pub trait BuildService: Send + Sync + 'static {
    /// Create the job and return its handle without waiting for it.
    fn submit(&self, spec: &BuildSpec) -> impl Future<Output = Result<JobHandle, BuildError>> + Send;

    /// Resolve once the job reaches a terminal state.
    fn wait(&self, handle: &JobHandle) -> impl Future<Output = Result<(), BuildError>> + Send;
}

/// Where sources come from and where artifacts go.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Git URL of the application repository.
    pub repo_url: Option<String>,
    /// Application module inside the checkout, e.g. `app`.
    pub app_dir: String,
    /// Artifact bucket the upload step writes to.
    pub bucket: String,
    /// Name of the injected configuration file.
    pub config_file: String,
    /// Ceiling attached to the job; enforced by the build service.
    pub timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            repo_url: None,
            app_dir: "app".to_string(),
            bucket: String::new(),
            config_file: "google-services.json".to_string(),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl BuildConfig {
    /// The configured repository, rejecting unset or placeholder URLs.
    pub fn source(&self) -> Result<&str, BuildError> {
        let url = self.repo_url.as_deref().map(str::trim).unwrap_or_default();
        if url.is_empty() {
            return Err(BuildError::Submit("source repository is not configured".into()));
        }
        if url.contains("<your>/") || url.contains(char::is_whitespace) {
            return Err(BuildError::Submit(format!(
                "source repository {url:?} is not a usable URL"
            )));
        }
        Ok(url)
    }
}

/// One container step in a build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStep {
    pub name: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl BuildStep {
    fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            entrypoint: None,
            dir: None,
        }
    }
}

/// Ordered build steps plus the overall timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    pub steps: Vec<BuildStep>,
    pub timeout: Duration,
    /// Artifact path the final step uploads to.
    pub output_path: String,
}

impl BuildSpec {
    pub fn new(
        config: &BuildConfig,
        config_blob: &[u8],
        batch_id: &str,
    ) -> Result<Self, BuildError> {
        let repo = config.source()?;
        if config.bucket.is_empty() {
            return Err(BuildError::Submit("artifact bucket is not configured".into()));
        }
        let app_dir = &config.app_dir;
        let file = &config.config_file;
        let encoded = base64::engine::general_purpose::STANDARD.encode(config_blob);
        let output_path = artifact_path(batch_id);

        let mut inject = BuildStep::new(
            "gcr.io/cloud-builders/gcloud",
            &[
                "-c",
                &format!(
                    "set -e && cd src/{app_dir} && rm -f {file} && \
                     echo {encoded} | base64 -d > {file} && ls -l {file}"
                ),
            ],
        );
        inject.entrypoint = Some("bash".to_string());

        let mut assemble = BuildStep::new("gcr.io/cloud-builders/gradle", &["assembleRelease"]);
        assemble.dir = Some("src".to_string());

        let steps = vec![
            BuildStep::new("gcr.io/cloud-builders/git", &["clone", repo, "src"]),
            inject,
            assemble,
            BuildStep::new(
                "gcr.io/cloud-builders/gsutil",
                &[
                    "cp",
                    &format!("src/{app_dir}/build/outputs/apk/release/*.apk"),
                    &format!("gs://{}/{output_path}", config.bucket),
                ],
            ),
        ];

        Ok(Self {
            steps,
            timeout: config.timeout,
            output_path,
        })
    }
}

/// Turns a configuration blob and batch identity into a submitted job.
pub struct BuildTrigger<S> {
    config: BuildConfig,
    service: Arc<S>,
}

impl<S: BuildService> BuildTrigger<S> {
    pub fn new(config: BuildConfig, service: Arc<S>) -> Self {
        Self { config, service }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub async fn submit(
        &self,
        config_blob: &[u8],
        batch_id: &str,
        artifact_name: &str,
    ) -> Result<JobHandle, BuildError> {
        let spec = BuildSpec::new(&self.config, config_blob, batch_id)?;
        let handle = self.service.submit(&spec).await?;
        tracing::info!(
            batch_id,
            artifact_name,
            job = %handle,
            output = %spec.output_path,
            "Build submitted"
        );
        Ok(handle)
    }
}
