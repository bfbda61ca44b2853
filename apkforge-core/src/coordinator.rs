//! The batch workflow state machine.
//!
//! `confirm` drives one batch from `available` to `built` (or `error`):
//! claim → allocate sequence → select template → mark building → submit →
//! await → mark built → fetch artifact. Every failure after the claim is
//! written back to the batch before it is returned, except a failed final
//! fetch, which leaves the batch `built` so `download` can retry delivery.

use std::sync::Arc;

use crate::artifact::{ArtifactRetriever, ArtifactStore};
use crate::build::{BuildConfig, BuildService, BuildTrigger};
use crate::error::WorkflowError;
use crate::model::{Batch, BatchPatch, Status, artifact_path, now_ms};
use crate::monitor::BuildMonitor;
use crate::sequence::SequenceAllocator;
use crate::store::Store;
use crate::template::TemplateSelector;

/// What was built for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub batch_id: String,
    pub artifact_name: String,
    pub project: String,
    pub seq: u64,
    pub template_index: u64,
    /// Name to deliver the artifact under.
    pub filename: String,
}

/// Milestones reported while a confirm is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// The batch is `building` and the job is about to be submitted.
    Building(BuildReport),
}

#[derive(Debug)]
pub enum ConfirmOutcome {
    /// Built and fetched.
    Delivered { report: BuildReport, artifact: Vec<u8> },
    /// Built, but fetching the output failed. The batch stays `built`.
    Undelivered { report: BuildReport, reason: String },
}

/// Bytes of a previously built batch.
#[derive(Debug)]
pub struct Download {
    pub batch: Batch,
    pub artifact: Vec<u8>,
}

pub struct Coordinator<S, A> {
    store: Arc<Store>,
    sequences: SequenceAllocator,
    templates: TemplateSelector,
    trigger: BuildTrigger<S>,
    monitor: BuildMonitor<S>,
    artifacts: ArtifactRetriever<A>,
}

impl<S: BuildService, A: ArtifactStore> Coordinator<S, A> {
    pub fn new(store: Arc<Store>, build: BuildConfig, builds: Arc<S>, artifacts: Arc<A>) -> Self {
        Self {
            sequences: SequenceAllocator::new(store.clone()),
            templates: TemplateSelector::new(store.clone()),
            trigger: BuildTrigger::new(build, builds.clone()),
            monitor: BuildMonitor::new(builds),
            artifacts: ArtifactRetriever::new(artifacts),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Recent batches, newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<Batch>, WorkflowError> {
        Ok(self.store.list_recent(limit)?)
    }

    pub async fn confirm(
        &self,
        batch_id: &str,
        explicit_project: Option<&str>,
    ) -> Result<ConfirmOutcome, WorkflowError> {
        self.confirm_with_progress(batch_id, explicit_project, |_| {}).await
    }

    pub async fn confirm_with_progress(
        &self,
        batch_id: &str,
        explicit_project: Option<&str>,
        mut on_progress: impl FnMut(Progress) + Send,
    ) -> Result<ConfirmOutcome, WorkflowError> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| WorkflowError::NotFound(batch_id.to_string()))?;
        if !batch.status.is_confirmable() {
            tracing::info!(batch_id, status = %batch.status, "Confirm rejected");
            return Err(WorkflowError::Conflict(batch.status));
        }

        let project = match explicit_project.map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => batch.resolved_project(),
        };

        // Claim: only one confirm can move the batch out of its intake state.
        if !self.store.transition(batch_id, &BatchPatch::confirmed(&project))? {
            return Err(self.conflict(batch_id)?);
        }
        tracing::info!(batch_id, project = %project, "Batch confirmed");

        let seq = match self.sequences.allocate(&project) {
            Ok(seq) => seq,
            Err(e) => return Err(self.fail(batch_id, e.into())),
        };

        let template = match self.templates.select(&project, Some(seq)) {
            Ok(Some(t)) => t,
            Ok(None) => return Err(self.fail(batch_id, WorkflowError::TemplateNotFound(project))),
            Err(e) => return Err(self.fail(batch_id, e.into())),
        };
        let blob = template.data_text.trim();
        if blob.is_empty() {
            return Err(self.fail(
                batch_id,
                WorkflowError::EmptyTemplate {
                    project,
                    index: template.index,
                },
            ));
        }

        let started = self
            .store
            .transition(batch_id, &BatchPatch::building(seq, template.index, now_ms()));
        match started {
            Ok(true) => {}
            Ok(false) => return Err(self.conflict(batch_id)?),
            Err(e) => return Err(self.fail(batch_id, e.into())),
        }

        let report = BuildReport {
            batch_id: batch_id.to_string(),
            artifact_name: batch.artifact_name.clone(),
            project,
            seq,
            template_index: template.index,
            filename: batch.delivery_filename(),
        };
        tracing::info!(
            batch_id,
            project = %report.project,
            seq,
            template_index = template.index,
            "Build starting"
        );
        on_progress(Progress::Building(report.clone()));

        let handle = match self
            .trigger
            .submit(blob.as_bytes(), batch_id, &batch.artifact_name)
            .await
        {
            Ok(h) => h,
            Err(e) => return Err(self.fail(batch_id, WorkflowError::BuildSubmit(e.reason()))),
        };

        if let Err(e) = self.monitor.wait_for(&handle).await {
            return Err(self.fail(batch_id, WorkflowError::BuildExecution(e.reason())));
        }

        let path = artifact_path(batch_id);
        match self
            .store
            .transition(batch_id, &BatchPatch::built(path.clone(), now_ms()))
        {
            Ok(true) => {}
            Ok(false) => return Err(self.conflict(batch_id)?),
            Err(e) => return Err(self.fail(batch_id, e.into())),
        }
        tracing::info!(batch_id, path = %path, "Batch built");

        match self.artifacts.fetch(&path).await {
            Ok(artifact) => Ok(ConfirmOutcome::Delivered { report, artifact }),
            Err(e) => {
                tracing::warn!(batch_id, error = %e, "Built artifact could not be fetched");
                Ok(ConfirmOutcome::Undelivered {
                    report,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Fetch the artifact of a batch that is already `built`.
    pub async fn download(&self, batch_id: &str) -> Result<Download, WorkflowError> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| WorkflowError::NotFound(batch_id.to_string()))?;
        let path = match (&batch.status, &batch.artifact_path) {
            (Status::Built, Some(path)) => path.clone(),
            (status, _) => return Err(WorkflowError::NotReady(*status)),
        };
        let artifact = self.artifacts.fetch(&path).await?;
        Ok(Download { batch, artifact })
    }

    /// Record `err` on the batch and hand it back.
    fn fail(&self, batch_id: &str, err: WorkflowError) -> WorkflowError {
        let reason = err.to_string();
        tracing::warn!(batch_id, error = %reason, "Batch failed");
        match self.store.transition(batch_id, &BatchPatch::failed(reason)) {
            Ok(true) => {}
            Ok(false) => tracing::error!(batch_id, "Could not mark batch as error: state moved"),
            Err(e) => tracing::error!(batch_id, error = %e, "Could not mark batch as error"),
        }
        err
    }

    /// Conflict carrying whatever state the batch is in now.
    fn conflict(&self, batch_id: &str) -> Result<WorkflowError, WorkflowError> {
        let current = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| WorkflowError::NotFound(batch_id.to_string()))?;
        tracing::info!(batch_id, status = %current.status, "Lost race on batch status");
        Ok(WorkflowError::Conflict(current.status))
    }
}
