//! Awaiting submitted builds.

use std::sync::Arc;

use crate::build::{BuildService, JobHandle};
use crate::error::BuildError;

/// Suspends the calling workflow until a remote job finishes.
///
/// No timeout is applied here: the ceiling travels with the job itself.
pub struct BuildMonitor<S> {
    service: Arc<S>,
}

impl<S: BuildService> BuildMonitor<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// Success, or the remote failure reason as reported.
    pub async fn wait_for(&self, handle: &JobHandle) -> Result<(), BuildError> {
        tracing::debug!(job = %handle, "Waiting for build");
        let started = std::time::Instant::now();
        let result = self.service.wait(handle).await;
        match &result {
            Ok(()) => tracing::info!(job = %handle, elapsed_secs = started.elapsed().as_secs(), "Build finished"),
            Err(e) => tracing::warn!(job = %handle, error = %e, "Build did not succeed"),
        }
        result
    }
}
