//! Fetching build outputs from the artifact store.

use std::future::Future;
use std::sync::Arc;

use crate::error::ArtifactError;

/// Object storage holding build outputs.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Download the whole object at `path`.
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, ArtifactError>> + Send;
}

pub struct ArtifactRetriever<A> {
    store: Arc<A>,
}

impl<A: ArtifactStore> ArtifactRetriever<A> {
    pub fn new(store: Arc<A>) -> Self {
        Self { store }
    }

    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        let bytes = self.store.fetch(path).await?;
        tracing::debug!(path, bytes = bytes.len(), "Fetched artifact");
        Ok(bytes)
    }
}
