//! Configuration template selection.

use std::sync::Arc;

use crate::error::StoreError;
use crate::model::Template;
use crate::store::Store;

/// Picks the configuration blob for a build. Read-only.
pub struct TemplateSelector {
    store: Arc<Store>,
}

impl TemplateSelector {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Exact `(project, preferred)` match if there is one, otherwise the
    /// project's highest-indexed template.
    pub fn select(
        &self,
        project: &str,
        preferred: Option<u64>,
    ) -> Result<Option<Template>, StoreError> {
        if let Some(index) = preferred
            && let Some(t) = self.store.template_at(project, index)?
        {
            return Ok(Some(t));
        }
        let fallback = self.store.latest_template(project)?;
        if let Some(t) = &fallback {
            tracing::debug!(project, ?preferred, index = t.index, "Using highest template index");
        }
        Ok(fallback)
    }
}
