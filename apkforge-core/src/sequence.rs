//! Per-project sequence numbers.

use std::sync::Arc;

use crate::error::StoreError;
use crate::model::Counter;
use crate::store::Store;

/// Hands out `1, 2, 3, …` per project namespace.
///
/// Each allocation is a single read-modify-write transaction on the
/// project's counter, so concurrent callers never see the same value.
pub struct SequenceAllocator {
    store: Arc<Store>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn allocate(&self, project: &str) -> Result<u64, StoreError> {
        let next = self.store.transaction(project, |txn| {
            let last = txn.get(project)?.map(|c| c.last_seq).unwrap_or(0);
            let next = last + 1;
            txn.set(&Counter {
                project: project.to_string(),
                last_seq: next,
            })?;
            Ok(next)
        })?;
        tracing::debug!(project, seq = next, "Allocated sequence number");
        Ok(next)
    }
}
