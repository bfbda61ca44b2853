//! apkforge-core: on-demand build orchestration for named artifacts.
//!
//! A batch moves through `available → confirmed → building → built`, or
//! stops in `error`. The pieces, leaf-first:
//! - [`store`]: SQLite-backed batches, counters and templates
//! - [`sequence`]: transactional per-project sequence numbers
//! - [`template`]: configuration blob selection
//! - [`build`] / [`monitor`]: remote build submission and completion
//! - [`artifact`]: fetching built binaries
//! - [`coordinator`]: the state machine tying them together
//! - [`gcp`]: Cloud Build and Cloud Storage backends

pub mod artifact;
pub mod build;
pub mod coordinator;
pub mod error;
pub mod gcp;
pub mod model;
pub mod monitor;
pub mod sequence;
pub mod store;
pub mod template;

pub use coordinator::{BuildReport, ConfirmOutcome, Coordinator, Download, Progress};
pub use error::{ArtifactError, BuildError, StoreError, WorkflowError};
pub use model::{Batch, BatchPatch, Counter, NewBatch, Status, Template};
pub use store::Store;
