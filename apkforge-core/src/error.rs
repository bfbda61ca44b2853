//! Error kinds for each component and the workflow taxonomy.

use crate::model::Status;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("transaction on {0} could not be serialized")]
    TransactionConflict(String),
    #[error("batch {0} already exists")]
    Duplicate(String),
    #[error("invalid update: {0}")]
    InvalidPatch(String),
    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("corrupt {field} in batch {id}: {value}")]
    Corrupt {
        id: String,
        field: &'static str,
        value: String,
    },
}

/// Failure obtaining a bearer token for Google APIs.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata server returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The job could not be created.
    #[error("build submission failed: {0}")]
    Submit(String),
    /// The job ran and reported failure, or its state could not be read.
    #[error("build failed: {0}")]
    Execution(String),
    #[error("build service auth failed: {0}")]
    Auth(#[from] TokenError),
}

impl BuildError {
    /// Human-readable reason without the variant prefix.
    pub fn reason(&self) -> String {
        match self {
            BuildError::Submit(r) | BuildError::Execution(r) => r.clone(),
            BuildError::Auth(e) => format!("auth: {e}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("artifact fetch failed: {0}")]
    Fetch(String),
    #[error("artifact store auth failed: {0}")]
    Auth(#[from] TokenError),
}

/// Errors surfaced by the workflow coordinator.
///
/// Everything from sequence allocation onwards, except `ArtifactFetch` during
/// final delivery, is also persisted on the batch as `status = error`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("batch {0} not found")]
    NotFound(String),
    #[error("batch is already {0}")]
    Conflict(Status),
    #[error("artifact not ready (batch is {0})")]
    NotReady(Status),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("sequence allocation for {0} could not be serialized")]
    TransactionConflict(String),
    #[error("no template for project {0}")]
    TemplateNotFound(String),
    #[error("template {project}#{index} is empty")]
    EmptyTemplate { project: String, index: u64 },
    #[error("build submission failed: {0}")]
    BuildSubmit(String),
    #[error("build failed: {0}")]
    BuildExecution(String),
    #[error("artifact fetch failed: {0}")]
    ArtifactFetch(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TransactionConflict(scope) => WorkflowError::TransactionConflict(scope),
            other => WorkflowError::Store(other),
        }
    }
}

impl From<ArtifactError> for WorkflowError {
    fn from(e: ArtifactError) -> Self {
        WorkflowError::ArtifactFetch(e.to_string())
    }
}
