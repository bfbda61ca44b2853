//! Google Cloud backends: Cloud Build for jobs, Cloud Storage for artifacts.

pub mod auth;
pub mod cloudbuild;
pub mod storage;

pub use auth::AccessTokens;
pub use cloudbuild::CloudBuildClient;
pub use storage::GcsArtifactStore;
