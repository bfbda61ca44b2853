//! Cloud Storage object downloads.

use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;

use crate::artifact::ArtifactStore;
use crate::error::ArtifactError;
use crate::gcp::auth::AccessTokens;

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

/// Object names are a single path segment in the JSON API.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct GcsArtifactStore {
    http: reqwest::Client,
    tokens: Arc<AccessTokens>,
    bucket: String,
    base_url: String,
}

impl GcsArtifactStore {
    pub fn new(http: reqwest::Client, tokens: Arc<AccessTokens>, bucket: impl Into<String>) -> Self {
        Self {
            http,
            tokens,
            bucket: bucket.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.base_url,
            utf8_percent_encode(&self.bucket, OBJECT_NAME),
            utf8_percent_encode(path, OBJECT_NAME)
        )
    }
}

impl ArtifactStore for GcsArtifactStore {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        let token = self.tokens.bearer().await?;
        let resp = self
            .http
            .get(self.object_url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ArtifactError::Fetch(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ArtifactError::NotFound(path.to_string())),
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                Err(ArtifactError::Fetch(format!("Cloud Storage error {s}: {body}")))
            }
            _ => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| ArtifactError::Fetch(e.to_string()))?;
                Ok(bytes.to_vec())
            }
        }
    }
}
