//! OAuth bearer tokens for Google APIs.
//!
//! Either a fixed token supplied by the operator, or one fetched from the
//! GCE/Cloud Run metadata server and cached until shortly before it expires.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::TokenError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

enum Source {
    Fixed(String),
    Metadata { http: reqwest::Client, url: String },
}

pub struct AccessTokens {
    source: Source,
    cached: Mutex<Option<(String, Instant)>>,
}

impl AccessTokens {
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: Source::Fixed(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub fn metadata(http: reqwest::Client) -> Self {
        Self::metadata_at(http, METADATA_TOKEN_URL)
    }

    /// Metadata-server token source at a non-default URL.
    pub fn metadata_at(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            source: Source::Metadata {
                http,
                url: url.into(),
            },
            cached: Mutex::new(None),
        }
    }

    pub async fn bearer(&self) -> Result<String, TokenError> {
        let (http, url) = match &self.source {
            Source::Fixed(token) => return Ok(token.clone()),
            Source::Metadata { http, url } => (http, url),
        };

        let mut cached = self.cached.lock().await;
        if let Some((token, expires)) = cached.as_ref()
            && Instant::now() < *expires
        {
            return Ok(token.clone());
        }

        let resp = http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let token: MetadataToken = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        tracing::debug!(expires_in = token.expires_in, "Fetched access token from metadata server");
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }
}
