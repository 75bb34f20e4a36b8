//! Default [`ModelTransport`] over blocking HTTP.
//!
//! Probing uses a `HEAD` request and reads `Last-Modified` / `Content-Length`, so an unchanged
//! model costs a header exchange instead of a full body download every refresh tick.
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, LAST_MODIFIED};
use reqwest::Url;

use crate::model::{ModelBlob, ModelMetadata, ModelTransport};
use crate::{Error, Result};

/// A model transport backed by `reqwest`'s blocking client.
pub struct HttpModelTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: Client,
    url: Url,
}

impl HttpModelTransport {
    /// Create a transport for the given model URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `model_url` does not parse.
    pub fn new(model_url: &str) -> Result<HttpModelTransport> {
        let url = Url::parse(model_url).map_err(Error::InvalidUrl)?;
        Ok(HttpModelTransport {
            client: Client::new(),
            url,
        })
    }
}

impl ModelTransport for HttpModelTransport {
    fn probe(&self) -> Result<ModelMetadata> {
        log::trace!(target: "bandit", "probing model endpoint");
        let response = self
            .client
            .head(self.url.clone())
            .send()?
            .error_for_status()?;

        Ok(ModelMetadata {
            last_modified: last_modified(response.headers()),
            size: content_length(response.headers()),
        })
    }

    fn fetch(&self) -> Result<ModelBlob> {
        log::debug!(target: "bandit", "fetching model body");
        let response = self
            .client
            .get(self.url.clone())
            .send()?
            .error_for_status()?;

        let last_modified = last_modified(response.headers());
        let bytes = response.bytes()?.to_vec();

        Ok(ModelBlob {
            last_modified,
            size: bytes.len() as u64,
            bytes,
        })
    }
}

/// Parse the `Last-Modified` header. A missing or malformed header maps to the epoch, which
/// makes the downloader fall back to size-based change detection.
fn last_modified(headers: &HeaderMap) -> DateTime<Utc> {
    headers
        .get(LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
