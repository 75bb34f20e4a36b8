//! Model blob types and the byte-oriented transport capability the downloader consumes.
use chrono::{DateTime, Utc};

use crate::Result;

/// What a cheap probe of the model endpoint reveals. Used to decide whether a full fetch is
/// worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelMetadata {
    /// When the model was last modified on the server.
    pub last_modified: DateTime<Utc>,
    /// Size of the model body in bytes.
    pub size: u64,
}

/// A downloaded model: an opaque byte buffer plus the metadata it was fetched under.
#[derive(Debug, Clone)]
pub struct ModelBlob {
    /// Raw model bytes, opaque to this crate.
    pub bytes: Vec<u8>,
    /// When the model was last modified on the server.
    pub last_modified: DateTime<Utc>,
    /// Size of the body as reported by the server.
    pub size: u64,
}

impl ModelBlob {
    /// Metadata of this blob, in the shape [`ModelTransport::probe`] returns.
    pub fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            last_modified: self.last_modified,
            size: self.size,
        }
    }
}

/// Byte-oriented request/response capability for model retrieval.
///
/// Implementations are called only from the downloader's background thread and may block.
pub trait ModelTransport: Send + Sync {
    /// Cheaply probe the endpoint for the model's current metadata.
    fn probe(&self) -> Result<ModelMetadata>;

    /// Fetch the full model body.
    fn fetch(&self) -> Result<ModelBlob>;
}
