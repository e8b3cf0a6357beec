pub mod github;
pub mod native;

use axum::body::Bytes;
use axum::http::HeaderMap;
use base64::Engine;

use crate::event::{BranchEvent, EventError};
use crate::secrets::SecretError;

/// Bus `source` for events that arrived through the signed webhook.
pub const WEBHOOK_SOURCE: &str = "github.webhook";
/// Bus `source` for events that arrived through the native reference hook.
pub const NATIVE_SOURCE: &str = "repository.native";

/// Set by gateways that forward the body base64 encoded.
pub const BODY_ENCODING_HEADER: &str = "x-body-encoding";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid body: {0}")]
    InvalidBody(String),
    #[error("invalid body encoding: {0}")]
    InvalidEncoding(String),
    #[error("secret unavailable: {0}")]
    Secret(#[from] SecretError),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result of mapping a provider payload onto the canonical model.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Branch(BranchEvent),
    /// Not a branch create/delete. Answered with success, nothing published.
    NotApplicable { reason: String },
    /// Looked like a branch event but broke an invariant (empty or unsafe
    /// name). Logged and dropped.
    Rejected(EventError),
}

/// An inbound webhook call as received.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub base64_encoded: bool,
}

impl WebhookRequest {
    pub fn from_http(headers: HeaderMap, body: Bytes) -> Self {
        let base64_encoded = headers
            .get(BODY_ENCODING_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("base64"));
        Self {
            headers,
            body,
            base64_encoded,
        }
    }

    /// The body as signed by the sender, decoding transport base64 if flagged.
    pub fn raw_body(&self) -> Result<Bytes, SourceError> {
        if !self.base64_encoded {
            return Ok(self.body.clone());
        }
        base64::engine::general_purpose::STANDARD
            .decode(self.body.trim_ascii())
            .map(Bytes::from)
            .map_err(|e| SourceError::InvalidEncoding(e.to_string()))
    }
}
