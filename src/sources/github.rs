use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::event::{BranchEvent, EventType};
use crate::secrets::SecretCache;
use crate::verification;

use super::{Normalized, SourceError};

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Default, Deserialize)]
struct Repository {
    full_name: Option<String>,
    /// A string on create/delete payloads, a unix timestamp on push payloads.
    updated_at: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Sender {
    login: Option<String>,
}

/// `create` and `delete` payloads.
#[derive(Debug, Deserialize)]
struct RefPayload {
    #[serde(rename = "ref")]
    ref_: Option<String>,
    ref_type: Option<String>,
    #[serde(default)]
    repository: Repository,
    #[serde(default)]
    sender: Sender,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_: Option<String>,
    created: Option<bool>,
    deleted: Option<bool>,
    #[serde(default)]
    repository: Repository,
    #[serde(default)]
    sender: Sender,
}

/// Payload variants, selected by the `X-GitHub-Event` header.
enum GitHubPayload {
    Create(RefPayload),
    Delete(RefPayload),
    Push(PushPayload),
    Other(String),
}

impl GitHubPayload {
    fn parse(github_event: &str, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match github_event {
            "create" => GitHubPayload::Create(serde_json::from_value(data)?),
            "delete" => GitHubPayload::Delete(serde_json::from_value(data)?),
            "push" => GitHubPayload::Push(serde_json::from_value(data)?),
            other => GitHubPayload::Other(other.to_string()),
        })
    }
}

/// Map a parsed GitHub payload onto the canonical model.
pub fn normalize(github_event: &str, data: Value) -> Normalized {
    let payload = match GitHubPayload::parse(github_event, data) {
        Ok(payload) => payload,
        Err(e) => {
            return Normalized::NotApplicable {
                reason: format!("unrecognised {github_event} payload: {e}"),
            }
        }
    };

    let (event_type, branch, repository, sender) = match payload {
        GitHubPayload::Create(p) | GitHubPayload::Delete(p)
            if p.ref_type.as_deref() != Some("branch") =>
        {
            return Normalized::NotApplicable {
                reason: format!(
                    "{github_event} of ref_type '{}'",
                    p.ref_type.unwrap_or_default()
                ),
            };
        }
        GitHubPayload::Create(p) => (EventType::Create, p.ref_.unwrap_or_default(), p.repository, p.sender),
        GitHubPayload::Delete(p) => (EventType::Delete, p.ref_.unwrap_or_default(), p.repository, p.sender),
        GitHubPayload::Push(p) => {
            let event_type = if p.created.unwrap_or(false) {
                EventType::Create
            } else if p.deleted.unwrap_or(false) {
                EventType::Delete
            } else {
                return Normalized::NotApplicable {
                    reason: "push neither created nor deleted a ref".into(),
                };
            };
            let reference = p.ref_.unwrap_or_default();
            let Some(branch) = reference.strip_prefix(BRANCH_REF_PREFIX) else {
                return Normalized::NotApplicable {
                    reason: format!("push to non-branch ref '{reference}'"),
                };
            };
            (event_type, branch.to_string(), p.repository, p.sender)
        }
        GitHubPayload::Other(name) => {
            return Normalized::NotApplicable {
                reason: format!("event '{name}' is not a branch create/delete event"),
            };
        }
    };

    let timestamp = repository.updated_at.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });

    match BranchEvent::new(event_type, branch) {
        Ok(event) => Normalized::Branch(
            event
                .with_repository(repository.full_name)
                .with_sender(sender.login)
                .with_timestamp(timestamp),
        ),
        Err(e) => {
            error!(
                github_event,
                error = %e,
                "ignoring branch event, no build job will be created or removed"
            );
            Normalized::Rejected(e)
        }
    }
}

/// Signed GitHub webhook source.
pub struct GitHubSource {
    secret: Arc<SecretCache>,
}

impl GitHubSource {
    pub fn new(secret: Arc<SecretCache>) -> Self {
        Self { secret }
    }

    /// Check `X-Hub-Signature-256` against the raw body.
    pub async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SourceError> {
        let secret = self.secret.get().await?;

        let sig_header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                warn!("missing X-Hub-Signature-256 header");
                SourceError::Verification("missing X-Hub-Signature-256 header".into())
            })?;

        verification::verify_github_hmac(secret.as_bytes(), sig_header, body).map_err(|e| {
            warn!(error = %e, "signature verification failed");
            SourceError::Verification(e.to_string())
        })
    }

    pub fn delivery_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(DELIVERY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Parse the (already verified) body and normalize it.
    pub fn build_event(&self, headers: &HeaderMap, body: &[u8]) -> Result<Normalized, SourceError> {
        let data: Value =
            serde_json::from_slice(body).map_err(|e| SourceError::InvalidBody(e.to_string()))?;

        let github_event = headers
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");

        let normalized = normalize(github_event, data);
        if let Normalized::NotApplicable { reason } = &normalized {
            info!(github_event, reason = %reason, "event is not a branch create/delete");
        }
        Ok(normalized)
    }
}
