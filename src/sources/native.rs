//! Native version-control reference hook.
//!
//! The repository host delivers `{detail: {referenceType, referenceName,
//! repositoryName}}` to a created or deleted route; the route decides the
//! event type. No signature is involved; an optional bearer token guards
//! the routes.

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::config::NativeConfig;
use crate::event::{BranchEvent, EventDetail, EventError, EventType};

use super::{Normalized, SourceError};

#[derive(Debug, Deserialize)]
pub struct NativeReferenceEvent {
    pub detail: EventDetail,
    /// Envelope time, used when the detail carries no timestamp.
    #[serde(default)]
    pub time: Option<String>,
}

pub struct NativeSource {
    token_env: Option<String>,
    token: Option<String>,
}

impl NativeSource {
    pub fn new(token_env: Option<String>, token: Option<String>) -> Self {
        Self { token_env, token }
    }

    pub fn from_config(config: &NativeConfig) -> Self {
        let token = config.token_env.as_deref().and_then(|env_name| {
            std::env::var(env_name)
                .map_err(|_| {
                    warn!(
                        env = env_name,
                        "native hook token env var not set, endpoint will reject all requests"
                    );
                })
                .ok()
        });
        Self::new(config.token_env.clone(), token)
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), SourceError> {
        let Some(ref env_name) = self.token_env else {
            return Ok(());
        };
        let Some(ref expected) = self.token else {
            return Err(SourceError::Config(format!("env var '{env_name}' not set")));
        };

        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                SourceError::Unauthorized("missing or malformed Authorization header".into())
            })?;

        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(SourceError::Unauthorized("invalid bearer token".into()));
        }
        Ok(())
    }

    pub fn build_event(&self, event_type: EventType, body: &[u8]) -> Result<Normalized, SourceError> {
        let event: NativeReferenceEvent =
            serde_json::from_slice(body).map_err(|e| SourceError::InvalidBody(e.to_string()))?;

        let mut detail = event.detail;
        if detail.timestamp.is_none() {
            detail.timestamp = Some(event.time.unwrap_or_else(|| Utc::now().to_rfc3339()));
        }

        match BranchEvent::from_detail(event_type, &detail) {
            Ok(branch_event) => Ok(Normalized::Branch(branch_event)),
            Err(EventError::NotABranch(reference_type)) => {
                info!(reference_type = %reference_type, "native event is not about a branch");
                Ok(Normalized::NotApplicable {
                    reason: format!("reference type '{reference_type}' is not a branch"),
                })
            }
            Err(e) => {
                error!(
                    event_type = %event_type,
                    repository = ?detail.repository_name,
                    error = %e,
                    "ignoring native branch event, no build job will be created or removed"
                );
                Ok(Normalized::Rejected(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn open_when_no_token_configured() {
        let source = NativeSource::new(None, None);
        assert!(source.verify(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn bearer_token_checked() {
        let source = NativeSource::new(Some("TOKEN".into()), Some("t0ken".into()));
        assert!(source.verify(&bearer("t0ken")).is_ok());
        assert!(matches!(
            source.verify(&bearer("wrong")),
            Err(SourceError::Unauthorized(_))
        ));
        assert!(matches!(
            source.verify(&HeaderMap::new()),
            Err(SourceError::Unauthorized(_))
        ));
    }

    #[test]
    fn configured_but_unset_token_is_a_config_error() {
        let source = NativeSource::new(Some("TOKEN".into()), None);
        assert!(matches!(
            source.verify(&bearer("anything")),
            Err(SourceError::Config(_))
        ));
    }

    #[test]
    fn branch_detail_becomes_event() {
        let source = NativeSource::new(None, None);
        let body = br#"{"detail":{"referenceType":"branch","referenceName":"demo","repositoryName":"my-repo"},"time":"2024-05-01T10:00:00Z"}"#;
        match source.build_event(EventType::Delete, body).unwrap() {
            Normalized::Branch(event) => {
                assert_eq!(event.event_type(), EventType::Delete);
                assert_eq!(event.branch(), "demo");
                assert_eq!(event.repository_name(), Some("my-repo"));
                assert_eq!(event.timestamp(), Some("2024-05-01T10:00:00Z"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_time_is_filled_in() {
        let source = NativeSource::new(None, None);
        let body = br#"{"detail":{"referenceType":"branch","referenceName":"demo"}}"#;
        match source.build_event(EventType::Create, body).unwrap() {
            Normalized::Branch(event) => assert!(event.timestamp().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tag_detail_is_not_applicable() {
        let source = NativeSource::new(None, None);
        let body = br#"{"detail":{"referenceType":"tag","referenceName":"v1"}}"#;
        assert!(matches!(
            source.build_event(EventType::Create, body).unwrap(),
            Normalized::NotApplicable { .. }
        ));
    }

    #[test]
    fn missing_branch_name_is_rejected() {
        let source = NativeSource::new(None, None);
        let body = br#"{"detail":{"referenceType":"branch","repositoryName":"my-repo"}}"#;
        assert_eq!(
            source.build_event(EventType::Delete, body).unwrap(),
            Normalized::Rejected(EventError::EmptyBranchName)
        );
    }

    #[test]
    fn malformed_body_is_invalid() {
        let source = NativeSource::new(None, None);
        assert!(matches!(
            source.build_event(EventType::Delete, b"{\"nodetail\":1}"),
            Err(SourceError::InvalidBody(_))
        ));
    }
}
