//! Canonical branch events.
//!
//! Every ingress (signed webhook, native reference hook) produces a
//! [`BranchEvent`]; the bus carries it as a [`PublishedEvent`] envelope and
//! subscribers rebuild the [`BranchEvent`] from the envelope's detail.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DETAIL_TYPE_CREATE: &str = "Branch Create";
pub const DETAIL_TYPE_DELETE: &str = "Branch Delete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Delete,
}

impl EventType {
    /// Detail type used on the bus envelope.
    pub fn detail_type(self) -> &'static str {
        match self {
            EventType::Create => DETAIL_TYPE_CREATE,
            EventType::Delete => DETAIL_TYPE_DELETE,
        }
    }

    pub fn from_detail_type(detail_type: &str) -> Option<Self> {
        match detail_type {
            DETAIL_TYPE_CREATE => Some(EventType::Create),
            DETAIL_TYPE_DELETE => Some(EventType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Create => f.write_str("create"),
            EventType::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("reference type '{0}' is not a branch")]
    NotABranch(String),
    #[error("branch name is empty")]
    EmptyBranchName,
    #[error("branch name '{0}' has characters outside [A-Za-z0-9-_./+@#,] and is ignored")]
    UnsafeBranchName(String),
    #[error("unknown detail type '{0}'")]
    UnknownDetailType(String),
    #[error("invalid event detail: {0}")]
    InvalidDetail(String),
}

/// Reference payload shared by the bus detail and the native hook event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    #[serde(default)]
    pub reference_type: Option<String>,
    #[serde(default)]
    pub reference_name: Option<String>,
    #[serde(default)]
    pub repository_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A validated branch creation or deletion.
///
/// The branch name is never empty and only contains characters that are
/// safe to splice into job names and build scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchEvent {
    event_type: EventType,
    reference_name: String,
    repository_name: Option<String>,
    sender: Option<String>,
    timestamp: Option<String>,
}

impl BranchEvent {
    pub fn new(event_type: EventType, reference_name: impl Into<String>) -> Result<Self, EventError> {
        let reference_name = reference_name.into();
        validate_branch_name(&reference_name)?;
        Ok(Self {
            event_type,
            reference_name,
            repository_name: None,
            sender: None,
            timestamp: None,
        })
    }

    /// Rebuild an event from a reference detail, as delivered by the native
    /// hook or carried on the bus.
    pub fn from_detail(event_type: EventType, detail: &EventDetail) -> Result<Self, EventError> {
        match detail.reference_type.as_deref() {
            Some("branch") => {}
            Some(other) => return Err(EventError::NotABranch(other.to_string())),
            None => return Err(EventError::NotABranch(String::new())),
        }
        let name = detail.reference_name.clone().unwrap_or_default();
        Ok(Self::new(event_type, name)?
            .with_repository(detail.repository_name.clone())
            .with_sender(detail.sender.clone())
            .with_timestamp(detail.timestamp.clone()))
    }

    pub fn with_repository(mut self, repository_name: Option<String>) -> Self {
        self.repository_name = repository_name.filter(|r| !r.is_empty());
        self
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<String>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Always `"branch"`; other reference types never become a `BranchEvent`.
    pub fn reference_type(&self) -> &'static str {
        "branch"
    }

    pub fn branch(&self) -> &str {
        &self.reference_name
    }

    pub fn repository_name(&self) -> Option<&str> {
        self.repository_name.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn detail(&self) -> EventDetail {
        EventDetail {
            reference_type: Some(self.reference_type().to_string()),
            reference_name: Some(self.reference_name.clone()),
            repository_name: self.repository_name.clone(),
            sender: self.sender.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

fn validate_branch_name(name: &str) -> Result<(), EventError> {
    if name.is_empty() {
        return Err(EventError::EmptyBranchName);
    }
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '+' | '@' | '#' | ','));
    if !safe {
        return Err(EventError::UnsafeBranchName(name.to_string()));
    }
    Ok(())
}

/// Bus envelope: `{source, detailType, detail, busName}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedEvent {
    pub id: String,
    pub source: String,
    pub detail_type: String,
    pub detail: serde_json::Value,
    pub bus_name: String,
}

impl PublishedEvent {
    pub fn new(event: &BranchEvent, source: &str, bus_name: &str) -> Result<Self, EventError> {
        let detail = serde_json::to_value(event.detail())
            .map_err(|e| EventError::InvalidDetail(e.to_string()))?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            detail_type: event.event_type().detail_type().to_string(),
            detail,
            bus_name: bus_name.to_string(),
        })
    }

    pub fn event_type(&self) -> Result<EventType, EventError> {
        EventType::from_detail_type(&self.detail_type)
            .ok_or_else(|| EventError::UnknownDetailType(self.detail_type.clone()))
    }

    pub fn branch_event(&self) -> Result<BranchEvent, EventError> {
        let event_type = self.event_type()?;
        let detail: EventDetail = serde_json::from_value(self.detail.clone())
            .map_err(|e| EventError::InvalidDetail(e.to_string()))?;
        BranchEvent::from_detail(event_type, &detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_branch_name_is_rejected() {
        assert_eq!(
            BranchEvent::new(EventType::Create, ""),
            Err(EventError::EmptyBranchName)
        );
    }

    #[test]
    fn shell_metacharacters_are_rejected() {
        assert!(matches!(
            BranchEvent::new(EventType::Delete, "x;rm -rf /"),
            Err(EventError::UnsafeBranchName(_))
        ));
        assert!(BranchEvent::new(EventType::Delete, "feature/login-v2").is_ok());
    }

    #[test]
    fn issue_refs_and_commas_are_allowed() {
        assert!(BranchEvent::new(EventType::Create, "feature#123").is_ok());
        assert!(BranchEvent::new(EventType::Create, "fix,typo").is_ok());
        assert!(matches!(
            BranchEvent::new(EventType::Create, "fix typo"),
            Err(EventError::UnsafeBranchName(_))
        ));
        assert!(matches!(
            BranchEvent::new(EventType::Create, "caf\u{e9}"),
            Err(EventError::UnsafeBranchName(_))
        ));
    }

    #[test]
    fn empty_repository_is_dropped() {
        let event = BranchEvent::new(EventType::Create, "demo")
            .unwrap()
            .with_repository(Some(String::new()));
        assert_eq!(event.repository_name(), None);
    }

    #[test]
    fn envelope_carries_detail_type_and_detail() {
        let event = BranchEvent::new(EventType::Delete, "demo")
            .unwrap()
            .with_repository(Some("org/repo".into()))
            .with_sender(Some("octocat".into()));
        let envelope = PublishedEvent::new(&event, "github.webhook", "default").unwrap();

        assert_eq!(envelope.detail_type, "Branch Delete");
        assert_eq!(envelope.bus_name, "default");
        assert_eq!(
            envelope.detail,
            json!({
                "referenceType": "branch",
                "referenceName": "demo",
                "repositoryName": "org/repo",
                "sender": "octocat",
            })
        );
        assert_eq!(envelope.branch_event().unwrap(), event);
    }

    #[test]
    fn unknown_detail_type_is_an_error() {
        let envelope = PublishedEvent {
            id: "1".into(),
            source: "test".into(),
            detail_type: "Tag Create".into(),
            detail: json!({}),
            bus_name: "default".into(),
        };
        assert_eq!(
            envelope.branch_event(),
            Err(EventError::UnknownDetailType("Tag Create".into()))
        );
    }

    #[test]
    fn tag_detail_is_not_a_branch() {
        let detail = EventDetail {
            reference_type: Some("tag".into()),
            reference_name: Some("v1.0".into()),
            ..Default::default()
        };
        assert_eq!(
            BranchEvent::from_detail(EventType::Create, &detail),
            Err(EventError::NotABranch("tag".into()))
        );
    }
}
