//! Cloud load balancer boundary
//!
//! The controller never talks to a cloud API directly. It drives a
//! [`LoadBalancerBackend`] obtained once from a [`CloudProvider`], and every
//! failure crossing this boundary is a typed [`CloudError`] whose
//! [`CloudErrorKind`] was decided by an [`ErrorClassifier`] at the point the
//! raw provider response was seen.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::annotations;

pub use memory::{MemoryBackend, MemoryCloud};

/// How the controller should react to a cloud failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CloudErrorKind {
    /// The provider asked us to slow down
    Throttled,
    /// Temporary failure expected to clear on its own
    Transient,
    /// Credentials or policy do not allow the call
    Forbidden,
    /// The request itself was rejected, e.g. invalid configuration
    Rejected,
    NotFound,
    Other,
}

impl CloudErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudErrorKind::Throttled => "Throttled",
            CloudErrorKind::Transient => "Transient",
            CloudErrorKind::Forbidden => "Forbidden",
            CloudErrorKind::Rejected => "Rejected",
            CloudErrorKind::NotFound => "NotFound",
            CloudErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a load balancer backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub message: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from a raw provider message, letting the classifier pick the kind
    pub fn classified(classifier: &dyn ErrorClassifier, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classifier.classify(&message),
            message,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == CloudErrorKind::Throttled
    }

    /// Human-readable part of the provider message, suitable for a Kubernetes event.
    ///
    /// Provider responses embed the useful text after a `Message:` marker; when
    /// present, everything from the last marker on that line is returned.
    pub fn event_message(&self) -> String {
        sanitize_message(&self.message)
    }
}

/// Extract the `Message: ...` tail of a provider error, falling back to the whole text
pub fn sanitize_message(raw: &str) -> String {
    const MARKER: &str = "Message:";
    raw.lines()
        .find_map(|line| line.rfind(MARKER).map(|idx| line[idx..].to_string()))
        .unwrap_or_else(|| raw.to_string())
}

/// Maps raw provider error text to a [`CloudErrorKind`]
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str) -> CloudErrorKind;
}

/// A single substring rule for [`PatternClassifier`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub pattern: String,
    pub kind: CloudErrorKind,
}

impl ClassifierRule {
    pub fn new(pattern: &str, kind: CloudErrorKind) -> Self {
        Self {
            pattern: pattern.to_string(),
            kind,
        }
    }
}

/// First-match substring classifier. Unmatched messages classify as `Other`.
#[derive(Clone, Debug)]
pub struct PatternClassifier {
    rules: Vec<ClassifierRule>,
}

impl PatternClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn default_rules() -> Vec<ClassifierRule> {
        vec![
            ClassifierRule::new("Throttling", CloudErrorKind::Throttled),
            ClassifierRule::new("ServiceUnavailable", CloudErrorKind::Transient),
            ClassifierRule::new("InternalError", CloudErrorKind::Transient),
            ClassifierRule::new("Forbidden.RAM", CloudErrorKind::Forbidden),
            ClassifierRule::new("InvalidParameter", CloudErrorKind::Rejected),
        ]
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> CloudErrorKind {
        self.rules
            .iter()
            .find(|rule| message.contains(&rule.pattern))
            .map(|rule| rule.kind)
            .unwrap_or(CloudErrorKind::Other)
    }
}

/// What the backend knows about an existing load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerDescriptor {
    pub id: String,
    pub name: String,
    pub address: String,
    /// True when the load balancer was supplied by the user through annotation
    pub user_managed: bool,
}

/// Load balancer CRUD capability of a cloud provider
///
/// All operations must be idempotent: `ensure_load_balancer` creates or
/// updates, `ensure_load_balancer_deleted` succeeds when nothing exists.
#[async_trait]
pub trait LoadBalancerBackend: Send + Sync {
    async fn exists(&self, service: &Service) -> Result<Option<LoadBalancerDescriptor>, CloudError>;

    async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[Arc<Node>],
    ) -> Result<LoadBalancerStatus, CloudError>;

    async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<(), CloudError>;
}

/// A cloud provider handle. Capabilities are optional and resolved once at startup.
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    fn load_balancer(&self) -> Option<Arc<dyn LoadBalancerBackend>>;
}

/// Deterministic load balancer name derived from the service UID
///
/// `"a"` followed by the UID without dashes, truncated to 32 characters.
pub fn load_balancer_name(service: &Service) -> String {
    let uid = service.metadata.uid.as_deref().unwrap_or_default();
    let mut name = format!("a{}", uid.replace('-', ""));
    name.truncate(32);
    name
}

/// Load balancer id the user asked to reuse, if any
pub fn user_load_balancer_id(service: &Service) -> Option<&str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::LOAD_BALANCER_ID))
        .map(String::as_str)
        .filter(|id| !id.is_empty())
}

/// Parse the additional resource tags annotation
///
/// The value is a comma separated list of `key=value` items. Keys and values
/// are trimmed, items with an empty key are dropped and a missing value
/// becomes the empty string. Anything after a second `=` is ignored.
pub fn additional_tags(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    let Some(raw) = annotations.get(annotations::ADDITIONAL_RESOURCE_TAGS) else {
        return tags;
    };

    for item in raw.split(',') {
        let mut parts = item.split('=');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            continue;
        }
        let value = parts.next().unwrap_or_default().trim();
        tags.insert(key.to_string(), value.to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn tags_for(value: &str) -> BTreeMap<String, String> {
        let annotations = BTreeMap::from([(
            annotations::ADDITIONAL_RESOURCE_TAGS.to_string(),
            value.to_string(),
        )]);
        additional_tags(&annotations)
    }

    #[test]
    fn test_additional_tags_parsing() {
        assert!(tags_for("").is_empty());
        assert_eq!(
            tags_for("Key=Val"),
            BTreeMap::from([("Key".to_string(), "Val".to_string())])
        );
        assert_eq!(
            tags_for("Key1=Val1, Key2=Val2"),
            BTreeMap::from([
                ("Key1".to_string(), "Val1".to_string()),
                ("Key2".to_string(), "Val2".to_string()),
            ])
        );
        assert_eq!(
            tags_for("Key1=, Key2=Val2"),
            BTreeMap::from([
                ("Key1".to_string(), String::new()),
                ("Key2".to_string(), "Val2".to_string()),
            ])
        );
    }

    #[test]
    fn test_additional_tags_malformed_items() {
        let tags = tags_for("K=V K1=V2,Key1========, =====, ======Val, =Val, , 234,");
        assert_eq!(
            tags,
            BTreeMap::from([
                ("K".to_string(), "V K1".to_string()),
                ("Key1".to_string(), String::new()),
                ("234".to_string(), String::new()),
            ])
        );
    }

    #[test]
    fn test_additional_tags_ignores_other_annotations() {
        let annotations = BTreeMap::from([(
            "Nothing".to_string(),
            "Key1=, Key2=Val2, Key3".to_string(),
        )]);
        assert!(additional_tags(&annotations).is_empty());
    }

    #[test]
    fn test_load_balancer_name_is_derived_from_uid() {
        let svc = Service {
            metadata: ObjectMeta {
                uid: Some("2cb99d4a-8d1b-11e8-9e2d-00163e0a1c42-extra".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let name = load_balancer_name(&svc);
        assert_eq!(name.len(), 32);
        assert!(name.starts_with("a2cb99d4a8d1b11e8"));
        assert!(!name.contains('-'));
    }

    #[test]
    fn test_pattern_classifier() {
        let classifier = PatternClassifier::default();
        assert_eq!(
            classifier.classify("Throttling.User: Request was denied due to user flow control."),
            CloudErrorKind::Throttled
        );
        assert_eq!(
            classifier.classify("Forbidden.RAM: user not authorized"),
            CloudErrorKind::Forbidden
        );
        assert_eq!(classifier.classify("something odd"), CloudErrorKind::Other);

        let custom = PatternClassifier::new(vec![ClassifierRule::new(
            "SlowDown",
            CloudErrorKind::Throttled,
        )]);
        assert_eq!(custom.classify("SlowDown please"), CloudErrorKind::Throttled);
        assert_eq!(custom.classify("Throttling"), CloudErrorKind::Other);
    }

    #[test]
    fn test_sanitize_message() {
        let raw = "SDK.ServerError\nErrorCode: InvalidParameter\nRecommend: see docs Message: The specified port is in use.";
        assert_eq!(sanitize_message(raw), "Message: The specified port is in use.");
        assert_eq!(sanitize_message("plain failure"), "plain failure");
    }
}
