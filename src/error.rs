//! Error types for the service load balancer controller

use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Cloud backend call failed
    #[error("Cloud provider error: {0}")]
    CloudError(#[from] CloudError),

    /// The cloud backend refused to create or update the load balancer
    #[error("Ensure load balancer for {key} failed: {source}")]
    EnsureFailed {
        key: String,
        #[source]
        source: CloudError,
    },

    /// The operation may succeed if repeated
    #[error("{0}, try again")]
    TryAgain(String),

    /// Status write raced another writer
    #[error("Not persisting update to service {0} that has been changed since we received it")]
    StatusConflict(String),

    /// Bounded retry gave up
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<Error> },

    /// A value the controller relies on was missing
    #[error("Invariant violated: {0}")]
    InvariantError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The cloud provider does not offer a capability the controller requires
    #[error("Cloud provider {provider} does not support {capability}")]
    MissingCapability {
        provider: String,
        capability: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the generic retry helper should repeat the operation
    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain(_))
    }

    /// Whether the failure was caused by cloud API throttling
    pub fn is_throttled(&self) -> bool {
        match self {
            Error::CloudError(e) | Error::EnsureFailed { source: e, .. } => e.is_throttled(),
            Error::RetryExhausted { last, .. } => last.is_throttled(),
            _ => false,
        }
    }

    /// Short label for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::CloudError(_) => "cloud",
            Error::EnsureFailed { .. } => "ensure",
            Error::TryAgain(_) => "try_again",
            Error::StatusConflict(_) => "conflict",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::InvariantError(_) => "invariant",
            Error::ConfigError(_) => "config",
            Error::MissingCapability { .. } => "capability",
            Error::SerializationError(_) => "serialization",
        }
    }
}
