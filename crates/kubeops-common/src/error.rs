//! Error types for the kubeops runtime
//!
//! Errors carry the entity or component they concern so a single log line
//! is enough to locate the failing watch, reconcile or lease operation.

use thiserror::Error;

/// Context recorded when the caller gives none
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Errors raised by kubeops components
#[derive(Debug, Error)]
pub enum Error {
    /// The API server rejected a request or could not be reached
    #[error("kubernetes api: {source}")]
    Kube {
        /// Error returned by the kube client
        #[from]
        source: kube::Error,
    },

    /// Watch transport error (stream failure, decode failure, server error event)
    #[error("watch error [{kind}]: {message}")]
    Watch {
        /// Kind of the watched entity
        kind: String,
        /// What went wrong
        message: String,
    },

    /// An object could not be encoded or decoded
    #[error("encoding failed: {message}")]
    Serialization {
        /// What went wrong
        message: String,
        /// Kind of the object, when known
        kind: Option<String>,
    },

    /// A controller's reconcile or deleted callback failed
    #[error("reconcile error for {entity}: {message}")]
    Reconcile {
        /// Entity reference (namespace/name)
        entity: String,
        /// What went wrong
        message: String,
    },

    /// A finalizer failed to run or could not be attached/detached
    #[error("finalizer {finalizer} failed for {entity}: {message}")]
    Finalizer {
        /// Finalizer identifier
        finalizer: String,
        /// Entity reference (namespace/name)
        entity: String,
        /// What went wrong
        message: String,
    },

    /// Lease-based leader election error
    #[error("leader election error [{lease}]: {message}")]
    LeaderElection {
        /// Lease name
        lease: String,
        /// What went wrong
        message: String,
    },

    /// Invalid operator settings
    #[error("configuration error: {message}")]
    Configuration {
        /// Which setting is wrong and why
        message: String,
    },

    /// A runtime invariant was broken
    #[error("internal error in {context}: {message}")]
    Internal {
        /// What went wrong
        message: String,
        /// Context where the error occurred (e.g., "queue", "dispatcher", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a watch error for the given entity kind
    pub fn watch(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Encoding failure without a kind
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Encoding failure for an object of `kind`
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a reconcile error for an entity
    pub fn reconcile(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reconcile {
            entity: entity.into(),
            message: msg.into(),
        }
    }

    /// Create a finalizer error
    pub fn finalizer(
        finalizer: impl Into<String>,
        entity: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Finalizer {
            finalizer: finalizer.into(),
            entity: entity.into(),
            message: msg.into(),
        }
    }

    /// Create a leader election error for a lease
    pub fn leader_election(lease: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::LeaderElection {
            lease: lease.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Runtime failure with no specific component
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Runtime failure attributed to `context`
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube {
                source: kube::Error::Api(e),
            } => Some(e.code),
            _ => None,
        }
    }

    /// Whether this error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Whether this error is a 409 optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::reconcile("ns1/app", "database unreachable");
        assert_eq!(
            err.to_string(),
            "reconcile error for ns1/app: database unreachable"
        );

        let err = Error::watch("ConfigMirror", "stream reset");
        assert_eq!(err.to_string(), "watch error [ConfigMirror]: stream reset");
    }

    #[test]
    fn test_api_code_classification() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert_eq!(api_error(500).api_code(), Some(500));
        assert_eq!(Error::internal("x").api_code(), None);
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { kind: None, .. }));
    }
}
