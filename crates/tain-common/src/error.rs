//! Error types for the tain agent
//!
//! Errors are structured with fields to aid debugging in production. A sync
//! handler error is consumed by the owning controller's retry bookkeeping and
//! never propagates past it, so the taxonomy here exists for diagnostics, not
//! for control flow: transient store failures and malformed keys alike are
//! requeued through the rate-limited path.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tain operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Persistent store error
    #[error("store error [{operation}]: {message}")]
    Store {
        /// Store operation that failed (e.g., "load", "apply", "remove")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A work-queue key that cannot be split into scope identifiers
    #[error("invalid object key {key:?}: {message}")]
    InvalidKey {
        /// The malformed key
        key: String,
        /// Why it could not be parsed
        message: String,
    },

    /// Leader election error
    #[error("election error for cluster {cluster}: {message}")]
    Election {
        /// Cluster whose lease operation failed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "supervisor")
        context: String,
    },
}

impl Error {
    /// Create a store error for the given operation
    pub fn store(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-key error
    pub fn invalid_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an election error for a cluster
    pub fn election(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Election {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Store { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a store outage during apply surfaces the failing operation
    ///
    /// The controller requeues the key; the error text carries enough
    /// context to correlate warnings across retries.
    #[test]
    fn story_store_outage_carries_operation_context() {
        let err = Error::store("apply", "connection refused");
        assert!(err.to_string().contains("store error"));
        assert!(err.to_string().contains("[apply]"));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.context(), Some("apply"));
    }

    /// Story: malformed keys are reported with the offending key text
    ///
    /// A key that cannot be split into scope identifiers is requeued like any
    /// transient failure; after the retry ceiling it is dropped with this
    /// message in the warning record.
    #[test]
    fn story_malformed_key_names_the_key() {
        let err = Error::invalid_key("a/b/c", "too many separators");
        assert!(err.to_string().contains("a/b/c"));
        assert!(err.to_string().contains("too many separators"));
    }

    #[test]
    fn test_election_error_names_cluster() {
        let err = Error::election("prod-eu", "lease renewal conflict");
        assert!(err.to_string().contains("prod-eu"));
        assert!(err.to_string().contains("lease renewal conflict"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
    }

    #[test]
    fn test_internal_error_with_context() {
        let err = Error::internal_with_context("supervisor", "registry start failed");
        assert_eq!(err.context(), Some("supervisor"));
        assert!(err.to_string().contains("[supervisor]"));
    }
}
