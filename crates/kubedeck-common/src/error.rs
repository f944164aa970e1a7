//! Error types for kubedeck
//!
//! Errors are structured with fields so callers (and logs) can tell which
//! bundle, target or session a failure belongs to. Every remote or network
//! failure is represented as a value; nothing in the core panics on them.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubedeck operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed credential or configuration input, rejected before any state change
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field (e.g., "endpoint", "contexts[0].cluster")
        field: Option<String>,
    },

    /// Unknown bundle, target or session
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What was looked up ("bundle", "target", "exec session")
        kind: &'static str,
        /// The identifier that was not found
        name: String,
    },

    /// A client could not be constructed for a target
    #[error("cannot build client for {target}: {message}")]
    Build {
        /// Target the build was attempted for
        target: String,
        /// Description of what failed
        message: String,
    },

    /// A reachability probe failed or timed out
    #[error("{target} unreachable: {detail}")]
    Unreachable {
        /// Target that was probed
        target: String,
        /// Transport error text or timeout description
        detail: String,
    },

    /// A live feed refresh failed
    #[error("feed refresh failed: {message}")]
    Session {
        /// Description of what failed
        message: String,
    },

    /// Remote-stream negotiation or relay I/O failed
    #[error("exec bridge error: {message}")]
    Bridge {
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Persistence collaborator failure
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Unknown credential bundle
    pub fn bundle_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "bundle",
            name: id.into(),
        }
    }

    /// Unknown target within a bundle
    pub fn target_not_found(bundle: impl std::fmt::Display, target: &str) -> Self {
        Self::NotFound {
            kind: "target",
            name: format!("{}/{}", bundle, target),
        }
    }

    /// Unknown exec session
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "exec session",
            name: id.into(),
        }
    }

    /// Unknown remote resource
    pub fn resource_not_found(kind: &str, name: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "resource",
            name: format!("{} {}", kind, name),
        }
    }

    /// Create a client build error
    pub fn build(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create an unreachable error
    pub fn unreachable(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Unreachable {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Create a feed session error
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session {
            message: msg.into(),
        }
    }

    /// Create an exec bridge error
    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge {
            message: msg.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Whether this error means the caller asked for something that doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error was caused by bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
