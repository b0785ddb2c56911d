//! Error types for the MPI operator control plane
//!
//! Errors carry the context needed to diagnose a failed startup from the
//! log line alone: which client role failed, which lock was contended,
//! which stage of the bootstrap was running.

use thiserror::Error;

/// Main error type for operator control-plane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or unreadable configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// A credentialed client could not be built
    #[error("failed to construct {role} client: {message}")]
    ClientConstruction {
        /// Logical role of the client that failed (e.g. "leader-election")
        role: String,
        /// Description of what failed
        message: String,
    },

    /// The candidate identity could not be derived
    #[error("identity error: {message}")]
    Identity {
        /// Description of what failed
        message: String,
    },

    /// Leader election error
    #[error("leader election error [{lock}]: {message}")]
    Election {
        /// Lock the error occurred on, as namespace/name
        lock: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "controller", "healthz")
        context: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a client construction error tagged with the failing role
    pub fn client_construction(role: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClientConstruction {
            role: role.into(),
            message: msg.into(),
        }
    }

    /// Create an identity error
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity {
            message: msg.into(),
        }
    }

    /// Create a leader election error for the given lock
    pub fn election(lock: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Election {
            lock: lock.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed
    ///
    /// Configuration and construction failures are permanent: restarting
    /// the process with the same inputs fails the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } | Error::Election { .. } | Error::Internal { .. } => true,
            Error::Config { .. } | Error::ClientConstruction { .. } | Error::Identity { .. } => {
                false
            }
        }
    }
}
