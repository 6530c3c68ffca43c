//! Error types for the masterswitch recovery engine.
//!
//! This module provides a unified error type [`RecoveryError`] for all
//! engine operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Topology**: reads and side-effecting replication calls against the
//!   metadata store
//! - **Registration**: recovery/detection record bookkeeping
//! - **Hooks**: external process execution
//! - **Consensus**: command publication through the consensus log
//! - **Configuration**: invalid settings
//!
//! Most remote-operation errors are non-fatal to a recovery: executors
//! accumulate them on the recovery record and keep going. Use
//! [`RecoveryError::is_retryable`] to distinguish transient conditions.

use std::io;
use thiserror::Error;

/// Main error type for recovery operations.
#[derive(Error, Debug)]
pub enum RecoveryError {
    // Topology / metadata store errors
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Instance unreachable: {0}")]
    InstanceUnreachable(String),

    #[error("Replication operation failed on {instance}: {reason}")]
    ReplicationOperation { instance: String, reason: String },

    #[error("Cannot replicate: {0}")]
    CannotReplicate(String),

    #[error("No successor promoted for {0}")]
    NoSuccessorPromoted(String),

    // Registration errors
    #[error("Recovery already active on {0}")]
    RecoveryAlreadyActive(String),

    #[error("Recovery recently completed on {0}")]
    RecoveryRecentlyCompleted(String),

    #[error("Recovery registration failed: {0}")]
    RegistrationFailed(String),

    // Promotion gate errors
    #[error("Promotion aborted: {0}")]
    PromotionAborted(String),

    // Hook errors
    #[error("Hook execution failed: {0}")]
    HookFailed(String),

    // Consensus errors
    #[error("Not the leader")]
    NotLeader,

    #[error("Consensus publication failed: {0}")]
    ConsensusPublish(String),

    // Takeover errors
    #[error("Takeover precondition failed: {0}")]
    TakeoverPrecondition(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Generic
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecoveryError {
    /// Check if the error represents a transient condition worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecoveryError::InstanceUnreachable(_)
                | RecoveryError::Timeout(_)
                | RecoveryError::NotLeader
                | RecoveryError::ConsensusPublish(_)
        )
    }

    /// Check if the error is a silent pre-condition failure: the dispatcher
    /// exits without attempting recovery and without raising.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RecoveryError::RecoveryAlreadyActive(_) | RecoveryError::RecoveryRecentlyCompleted(_)
        )
    }
}

/// Result type alias for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RecoveryError::InstanceUnreachable("db1:3306".into()).is_retryable());
        assert!(RecoveryError::NotLeader.is_retryable());
        assert!(!RecoveryError::PromotionAborted("cross-DC".into()).is_retryable());
    }

    #[test]
    fn test_precondition_classification() {
        assert!(RecoveryError::RecoveryAlreadyActive("db1:3306".into()).is_precondition());
        assert!(!RecoveryError::HookFailed("exit 1".into()).is_precondition());
    }
}
