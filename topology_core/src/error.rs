//! Error types for the topology engine
//!
//! Every public operation returns [`TopologyError`]. The variants follow the
//! operator-facing taxonomy: argument validation, lock contention,
//! connectivity, quorum, transaction-set consistency and partial failures of
//! multi-member operations. [`ErrorKind`] gives callers a stable classifier
//! that does not depend on message text.

use crate::address::InstanceAddress;
use crate::connector::ConnectorError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

/// A member that did not complete its part of a multi-member operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberFailure {
    pub address: String,
    pub reason: String,
}

impl MemberFailure {
    pub fn new(address: impl ToString, reason: impl ToString) -> Self {
        Self {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.address, self.reason)
    }
}

fn describe_failures(failures: &[MemberFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Validation,
    LockContention,
    Connectivity,
    Quorum,
    Consistency,
    PartialFailure,
    Timeout,
    Cancelled,
    Replication,
    Metadata,
    NotFound,
    Dissolved,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Quorum => "quorum",
            ErrorKind::Consistency => "consistency",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Replication => "replication",
            ErrorKind::Metadata => "metadata",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Dissolved => "dissolved",
        }
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("{0}")]
    Validation(String),

    #[error(
        "Failed to acquire {mode} lock on {scope}: operation '{holder}' holds a conflicting lock. \
         Another operation requiring access to the {scope} is still in progress, please wait for it to finish and try again."
    )]
    LockContention {
        scope: String,
        mode: String,
        holder: String,
    },

    #[error("Could not reach instance '{address}': {message}")]
    Connectivity { address: String, message: String },

    #[error("{0}")]
    Quorum(String),

    #[error("{0}")]
    Consistency(String),

    #[error("{operation} did not complete on all members; the following may be left inconsistent: {}", describe_failures(.failures))]
    PartialFailure {
        operation: String,
        failures: Vec<MemberFailure>,
    },

    #[error("Timeout waiting for {what} after {}ms", .elapsed.as_millis())]
    Timeout { what: String, elapsed: Duration },

    #[error("Operation cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("Instance '{address}' rejected the operation: {message}")]
    Replication { address: String, message: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    NotFound(String),

    #[error("Can't call function '{operation}' on a dissolved cluster '{name}'")]
    Dissolved { name: String, operation: String },
}

impl TopologyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TopologyError::Validation(_) => ErrorKind::Validation,
            TopologyError::LockContention { .. } => ErrorKind::LockContention,
            TopologyError::Connectivity { .. } => ErrorKind::Connectivity,
            TopologyError::Quorum(_) => ErrorKind::Quorum,
            TopologyError::Consistency(_) => ErrorKind::Consistency,
            TopologyError::PartialFailure { .. } => ErrorKind::PartialFailure,
            TopologyError::Timeout { .. } => ErrorKind::Timeout,
            TopologyError::Cancelled(_) => ErrorKind::Cancelled,
            TopologyError::Replication { .. } => ErrorKind::Replication,
            TopologyError::Metadata(_) => ErrorKind::Metadata,
            TopologyError::NotFound(_) => ErrorKind::NotFound,
            TopologyError::Dissolved { .. } => ErrorKind::Dissolved,
        }
    }

    /// Whether the same call may succeed if simply retried later
    pub fn is_retryable(&self) -> bool {
        match self {
            TopologyError::LockContention { .. } => true,
            TopologyError::Metadata(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Translate a collaborator failure on `address` into the engine taxonomy
    pub fn from_connector(address: &InstanceAddress, error: ConnectorError) -> Self {
        match error {
            ConnectorError::Unreachable(message) => TopologyError::Connectivity {
                address: address.to_string(),
                message,
            },
            ConnectorError::Timeout => TopologyError::Connectivity {
                address: address.to_string(),
                message: "connection timed out".to_string(),
            },
            ConnectorError::Rejected { code, message } => TopologyError::Replication {
                address: address.to_string(),
                message: format!("error {}: {}", code, message),
            },
        }
    }

    pub fn connectivity(address: &InstanceAddress, message: impl Into<String>) -> Self {
        TopologyError::Connectivity {
            address: address.to_string(),
            message: message.into(),
        }
    }
}

/// Failures of the durable metadata store
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata for {scope} changed concurrently: expected version {expected}, found {actual}")]
    Conflict {
        scope: String,
        expected: u64,
        actual: u64,
    },

    #[error("Metadata document was updated concurrently (expected document version {expected:?}, found {actual:?})")]
    VersionMismatch {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Metadata write could not be committed after {attempts} attempts")]
    Contended { attempts: u32 },

    #[error("Incompatible metadata schema version {found}; this engine supports {supported}")]
    IncompatibleSchema { found: String, supported: String },

    #[error("Metadata schema is not installed")]
    NotInstalled,

    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MetadataError::Unavailable(_) | MetadataError::Contended { .. } | MetadataError::VersionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_lists_members() {
        let err = TopologyError::PartialFailure {
            operation: "dissolve".to_string(),
            failures: vec![
                MemberFailure::new("h1:3306", "timeout applying transactions"),
                MemberFailure::new("h2:3306", "unreachable"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("'h1:3306' (timeout applying transactions)"));
        assert!(message.contains("'h2:3306' (unreachable)"));
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
    }

    #[test]
    fn test_lock_contention_is_retryable() {
        let err = TopologyError::LockContention {
            scope: "instance 'h1:3306'".to_string(),
            mode: "EXCLUSIVE".to_string(),
            holder: "remove_instance".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("please wait for it to finish and try again"));
        assert!(!TopologyError::Quorum("no quorum".to_string()).is_retryable());
    }

    #[test]
    fn test_connector_error_mapping() {
        let addr = InstanceAddress::new("h1", 3306);
        let err = TopologyError::from_connector(&addr, ConnectorError::Unreachable("refused".into()));
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        let err = TopologyError::from_connector(
            &addr,
            ConnectorError::Rejected {
                code: 3092,
                message: "group is not running".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::Replication);
    }
}
