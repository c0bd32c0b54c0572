use std::time::Duration;
use thiserror::Error;

use crate::model::{Key, PartitionId, Role};
use crate::store::{Endpoint, StoreError};

/// Errors surfaced by the partitioned data access layer.
///
/// A record that simply is not there is not an error; lookups return
/// `Ok(None)` for that case.
#[derive(Debug, Error)]
pub enum PdalError {
    #[error("Pool exhausted: no connection to {endpoint} became free within {timeout:?}")]
    PoolExhausted { endpoint: String, timeout: Duration },

    #[error("Pool closed: {endpoint}")]
    PoolClosed { endpoint: String },

    #[error("No {role} pool configured for partition {partition}")]
    NoSuchPool { partition: PartitionId, role: Role },

    #[error("Transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Store at {endpoint} rejected the operation: {message}")]
    Rejected { endpoint: String, message: String },

    #[error("Conflict: record {key} already exists")]
    Conflict { key: Key },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Write to partition {partition} failed: {source}")]
    WriteFailed {
        partition: PartitionId,
        #[source]
        source: Box<PdalError>,
    },

    #[error("Read from partition {partition} failed: {source}")]
    ReadFailed {
        partition: PartitionId,
        #[source]
        source: Box<PdalError>,
    },

    #[error("Bootstrap of partition {partition} failed: {source}")]
    Bootstrap {
        partition: PartitionId,
        #[source]
        source: Box<PdalError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PdalError {
    /// Translate a store failure observed on `endpoint`.
    pub fn from_store(endpoint: &Endpoint, err: StoreError) -> Self {
        let endpoint = endpoint.to_string();
        match err {
            StoreError::Transport(message) => PdalError::Transport { endpoint, message },
            StoreError::UniqueViolation(message) | StoreError::Rejected(message) => {
                PdalError::Rejected { endpoint, message }
            }
        }
    }

    pub(crate) fn write_failed(partition: PartitionId, source: PdalError) -> Self {
        PdalError::WriteFailed {
            partition,
            source: Box::new(source),
        }
    }

    pub(crate) fn read_failed(partition: PartitionId, source: PdalError) -> Self {
        PdalError::ReadFailed {
            partition,
            source: Box::new(source),
        }
    }

    pub(crate) fn bootstrap(partition: PartitionId, source: PdalError) -> Self {
        PdalError::Bootstrap {
            partition,
            source: Box::new(source),
        }
    }

    /// Get the error code string for this error.
    pub fn code(&self) -> &'static str {
        match self {
            PdalError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            PdalError::PoolClosed { .. } => "POOL_CLOSED",
            PdalError::NoSuchPool { .. } => "NO_SUCH_POOL",
            PdalError::Transport { .. } => "TRANSPORT_ERROR",
            PdalError::Rejected { .. } => "REJECTED",
            PdalError::Conflict { .. } => "CONFLICT",
            PdalError::InvalidRecord(_) => "INVALID_RECORD",
            PdalError::WriteFailed { .. } => "WRITE_FAILED",
            PdalError::ReadFailed { .. } => "READ_FAILED",
            PdalError::Bootstrap { .. } => "BOOTSTRAP_FAILED",
            PdalError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether re-issuing the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PdalError::PoolExhausted { .. } | PdalError::Transport { .. } => true,
            PdalError::WriteFailed { source, .. } | PdalError::ReadFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    /// Whether a read that hit this error may be retried on another store
    /// of the same partition.
    pub fn allows_failover(&self) -> bool {
        !matches!(
            self,
            PdalError::Conflict { .. } | PdalError::InvalidRecord(_) | PdalError::Config(_)
        )
    }

    /// The innermost cause, looking through write/read/bootstrap wrappers.
    pub fn root(&self) -> &PdalError {
        match self {
            PdalError::WriteFailed { source, .. }
            | PdalError::ReadFailed { source, .. }
            | PdalError::Bootstrap { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type PdalResult<T> = Result<T, PdalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_looks_through_wrappers() {
        let exhausted = PdalError::PoolExhausted {
            endpoint: "primary 127.0.0.1:5432".to_string(),
            timeout: Duration::from_millis(10),
        };
        let wrapped = PdalError::write_failed(PartitionId(1), exhausted);
        assert!(wrapped.is_retryable());
        assert_eq!(wrapped.code(), "WRITE_FAILED");
        assert_eq!(wrapped.root().code(), "POOL_EXHAUSTED");

        let conflict = PdalError::Conflict { key: Key::Integer(1) };
        assert!(!conflict.is_retryable());
        assert!(!conflict.allows_failover());
    }

    #[test]
    fn test_write_failed_message_carries_cause() {
        let err = PdalError::write_failed(
            PartitionId(0),
            PdalError::Transport {
                endpoint: "primary db:5432".to_string(),
                message: "connection reset".to_string(),
            },
        );
        let text = err.to_string();
        assert!(text.contains("partition 0"));
        assert!(text.contains("connection reset"));
    }
}
