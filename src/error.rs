use crate::types::{ConnectionId, TransportKind};

pub type Result<T> = std::result::Result<T, ProximaError>;

#[derive(Debug, thiserror::Error)]
pub enum ProximaError {
    #[error("invalid usage: {reason}")]
    InvalidUsage { reason: String },

    #[error("{transport:?} cannot address {space} memory at 0x{ptr:x}")]
    UnaddressableMemory {
        transport: TransportKind,
        space: &'static str,
        ptr: u64,
    },

    #[error("fifo full: {capacity} triggers pending")]
    FifoFull { capacity: usize },

    #[error("{resource} capacity exhausted: {used}/{limit}")]
    Capacity {
        resource: &'static str,
        used: usize,
        limit: usize,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("connection {id} is broken: {reason}")]
    ConnectionBroken { id: ConnectionId, reason: String },

    #[error("unknown {table} id {id}")]
    UnknownId { table: &'static str, id: u32 },

    #[error("proxy is {state}: {reason}")]
    ProxyState {
        state: &'static str,
        reason: &'static str,
    },

    #[error("unsupported data type {dtype:?} for {op}")]
    UnsupportedDType {
        dtype: crate::types::DataType,
        op: &'static str,
    },

    #[error("internal transport failure: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProximaError {
    /// Create an `InvalidUsage` error with just a reason.
    pub fn invalid_usage(reason: impl Into<String>) -> Self {
        Self::InvalidUsage {
            reason: reason.into(),
        }
    }

    /// Create an `Internal` error with just a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an `Internal` error with a message and a source error.
    pub fn internal_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for failures a caller may retry after backing off
    /// (resource exhaustion, never protocol misuse).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FifoFull { .. } | Self::Capacity { .. } | Self::Timeout { .. }
        )
    }

    /// True for failures that leave the referenced connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::ConnectionBroken { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ProximaError::FifoFull { capacity: 128 };
        assert_eq!(e.to_string(), "fifo full: 128 triggers pending");

        let e = ProximaError::Timeout {
            operation: "flush",
            timeout_ms: 5000,
        };
        assert_eq!(e.to_string(), "flush timed out after 5000ms");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProximaError::FifoFull { capacity: 8 }.is_retryable());
        assert!(ProximaError::Capacity {
            resource: "multicast bind",
            used: 2,
            limit: 2
        }
        .is_retryable());
        assert!(!ProximaError::invalid_usage("bad operand").is_retryable());
        assert!(!ProximaError::internal("qp error").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProximaError::internal("nic gone").is_fatal());
        assert!(ProximaError::ConnectionBroken {
            id: 3,
            reason: "poisoned".into()
        }
        .is_fatal());
        assert!(!ProximaError::Timeout {
            operation: "wait",
            timeout_ms: 10
        }
        .is_fatal());
    }

    #[test]
    fn test_timeout_distinct_from_internal() {
        let t = ProximaError::Timeout {
            operation: "wait",
            timeout_ms: 100,
        };
        let i = ProximaError::internal("broken");
        assert!(t.is_retryable() && !t.is_fatal());
        assert!(i.is_fatal() && !i.is_retryable());
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<ProximaError> = vec![
            ProximaError::invalid_usage("x"),
            ProximaError::UnaddressableMemory {
                transport: TransportKind::PeerLink,
                space: "host",
                ptr: 0x1000,
            },
            ProximaError::FifoFull { capacity: 4 },
            ProximaError::Capacity {
                resource: "multicast bind",
                used: 2,
                limit: 2,
            },
            ProximaError::Timeout {
                operation: "flush",
                timeout_ms: 1,
            },
            ProximaError::ConnectionBroken {
                id: 0,
                reason: "x".into(),
            },
            ProximaError::UnknownId {
                table: "connection",
                id: 9,
            },
            ProximaError::ProxyState {
                state: "running",
                reason: "table frozen",
            },
            ProximaError::UnsupportedDType {
                dtype: crate::types::DataType::F16,
                op: "reduce",
            },
            ProximaError::internal("x"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
