//! Transport-level error types.

use chainplace_core::ChainError;
use thiserror::Error;

/// Errors raised while talking to a JSON-RPC endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, reset, non-2xx status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Well-formed JSON that does not carry what the method promises.
    #[error("Invalid response to {method}: {reason}")]
    InvalidResponse { method: &'static str, reason: String },
}

impl TransportError {
    /// Returns `true` if the request may succeed when sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<TransportError> for ChainError {
    fn from(e: TransportError) -> Self {
        ChainError::Rpc(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(TransportError::Http("connection reset".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 100 }.is_retryable());
        assert!(!TransportError::Rpc {
            code: -32602,
            message: "invalid params".into()
        }
        .is_retryable());
    }

    #[test]
    fn converts_into_transient_chain_error() {
        let err: ChainError = TransportError::Timeout { ms: 5 }.into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("5ms"));
    }
}
