//! Error types shared by the ledger and registry collaborators.

use alloy_primitives::B256;
use thiserror::Error;

/// Errors raised by ledger clients, registries and event decoders.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Unable to decode log {tx_hash}#{log_index}: {reason}")]
    Decode {
        tx_hash: B256,
        log_index: u64,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// Returns `true` if the error is a ledger hiccup that a later poll may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `true` if a single log could not be decoded.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ChainError::Rpc("timeout".into()).is_transient());
        assert!(!ChainError::Registry("gone".into()).is_transient());

        let err = ChainError::Decode {
            tx_hash: B256::ZERO,
            log_index: 3,
            reason: "short data".into(),
        };
        assert!(err.is_decode());
        assert!(err.to_string().contains("#3"));
    }
}
