//! Distributor error types.

use alloy_primitives::Address;
use chainplace_core::ChainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistributorError {
    /// Not enough operational nodes (or operators) to satisfy a placement.
    /// No partial result is ever returned.
    #[error("insufficient nodes available to choose stream nodes: requested {requested}, available {available}")]
    InsufficientNodesAvailable { requested: usize, available: usize },

    /// Reading the node registry failed.
    #[error("registry error: {0}")]
    Registry(#[from] ChainError),

    #[error("node {0} not found in distributor")]
    UnknownNode(Address),
}

impl DistributorError {
    pub fn is_insufficient_nodes(&self) -> bool {
        matches!(self, Self::InsufficientNodesAvailable { .. })
    }
}
