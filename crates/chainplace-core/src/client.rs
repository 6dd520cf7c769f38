//! The ledger client seam.
//!
//! The monitor only needs the chain id, the latest header, and logs over a
//! bounded block range. Implementations include `chainplace_rpc::HttpLedgerClient`
//! and the in-memory [`MemoryChain`](crate::memory::MemoryChain).

use async_trait::async_trait;

use crate::error::ChainError;
use crate::types::{FilterQuery, Header, Log};

/// Read access to an append-only ledger.
///
/// Implementations must tolerate being polled every block period.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain id used to label metrics.
    async fn chain_id(&self) -> Result<u64, ChainError>;

    /// Latest block number.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Header of the latest block.
    async fn latest_header(&self) -> Result<Header, ChainError>;

    /// All logs in `[query.from_block, query.to_block]` that match the filter,
    /// in ledger order.
    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, ChainError>;
}

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Result<u64, ChainError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Rpc(format!("invalid hex quantity {s:?}: {e}")))
}

/// Parse a hex quantity that may exceed 64 bits (base fees).
pub fn parse_hex_u128(s: &str) -> Result<u128, ChainError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::Rpc(format!("invalid hex quantity {s:?}: {e}")))
}
