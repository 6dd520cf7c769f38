//! Node registry and event decoding seams.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::ChainError;
use crate::types::{BlockNumber, Log, NodeEvent, NodeRecord, StreamId, StreamRecord, StreamUpdate};

/// Historical reads against the node/stream registry contract.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Every registered node (any status) as of `at`.
    async fn get_all_nodes(&self, at: BlockNumber) -> Result<Vec<NodeRecord>, ChainError>;

    /// Number of streams placed on `node` as of `at`.
    async fn get_stream_count_on_node(
        &self,
        at: BlockNumber,
        node: Address,
    ) -> Result<i64, ChainError>;

    /// Total number of streams as of `at`.
    async fn get_stream_count(&self, at: BlockNumber) -> Result<i64, ChainError>;

    /// The stream record as of `at`.
    async fn get_stream(&self, stream_id: StreamId, at: BlockNumber)
        -> Result<StreamRecord, ChainError>;
}

/// Registry events a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    NodeAdded,
    NodeRemoved,
    NodeStatusUpdated,
    NodeUrlUpdated,
    StreamUpdated,
}

/// Decodes registry logs into typed events.
///
/// Passed explicitly to the monitor and distributor so tests can swap in a
/// codec that matches their fake ledger.
pub trait RegistryCodec: Send + Sync {
    /// `topics[0]` of logs carrying `event`.
    fn topic(&self, event: RegistryEvent) -> B256;

    /// Decode a node-registry log.
    fn decode_node_event(&self, log: &Log) -> Result<NodeEvent, ChainError>;

    /// Decode a stream-updated log into its (possibly batched) updates.
    fn decode_stream_updates(&self, log: &Log) -> Result<Vec<StreamUpdate>, ChainError>;
}
