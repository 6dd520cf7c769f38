//! Shared types for the monitor and the distributor.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Streams are identified by a 32-byte id.
pub type StreamId = B256;

// ─── BlockNumber ─────────────────────────────────────────────────────────────

/// Position in the ledger. Totally ordered and monotonically increasing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The block after this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The block before this one, saturating at genesis.
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl From<u64> for BlockNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Header / Log ────────────────────────────────────────────────────────────

/// The subset of a block header the monitor needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: BlockNumber,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    /// EIP-1559 base fee in wei, absent on pre-London chains.
    pub base_fee: Option<u128>,
}

/// An event log emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: BlockNumber,
    pub tx_hash: B256,
    pub log_index: u64,
    /// Set when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

// ─── FilterQuery ─────────────────────────────────────────────────────────────

/// A log filter over an inclusive block range.
///
/// `topics[i]` is the set of accepted values at topic position `i`; an empty
/// set accepts anything at that position. Positions past the end of `topics`
/// are not inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuery {
    /// Only logs from these contracts (empty = all contracts).
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

impl FilterQuery {
    /// Set the inclusive block range.
    pub fn with_range(mut self, from: BlockNumber, to: BlockNumber) -> Self {
        self.from_block = from;
        self.to_block = to;
        self
    }

    /// Returns `true` if `address` passes the address filter.
    pub fn matches_address(&self, address: &Address) -> bool {
        self.addresses.is_empty() || self.addresses.contains(address)
    }

    /// Returns `true` if `log` passes both the address and the topic filter.
    /// The block range is not checked.
    pub fn matches(&self, log: &Log) -> bool {
        self.matches_address(&log.address) && topics_match(&self.topics, &log.topics)
    }
}

/// OR within a position, AND across positions. Trailing log topics beyond the
/// filter are ignored.
pub fn topics_match(filter: &[Vec<B256>], topics: &[B256]) -> bool {
    filter.iter().enumerate().all(|(i, alternatives)| {
        alternatives.is_empty()
            || topics
                .get(i)
                .is_some_and(|topic| alternatives.contains(topic))
    })
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a registered node. Only `Operational` nodes store streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    NotInitialized,
    RemoteOnly,
    Operational,
    Failed,
    Departing,
    Deleted,
}

impl NodeStatus {
    /// Decode the registry's numeric status.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NotInitialized,
            1 => Self::RemoteOnly,
            2 => Self::Operational,
            3 => Self::Failed,
            4 => Self::Departing,
            5 => Self::Deleted,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::NotInitialized => 0,
            Self::RemoteOnly => 1,
            Self::Operational => 2,
            Self::Failed => 3,
            Self::Departing => 4,
            Self::Deleted => 5,
        }
    }

    pub fn is_operational(self) -> bool {
        self == Self::Operational
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "not-initialized"),
            Self::RemoteOnly => write!(f, "remote-only"),
            Self::Operational => write!(f, "operational"),
            Self::Failed => write!(f, "failed"),
            Self::Departing => write!(f, "departing"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A node as registered in the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: Address,
    /// Identity of the entity running the node.
    pub operator: Address,
    pub status: NodeStatus,
    pub url: String,
}

/// Membership change decoded from a node registry log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added {
        node: Address,
        operator: Address,
        url: String,
        status: NodeStatus,
    },
    Removed {
        node: Address,
    },
    StatusUpdated {
        node: Address,
        status: NodeStatus,
    },
    UrlUpdated {
        node: Address,
        url: String,
    },
}

impl NodeEvent {
    /// The node the event is about.
    pub fn node(&self) -> Address {
        match self {
            Self::Added { node, .. }
            | Self::Removed { node }
            | Self::StatusUpdated { node, .. }
            | Self::UrlUpdated { node, .. } => *node,
        }
    }
}

// ─── Streams ─────────────────────────────────────────────────────────────────

/// Stream placement carried by allocate/create/placement events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_id: StreamId,
    pub nodes: Vec<Address>,
}

/// A stream's sealed-miniblock progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniblockUpdate {
    pub stream_id: StreamId,
    pub last_miniblock_num: u64,
    pub last_miniblock_hash: B256,
}

/// A stream record as stored in the registry at some block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    pub nodes: Vec<Address>,
    pub last_miniblock_num: u64,
}

/// One entry of a decoded stream-updated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    Allocate(StreamState),
    Create(StreamState),
    PlacementUpdated(StreamState),
    LastMiniblockBatchUpdated(Vec<MiniblockUpdate>),
}

impl StreamUpdate {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allocate(_) => "allocate",
            Self::Create(_) => "create",
            Self::PlacementUpdated(_) => "placement-updated",
            Self::LastMiniblockBatchUpdated(_) => "last-miniblock-batch-updated",
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_topics(topics: Vec<B256>) -> Log {
        Log {
            address: Address::repeat_byte(0x11),
            topics,
            data: Bytes::new(),
            block_number: BlockNumber(10),
            tx_hash: B256::ZERO,
            log_index: 0,
            removed: false,
        }
    }

    #[test]
    fn block_number_neighbours() {
        assert_eq!(BlockNumber(10).next(), BlockNumber(11));
        assert_eq!(BlockNumber(10).prev(), BlockNumber(9));
        assert_eq!(BlockNumber(0).prev(), BlockNumber(0));
        assert!(BlockNumber(3) < BlockNumber(4));
    }

    #[test]
    fn topics_or_within_and_across() {
        let a = B256::repeat_byte(1);
        let b = B256::repeat_byte(2);
        let c = B256::repeat_byte(3);

        let filter = vec![vec![a, b], vec![c]];
        assert!(topics_match(&filter, &[a, c]));
        assert!(topics_match(&filter, &[b, c]));
        assert!(!topics_match(&filter, &[c, c]));
        assert!(!topics_match(&filter, &[a, a]));
        // missing position cannot satisfy a non-empty alternative set
        assert!(!topics_match(&filter, &[a]));
    }

    #[test]
    fn trailing_topics_and_wildcards_ignored() {
        let a = B256::repeat_byte(1);
        let b = B256::repeat_byte(2);
        assert!(topics_match(&[vec![a]], &[a, b, b]));
        assert!(topics_match(&[vec![], vec![b]], &[a, b]));
        assert!(topics_match(&[], &[]));
    }

    #[test]
    fn query_matches_address_and_topics() {
        let a = B256::repeat_byte(1);
        let query = FilterQuery {
            addresses: vec![Address::repeat_byte(0x11)],
            topics: vec![vec![a]],
            ..Default::default()
        };
        assert!(query.matches(&log_with_topics(vec![a])));

        let mut other = log_with_topics(vec![a]);
        other.address = Address::repeat_byte(0x22);
        assert!(!query.matches(&other));
    }

    #[test]
    fn node_status_roundtrip_values() {
        for v in 0..=5u8 {
            assert_eq!(NodeStatus::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(NodeStatus::from_u8(6).is_none());
        assert!(NodeStatus::Operational.is_operational());
        assert!(!NodeStatus::Departing.is_operational());
    }
}
