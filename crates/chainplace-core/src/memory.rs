//! In-memory chain.
//!
//! A single-process ledger that seals blocks on demand and keeps the node
//! registry state per block, so historical registry reads behave like the
//! real contract. Useful for tests and for the placement simulator.
//! All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use alloy_primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::LedgerClient;
use crate::error::ChainError;
use crate::registry::{NodeRegistry, RegistryCodec, RegistryEvent};
use crate::types::{
    BlockNumber, FilterQuery, Header, Log, MiniblockUpdate, NodeEvent, NodeRecord, NodeStatus,
    StreamId, StreamRecord, StreamState, StreamUpdate,
};

const BLOCK_TIME_SECS: u64 = 2;
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BASE_FEE_WEI: u128 = 1_000_000_000;

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Wire form of stream updates inside a `StreamUpdated` log.
#[derive(Debug, Serialize, Deserialize)]
enum WireStreamUpdate {
    Allocate(StreamState),
    Create(StreamState),
    PlacementUpdated(StreamState),
    LastMiniblockBatchUpdated(Vec<MiniblockUpdate>),
}

impl From<WireStreamUpdate> for StreamUpdate {
    fn from(w: WireStreamUpdate) -> Self {
        match w {
            WireStreamUpdate::Allocate(s) => Self::Allocate(s),
            WireStreamUpdate::Create(s) => Self::Create(s),
            WireStreamUpdate::PlacementUpdated(s) => Self::PlacementUpdated(s),
            WireStreamUpdate::LastMiniblockBatchUpdated(m) => Self::LastMiniblockBatchUpdated(m),
        }
    }
}

impl From<StreamUpdate> for WireStreamUpdate {
    fn from(u: StreamUpdate) -> Self {
        match u {
            StreamUpdate::Allocate(s) => Self::Allocate(s),
            StreamUpdate::Create(s) => Self::Create(s),
            StreamUpdate::PlacementUpdated(s) => Self::PlacementUpdated(s),
            StreamUpdate::LastMiniblockBatchUpdated(m) => Self::LastMiniblockBatchUpdated(m),
        }
    }
}

/// Codec for logs produced by [`MemoryChain`].
///
/// Topic 0 is the keccak of the event signature, indexed addresses are
/// left-padded into topics. Node statuses travel as a single data byte, urls
/// as raw UTF-8, and stream updates as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryRegistryCodec;

impl MemoryRegistryCodec {
    fn signature(event: RegistryEvent) -> &'static str {
        match event {
            RegistryEvent::NodeAdded => "NodeAdded(address,address,string,uint8)",
            RegistryEvent::NodeRemoved => "NodeRemoved(address)",
            RegistryEvent::NodeStatusUpdated => "NodeStatusUpdated(address,uint8)",
            RegistryEvent::NodeUrlUpdated => "NodeUrlUpdated(address,string)",
            RegistryEvent::StreamUpdated => "StreamUpdated(uint8,bytes)",
        }
    }

    /// Encode a node event as `(topics, data)`.
    pub fn encode_node_event(&self, event: &NodeEvent) -> (Vec<B256>, Bytes) {
        match event {
            NodeEvent::Added {
                node,
                operator,
                url,
                status,
            } => {
                let mut data = vec![status.as_u8()];
                data.extend_from_slice(url.as_bytes());
                (
                    vec![
                        self.topic(RegistryEvent::NodeAdded),
                        node.into_word(),
                        operator.into_word(),
                    ],
                    data.into(),
                )
            }
            NodeEvent::Removed { node } => (
                vec![self.topic(RegistryEvent::NodeRemoved), node.into_word()],
                Bytes::new(),
            ),
            NodeEvent::StatusUpdated { node, status } => (
                vec![self.topic(RegistryEvent::NodeStatusUpdated), node.into_word()],
                vec![status.as_u8()].into(),
            ),
            NodeEvent::UrlUpdated { node, url } => (
                vec![self.topic(RegistryEvent::NodeUrlUpdated), node.into_word()],
                url.as_bytes().to_vec().into(),
            ),
        }
    }

    /// Encode a batch of stream updates as `(topics, data)`.
    pub fn encode_stream_updates(&self, updates: Vec<StreamUpdate>) -> (Vec<B256>, Bytes) {
        let wire: Vec<WireStreamUpdate> = updates.into_iter().map(Into::into).collect();
        // serializing plain data structs cannot fail
        let data = serde_json::to_vec(&wire).unwrap_or_default();
        (vec![self.topic(RegistryEvent::StreamUpdated)], data.into())
    }

    fn decode_err(log: &Log, reason: impl Into<String>) -> ChainError {
        ChainError::Decode {
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            reason: reason.into(),
        }
    }

    fn indexed_address(log: &Log, position: usize) -> Result<Address, ChainError> {
        log.topics
            .get(position)
            .map(|t| Address::from_word(*t))
            .ok_or_else(|| Self::decode_err(log, format!("missing topic {position}")))
    }

    fn status(log: &Log, byte: Option<&u8>) -> Result<NodeStatus, ChainError> {
        let raw = byte.ok_or_else(|| Self::decode_err(log, "missing status"))?;
        NodeStatus::from_u8(*raw).ok_or_else(|| Self::decode_err(log, format!("unknown status {raw}")))
    }

    fn url(log: &Log, bytes: &[u8]) -> Result<String, ChainError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Self::decode_err(log, e.to_string()))
    }
}

impl RegistryCodec for MemoryRegistryCodec {
    fn topic(&self, event: RegistryEvent) -> B256 {
        keccak256(Self::signature(event).as_bytes())
    }

    fn decode_node_event(&self, log: &Log) -> Result<NodeEvent, ChainError> {
        let topic0 = *log
            .topics
            .first()
            .ok_or_else(|| Self::decode_err(log, "log without topics"))?;
        let node = Self::indexed_address(log, 1)?;

        if topic0 == self.topic(RegistryEvent::NodeAdded) {
            Ok(NodeEvent::Added {
                node,
                operator: Self::indexed_address(log, 2)?,
                status: Self::status(log, log.data.first())?,
                url: Self::url(log, log.data.get(1..).unwrap_or_default())?,
            })
        } else if topic0 == self.topic(RegistryEvent::NodeRemoved) {
            Ok(NodeEvent::Removed { node })
        } else if topic0 == self.topic(RegistryEvent::NodeStatusUpdated) {
            Ok(NodeEvent::StatusUpdated {
                node,
                status: Self::status(log, log.data.first())?,
            })
        } else if topic0 == self.topic(RegistryEvent::NodeUrlUpdated) {
            Ok(NodeEvent::UrlUpdated {
                node,
                url: Self::url(log, &log.data)?,
            })
        } else {
            Err(Self::decode_err(log, format!("unknown node event topic {topic0}")))
        }
    }

    fn decode_stream_updates(&self, log: &Log) -> Result<Vec<StreamUpdate>, ChainError> {
        if log.topics.first() != Some(&self.topic(RegistryEvent::StreamUpdated)) {
            return Err(Self::decode_err(log, "not a stream updated log"));
        }
        let wire: Vec<WireStreamUpdate> =
            serde_json::from_slice(&log.data).map_err(|e| Self::decode_err(log, e.to_string()))?;
        Ok(wire.into_iter().map(Into::into).collect())
    }
}

// ─── Chain ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct RegistryState {
    nodes: BTreeMap<Address, NodeRecord>,
    streams: HashMap<StreamId, StreamRecord>,
}

struct Block {
    header: Header,
    logs: Vec<Log>,
}

struct PendingLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

#[derive(Default)]
struct Faults {
    headers: u32,
    logs: u32,
    registry: u32,
}

struct ChainState {
    blocks: Vec<Block>,
    pending: Vec<PendingLog>,
    working: RegistryState,
    history: BTreeMap<BlockNumber, Arc<RegistryState>>,
    faults: Faults,
}

/// In-memory ledger plus node registry.
///
/// Mutations are buffered and become visible once [`commit`](Self::commit)
/// seals them into a block. Block 0 is sealed on construction.
pub struct MemoryChain {
    chain_id: u64,
    registry_address: Address,
    codec: MemoryRegistryCodec,
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new(chain_id: u64, registry_address: Address) -> Self {
        let genesis = Block {
            header: Header {
                number: BlockNumber(0),
                timestamp: GENESIS_TIMESTAMP,
                base_fee: Some(BASE_FEE_WEI),
            },
            logs: vec![],
        };
        let mut history = BTreeMap::new();
        history.insert(BlockNumber(0), Arc::new(RegistryState::default()));

        Self {
            chain_id,
            registry_address,
            codec: MemoryRegistryCodec,
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                pending: vec![],
                working: RegistryState::default(),
                history,
                faults: Faults::default(),
            }),
        }
    }

    /// Address logs of the registry contract are emitted from.
    pub fn registry_address(&self) -> Address {
        self.registry_address
    }

    /// Codec matching the logs this chain emits.
    pub fn codec(&self) -> MemoryRegistryCodec {
        self.codec
    }

    /// Latest sealed block.
    pub fn head(&self) -> BlockNumber {
        let state = self.state.lock().unwrap();
        BlockNumber(state.blocks.len() as u64 - 1)
    }

    /// Seal all buffered mutations into a new block and return its number.
    pub fn commit(&self) -> BlockNumber {
        let mut state = self.state.lock().unwrap();
        let number = BlockNumber(state.blocks.len() as u64);
        let pending = std::mem::take(&mut state.pending);
        let logs = pending
            .into_iter()
            .enumerate()
            .map(|(i, p)| Log {
                address: p.address,
                topics: p.topics,
                data: p.data,
                block_number: number,
                tx_hash: keccak256([number.0.to_be_bytes(), (i as u64).to_be_bytes()].concat()),
                log_index: i as u64,
                removed: false,
            })
            .collect();

        state.blocks.push(Block {
            header: Header {
                number,
                timestamp: GENESIS_TIMESTAMP + number.0 * BLOCK_TIME_SECS,
                base_fee: Some(BASE_FEE_WEI),
            },
            logs,
        });
        let snapshot = Arc::new(state.working.clone());
        state.history.insert(number, snapshot);
        number
    }

    /// Seal `n` blocks, returning the last one.
    pub fn commit_blocks(&self, n: usize) -> BlockNumber {
        let mut last = self.head();
        for _ in 0..n {
            last = self.commit();
        }
        last
    }

    /// Buffer an arbitrary log for the next block.
    pub fn emit_log(&self, address: Address, topics: Vec<B256>, data: Bytes) {
        self.state.lock().unwrap().pending.push(PendingLog {
            address,
            topics,
            data,
        });
    }

    fn emit_node_event(&self, event: &NodeEvent) {
        let (topics, data) = self.codec.encode_node_event(event);
        self.emit_log(self.registry_address, topics, data);
    }

    fn emit_stream_update(&self, update: StreamUpdate) {
        let (topics, data) = self.codec.encode_stream_updates(vec![update]);
        self.emit_log(self.registry_address, topics, data);
    }

    /// Register a node.
    pub fn add_node(&self, node: Address, operator: Address, url: &str, status: NodeStatus) {
        self.state.lock().unwrap().working.nodes.insert(
            node,
            NodeRecord {
                address: node,
                operator,
                status,
                url: url.to_string(),
            },
        );
        self.emit_node_event(&NodeEvent::Added {
            node,
            operator,
            url: url.to_string(),
            status,
        });
    }

    /// Remove a node from the registry.
    pub fn remove_node(&self, node: Address) {
        self.state.lock().unwrap().working.nodes.remove(&node);
        self.emit_node_event(&NodeEvent::Removed { node });
    }

    /// Change a node's status.
    pub fn set_node_status(&self, node: Address, status: NodeStatus) {
        if let Some(record) = self.state.lock().unwrap().working.nodes.get_mut(&node) {
            record.status = status;
        }
        self.emit_node_event(&NodeEvent::StatusUpdated { node, status });
    }

    /// Change a node's url.
    pub fn set_node_url(&self, node: Address, url: &str) {
        if let Some(record) = self.state.lock().unwrap().working.nodes.get_mut(&node) {
            record.url = url.to_string();
        }
        self.emit_node_event(&NodeEvent::UrlUpdated {
            node,
            url: url.to_string(),
        });
    }

    fn put_stream(&self, stream_id: StreamId, nodes: &[Address]) {
        let mut state = self.state.lock().unwrap();
        let record = state
            .working
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamRecord {
                stream_id,
                nodes: vec![],
                last_miniblock_num: 0,
            });
        record.nodes = nodes.to_vec();
    }

    /// Allocate a new stream on `nodes`.
    pub fn allocate_stream(&self, stream_id: StreamId, nodes: Vec<Address>) {
        self.put_stream(stream_id, &nodes);
        self.emit_stream_update(StreamUpdate::Allocate(StreamState { stream_id, nodes }));
    }

    /// Create a stream with its genesis on `nodes`.
    pub fn create_stream(&self, stream_id: StreamId, nodes: Vec<Address>) {
        self.put_stream(stream_id, &nodes);
        self.emit_stream_update(StreamUpdate::Create(StreamState { stream_id, nodes }));
    }

    /// Move an existing stream to `nodes`.
    pub fn update_placement(&self, stream_id: StreamId, nodes: Vec<Address>) {
        self.put_stream(stream_id, &nodes);
        self.emit_stream_update(StreamUpdate::PlacementUpdated(StreamState {
            stream_id,
            nodes,
        }));
    }

    /// Record a sealed miniblock for a stream.
    pub fn set_last_miniblock(&self, stream_id: StreamId, num: u64, hash: B256) {
        if let Some(record) = self.state.lock().unwrap().working.streams.get_mut(&stream_id) {
            record.last_miniblock_num = num;
        }
        self.emit_stream_update(StreamUpdate::LastMiniblockBatchUpdated(vec![MiniblockUpdate {
            stream_id,
            last_miniblock_num: num,
            last_miniblock_hash: hash,
        }]));
    }

    /// Fail the next `n` header requests.
    pub fn fail_next_headers(&self, n: u32) {
        self.state.lock().unwrap().faults.headers = n;
    }

    /// Fail the next `n` log requests.
    pub fn fail_next_logs(&self, n: u32) {
        self.state.lock().unwrap().faults.logs = n;
    }

    /// Fail the next `n` node listings.
    pub fn fail_next_registry_reads(&self, n: u32) {
        self.state.lock().unwrap().faults.registry = n;
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn registry_at(&self, at: BlockNumber) -> Result<Arc<RegistryState>, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .history
            .range(..=at)
            .next_back()
            .map(|(_, s)| Arc::clone(s))
            .ok_or_else(|| ChainError::Registry(format!("no registry state at block {at}")))
    }
}

#[async_trait]
impl LedgerClient for MemoryChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.head().as_u64())
    }

    async fn latest_header(&self) -> Result<Header, ChainError> {
        let mut state = self.state.lock().unwrap();
        if Self::take_fault(&mut state.faults.headers) {
            return Err(ChainError::Rpc("injected header failure".into()));
        }
        state
            .blocks
            .last()
            .map(|b| b.header.clone())
            .ok_or_else(|| ChainError::Rpc("empty chain".into()))
    }

    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, ChainError> {
        let mut state = self.state.lock().unwrap();
        if Self::take_fault(&mut state.faults.logs) {
            return Err(ChainError::Rpc("injected log failure".into()));
        }
        let from = query.from_block.as_u64() as usize;
        let to = (query.to_block.as_u64() as usize).min(state.blocks.len().saturating_sub(1));
        if from > to {
            return Ok(vec![]);
        }
        Ok(state.blocks[from..=to]
            .iter()
            .flat_map(|b| b.logs.iter())
            .filter(|log| query.matches(log))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeRegistry for MemoryChain {
    async fn get_all_nodes(&self, at: BlockNumber) -> Result<Vec<NodeRecord>, ChainError> {
        if Self::take_fault(&mut self.state.lock().unwrap().faults.registry) {
            return Err(ChainError::Registry("injected registry failure".into()));
        }
        Ok(self.registry_at(at)?.nodes.values().cloned().collect())
    }

    async fn get_stream_count_on_node(
        &self,
        at: BlockNumber,
        node: Address,
    ) -> Result<i64, ChainError> {
        let registry = self.registry_at(at)?;
        Ok(registry
            .streams
            .values()
            .filter(|s| s.nodes.contains(&node))
            .count() as i64)
    }

    async fn get_stream_count(&self, at: BlockNumber) -> Result<i64, ChainError> {
        Ok(self.registry_at(at)?.streams.len() as i64)
    }

    async fn get_stream(
        &self,
        stream_id: StreamId,
        at: BlockNumber,
    ) -> Result<StreamRecord, ChainError> {
        self.registry_at(at)?
            .streams
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| ChainError::Registry(format!("stream {stream_id} not found at {at}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[tokio::test]
    async fn commit_seals_logs_in_order() {
        let chain = MemoryChain::new(31337, addr(0xee));
        chain.add_node(addr(1), addr(0xa1), "https://n1", NodeStatus::Operational);
        chain.add_node(addr(2), addr(0xa2), "https://n2", NodeStatus::Operational);
        let block = chain.commit();
        assert_eq!(block, BlockNumber(1));

        let query = FilterQuery::default().with_range(BlockNumber(0), block);
        let logs = chain.filter_logs(&query).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].log_index, 0);
        assert_eq!(logs[1].log_index, 1);
        assert!(logs.iter().all(|l| l.block_number == block));
    }

    #[tokio::test]
    async fn registry_reads_are_versioned() {
        let chain = MemoryChain::new(1, addr(0xee));
        chain.add_node(addr(1), addr(0xa1), "https://n1", NodeStatus::Operational);
        let b1 = chain.commit();
        chain.set_node_status(addr(1), NodeStatus::Departing);
        let b2 = chain.commit();

        let at_b1 = chain.get_all_nodes(b1).await.unwrap();
        let at_b2 = chain.get_all_nodes(b2).await.unwrap();
        assert_eq!(at_b1[0].status, NodeStatus::Operational);
        assert_eq!(at_b2[0].status, NodeStatus::Departing);
        assert!(chain.get_all_nodes(BlockNumber(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn codec_decodes_emitted_events() {
        let chain = MemoryChain::new(1, addr(0xee));
        let codec = chain.codec();
        chain.add_node(addr(1), addr(0xa1), "https://n1", NodeStatus::Operational);
        chain.allocate_stream(B256::repeat_byte(7), vec![addr(1)]);
        let block = chain.commit();

        let logs = chain
            .filter_logs(&FilterQuery::default().with_range(block, block))
            .await
            .unwrap();
        assert_eq!(
            codec.decode_node_event(&logs[0]).unwrap(),
            NodeEvent::Added {
                node: addr(1),
                operator: addr(0xa1),
                url: "https://n1".into(),
                status: NodeStatus::Operational,
            }
        );
        let updates = codec.decode_stream_updates(&logs[1]).unwrap();
        assert!(matches!(&updates[..], [StreamUpdate::Allocate(s)] if s.nodes == vec![addr(1)]));
        assert_eq!(chain.get_stream_count_on_node(block, addr(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn garbage_stream_update_is_a_decode_error() {
        let chain = MemoryChain::new(1, addr(0xee));
        let codec = chain.codec();
        chain.emit_log(
            addr(0xee),
            vec![codec.topic(RegistryEvent::StreamUpdated)],
            Bytes::from_static(b"not json"),
        );
        let block = chain.commit();
        let logs = chain
            .filter_logs(&FilterQuery::default().with_range(block, block))
            .await
            .unwrap();
        assert!(codec.decode_stream_updates(&logs[0]).unwrap_err().is_decode());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let chain = MemoryChain::new(1, addr(0xee));
        chain.fail_next_headers(1);
        assert!(chain.latest_header().await.is_err());
        assert!(chain.latest_header().await.is_ok());
    }
}
