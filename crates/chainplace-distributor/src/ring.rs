//! Hash ring snapshot.
//!
//! A [`Snapshot`] is immutable once published except for the per-node load
//! counters and the total stream counter, which are atomics shared with the
//! event handlers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::Address;
use sha2::{Digest, Sha256};

use chainplace_core::{
    BlockNumber, ChainError, NodeRecord, NodeRegistry, StreamDistribution, StreamId,
};

use crate::error::DistributorError;

/// Upper bound on ring steps per placement.
pub const MAX_RING_STEPS: usize = 1000;

// ─── Positions ───────────────────────────────────────────────────────────────

/// Ring position of arbitrary bytes: SHA-256 reduced mod 2^64, i.e. the low
/// 64 bits of the digest read big-endian.
///
/// Deployments that reduce mod `u64::MAX` (2^64 - 1) instead place streams
/// differently; rings built here do not interoperate with those.
pub fn position(input: &[u8]) -> u64 {
    let digest = Sha256::digest(input);
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[24..32]);
    u64::from_be_bytes(low)
}

/// Position of a stream on the ring.
pub fn stream_position(stream_id: &StreamId) -> u64 {
    position(stream_id.as_slice())
}

/// Position of a node's `seq`-th virtual node.
///
/// Preimage is 32 bytes: the address in bytes 0..20, zero padding, and `seq`
/// big-endian in bytes 24..32.
pub fn vnode_position(address: &Address, seq: u64) -> u64 {
    let mut preimage = [0u8; 32];
    preimage[..20].copy_from_slice(address.as_slice());
    preimage[24..].copy_from_slice(&seq.to_be_bytes());
    position(&preimage)
}

// ─── StreamNode ──────────────────────────────────────────────────────────────

/// An operational node on the ring together with its live stream load.
#[derive(Debug)]
pub struct StreamNode {
    record: NodeRecord,
    stream_count: AtomicI64,
    virtual_nodes: Vec<u64>,
}

impl StreamNode {
    pub fn address(&self) -> Address {
        self.record.address
    }

    pub fn operator(&self) -> Address {
        self.record.operator
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    /// Streams currently placed on this node.
    pub fn stream_count(&self) -> i64 {
        self.stream_count.load(Ordering::Acquire)
    }

    /// Ring positions owned by this node, in generation order.
    pub fn virtual_nodes(&self) -> &[u64] {
        &self.virtual_nodes
    }

    pub(crate) fn add_stream(&self) {
        self.stream_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero.
    pub(crate) fn remove_stream(&self) {
        let _ = self
            .stream_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c - 1).max(0)));
    }

    #[cfg(any(test, feature = "simulation"))]
    pub(crate) fn set_stream_count(&self, count: i64) {
        self.stream_count.store(count.max(0), Ordering::Release);
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Ring state built from the registry at one block.
///
/// Clones share node entries and the total stream counter, so load keeps
/// counting across copy-on-write updates.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    nodes: HashMap<Address, Arc<StreamNode>>,
    ring: HashMap<u64, Arc<StreamNode>>,
    sorted_keys: Vec<u64>,
    operators: HashSet<Address>,
    total_streams: Arc<AtomicU64>,
}

impl Snapshot {
    /// Read the registry at `at` and place every operational node on the ring.
    pub async fn load(
        registry: &dyn NodeRegistry,
        settings: StreamDistribution,
        at: BlockNumber,
    ) -> Result<Self, ChainError> {
        let mut records = registry.get_all_nodes(at).await?;
        records.sort_by_key(|r| r.address);

        let total = registry.get_stream_count(at).await?;
        let mut snapshot = Self {
            total_streams: Arc::new(AtomicU64::new(total.max(0) as u64)),
            ..Self::default()
        };

        let vnode_count = settings.effective_vnode_count();
        for record in records.into_iter().filter(|r| r.status.is_operational()) {
            let count = registry.get_stream_count_on_node(at, record.address).await?;
            snapshot.insert_node(record, count, vnode_count);
        }
        snapshot.sorted_keys.sort_unstable();

        tracing::debug!(
            block = %at,
            nodes = snapshot.nodes.len(),
            operators = snapshot.operators.len(),
            total_streams = snapshot.total_streams(),
            "built stream distribution snapshot"
        );
        Ok(snapshot)
    }

    /// Copy of this snapshot with `record` added. Returns a plain clone when
    /// the node is already present.
    pub fn with_node(&self, record: NodeRecord, stream_count: i64, vnode_count: usize) -> Self {
        let mut next = self.clone();
        if next.insert_node(record, stream_count, vnode_count) {
            next.sorted_keys.sort_unstable();
        }
        next
    }

    /// Leaves `sorted_keys` unsorted; callers sort once after a batch.
    fn insert_node(&mut self, record: NodeRecord, stream_count: i64, vnode_count: usize) -> bool {
        if self.nodes.contains_key(&record.address) {
            return false;
        }

        let mut positions = Vec::with_capacity(vnode_count);
        let mut seq = 1u64;
        while positions.len() < vnode_count {
            let pos = vnode_position(&record.address, seq);
            seq += 1;
            // collisions are skipped, the next sequence number is tried
            if self.ring.contains_key(&pos) || positions.contains(&pos) {
                continue;
            }
            positions.push(pos);
        }

        let node = Arc::new(StreamNode {
            stream_count: AtomicI64::new(stream_count.max(0)),
            virtual_nodes: positions.clone(),
            record,
        });
        for pos in positions {
            self.ring.insert(pos, Arc::clone(&node));
            self.sorted_keys.push(pos);
        }
        self.operators.insert(node.operator());
        self.nodes.insert(node.address(), node);
        true
    }

    pub fn node(&self, address: &Address) -> Option<&Arc<StreamNode>> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<StreamNode>> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Number of virtual nodes on the ring.
    pub fn ring_len(&self) -> usize {
        self.sorted_keys.len()
    }

    pub fn total_streams(&self) -> u64 {
        self.total_streams.load(Ordering::Acquire)
    }

    pub(crate) fn add_total_streams(&self, n: u64) {
        self.total_streams.fetch_add(n, Ordering::AcqRel);
    }

    /// Pick `count` nodes for `stream_id`.
    ///
    /// Walks the ring clockwise from the stream's position collecting distinct
    /// accepted nodes until `max(candidates, count)` candidates (capped at the
    /// node count) spanning `min(count, operators)` operators are found. The
    /// least-loaded candidates win; operators are unique whenever there are at
    /// least `count` of them.
    pub fn choose(
        &self,
        stream_id: &StreamId,
        count: usize,
        candidates: usize,
        accept: impl Fn(Address, Address) -> bool,
    ) -> Result<Vec<Address>, DistributorError> {
        let insufficient = || DistributorError::InsufficientNodesAvailable {
            requested: count,
            available: self.nodes.len(),
        };

        if count == 0 {
            return Ok(Vec::new());
        }
        if self.nodes.len() < count || self.sorted_keys.is_empty() {
            return Err(insufficient());
        }

        let wanted_candidates = candidates.max(count).min(self.nodes.len());
        let wanted_operators = count.min(self.operators.len());

        let start = self
            .sorted_keys
            .partition_point(|k| *k < stream_position(stream_id));

        let mut found: Vec<&Arc<StreamNode>> = Vec::with_capacity(wanted_candidates);
        let mut seen = HashSet::with_capacity(wanted_candidates);
        let mut found_operators = HashSet::new();
        let mut enough = false;

        for step in 0..MAX_RING_STEPS {
            let key = self.sorted_keys[(start + step) % self.sorted_keys.len()];
            let Some(node) = self.ring.get(&key) else {
                continue;
            };
            if !accept(node.address(), node.operator()) {
                continue;
            }
            if seen.insert(node.address()) {
                found.push(node);
                found_operators.insert(node.operator());
            }
            if found.len() >= wanted_candidates && found_operators.len() >= wanted_operators {
                enough = true;
                break;
            }
        }
        if !enough {
            return Err(insufficient());
        }

        // Loads are read once; sorting on live atomics could observe an
        // inconsistent order.
        let mut ranked: Vec<(i64, &Arc<StreamNode>)> =
            found.into_iter().map(|n| (n.stream_count(), n)).collect();
        ranked.sort_by_key(|(load, _)| *load);

        let unique_operators = count <= self.operators.len();
        let mut picked = Vec::with_capacity(count);
        let mut picked_operators = HashSet::with_capacity(count);
        for (_, node) in ranked {
            if picked.len() == count {
                break;
            }
            if unique_operators && !picked_operators.insert(node.operator()) {
                continue;
            }
            picked.push(node.address());
        }

        if picked.len() < count {
            return Err(insufficient());
        }
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use chainplace_core::NodeStatus;

    fn record(node: u8, operator: u8) -> NodeRecord {
        NodeRecord {
            address: Address::repeat_byte(node),
            operator: Address::repeat_byte(operator),
            status: NodeStatus::Operational,
            url: format!("https://node-{node}"),
        }
    }

    fn snapshot(nodes: &[(u8, u8)], vnodes: usize) -> Snapshot {
        nodes.iter().fold(Snapshot::default(), |s, (n, o)| {
            s.with_node(record(*n, *o), 0, vnodes)
        })
    }

    fn any(_: Address, _: Address) -> bool {
        true
    }

    #[test]
    fn position_is_low_64_bits_of_sha256() {
        let digest = Sha256::digest(b"stream");
        let expected = u64::from_be_bytes(digest[24..32].try_into().unwrap());
        assert_eq!(position(b"stream"), expected);
    }

    #[test]
    fn vnode_preimage_layout() {
        let address = Address::repeat_byte(0xab);
        let mut preimage = [0u8; 32];
        preimage[..20].fill(0xab);
        preimage[31] = 7;
        assert_eq!(vnode_position(&address, 7), position(&preimage));
    }

    #[test]
    fn ring_holds_vnode_count_positions_per_node() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa2), (3, 0xa1)], 50);
        assert_eq!(s.node_count(), 3);
        assert_eq!(s.operator_count(), 2);
        assert_eq!(s.ring_len(), 150);
        assert!(s.sorted_keys.windows(2).all(|w| w[0] < w[1]));
        for node in s.nodes() {
            assert_eq!(node.virtual_nodes().len(), 50);
            for pos in node.virtual_nodes() {
                assert_eq!(s.ring[pos].address(), node.address());
            }
        }
    }

    #[test]
    fn adding_a_present_node_changes_nothing() {
        let s = snapshot(&[(1, 0xa1)], 10);
        let again = s.with_node(record(1, 0xa2), 99, 10);
        assert_eq!(again.ring_len(), 10);
        assert_eq!(again.node(&Address::repeat_byte(1)).unwrap().stream_count(), 0);
        assert_eq!(again.operator_count(), 1);
    }

    #[test]
    fn clones_share_load_counters() {
        let s = snapshot(&[(1, 0xa1)], 10);
        let c = s.clone();
        s.node(&Address::repeat_byte(1)).unwrap().add_stream();
        assert_eq!(c.node(&Address::repeat_byte(1)).unwrap().stream_count(), 1);
    }

    #[test]
    fn clones_share_total_streams() {
        let s = snapshot(&[(1, 0xa1)], 10);
        let grown = s.with_node(record(2, 0xa2), 0, 10);
        s.add_total_streams(2);
        grown.add_total_streams(1);
        assert_eq!(s.total_streams(), 3);
        assert_eq!(grown.total_streams(), 3);
    }

    #[test]
    fn remove_stream_saturates_at_zero() {
        let s = snapshot(&[(1, 0xa1)], 10);
        let node = s.node(&Address::repeat_byte(1)).unwrap();
        node.remove_stream();
        assert_eq!(node.stream_count(), 0);
    }

    #[test]
    fn choose_is_deterministic_and_distinct() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa2), (3, 0xa3), (4, 0xa4), (5, 0xa5)], 100);
        let id = B256::repeat_byte(0x42);
        let first = s.choose(&id, 3, 4, any).unwrap();
        let second = s.choose(&id, 3, 4, any).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        let distinct: HashSet<_> = first.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn zero_count_yields_nothing() {
        let s = Snapshot::default();
        assert!(s.choose(&B256::ZERO, 0, 4, any).unwrap().is_empty());
    }

    #[test]
    fn too_few_nodes_is_an_error() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa2)], 20);
        let err = s.choose(&B256::ZERO, 3, 4, any).unwrap_err();
        assert!(err.is_insufficient_nodes());

        assert!(Snapshot::default()
            .choose(&B256::ZERO, 1, 4, any)
            .unwrap_err()
            .is_insufficient_nodes());
    }

    #[test]
    fn criteria_rejecting_too_many_nodes_is_an_error() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa2), (3, 0xa3)], 20);
        let only_one = Address::repeat_byte(1);
        let err = s
            .choose(&B256::ZERO, 2, 4, |node, _| node == only_one)
            .unwrap_err();
        assert!(err.is_insufficient_nodes());
    }

    #[test]
    fn operators_unique_when_enough_exist() {
        let s = snapshot(
            &[(1, 0xa1), (2, 0xa1), (3, 0xa2), (4, 0xa2), (5, 0xa3), (6, 0xa3)],
            60,
        );
        for i in 0..200u8 {
            let id = B256::repeat_byte(i);
            let picked = s.choose(&id, 3, 4, any).unwrap();
            let ops: HashSet<_> = picked
                .iter()
                .map(|a| s.node(a).unwrap().operator())
                .collect();
            assert_eq!(ops.len(), 3, "stream {id} got {picked:?}");
        }
    }

    #[test]
    fn operators_repeat_when_there_are_too_few() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa1), (3, 0xa2)], 30);
        let picked = s.choose(&B256::repeat_byte(9), 3, 4, any).unwrap();
        let nodes: HashSet<_> = picked.iter().collect();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn least_loaded_candidates_win() {
        let s = snapshot(&[(1, 0xa1), (2, 0xa2), (3, 0xa3), (4, 0xa4)], 40);
        // every node is a candidate, so the single least-loaded one is picked
        for (i, node) in s.nodes().enumerate() {
            node.set_stream_count(10 + i as i64);
        }
        let idle = Address::repeat_byte(3);
        s.node(&idle).unwrap().set_stream_count(0);

        for i in 0..50u8 {
            let picked = s.choose(&B256::repeat_byte(i), 1, 4, any).unwrap();
            assert_eq!(picked, vec![idle]);
        }
    }
}
