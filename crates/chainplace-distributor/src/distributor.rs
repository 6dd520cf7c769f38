//! Stream placement over the hash ring, kept current by chain events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::Address;
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use chainplace_core::{
    BlockNumber, Header, Log, NodeEvent, NodeRegistry, OnChainConfig, RegistryCodec,
    RegistryEvent, StreamId, StreamUpdate,
};
use chainplace_monitor::{ChainMonitor, NodeRegistryMonitor};

use crate::error::DistributorError;
use crate::ring::Snapshot;

/// Chooses the nodes a stream is placed on.
///
/// Placement reads the current [`Snapshot`] without locking. Node membership
/// changes mark the snapshot stale; the next header rebuilds it at that
/// header's block. Stream events adjust per-node load in place.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) snapshot: ArcSwap<Snapshot>,
    registry: Arc<dyn NodeRegistry>,
    codec: Arc<dyn RegistryCodec>,
    pub(crate) config: Arc<dyn OnChainConfig>,
    registry_changed: AtomicBool,
    /// Held by the one rebuild in flight.
    rebuild_guard: Arc<Mutex<()>>,
}

impl Distributor {
    /// Build the snapshot at `at` and subscribe to everything after it: headers
    /// drive rebuilds, node events mark the registry changed, and stream
    /// events update load.
    pub async fn new(
        registry: Arc<dyn NodeRegistry>,
        codec: Arc<dyn RegistryCodec>,
        config: Arc<dyn OnChainConfig>,
        at: BlockNumber,
        monitor: &ChainMonitor,
        registry_address: Address,
    ) -> Result<Self, DistributorError> {
        let distributor = Self::detached(registry, codec, config, at).await?;
        distributor.attach(monitor, registry_address, at.next());
        Ok(distributor)
    }

    /// Build the snapshot at `at` without subscribing to chain events.
    pub async fn detached(
        registry: Arc<dyn NodeRegistry>,
        codec: Arc<dyn RegistryCodec>,
        config: Arc<dyn OnChainConfig>,
        at: BlockNumber,
    ) -> Result<Self, DistributorError> {
        let snapshot = Snapshot::load(registry.as_ref(), config.stream_distribution(), at).await?;
        tracing::info!(
            block = %at,
            nodes = snapshot.node_count(),
            operators = snapshot.operator_count(),
            total_streams = snapshot.total_streams(),
            "stream distributor ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                snapshot: ArcSwap::from_pointee(snapshot),
                registry,
                codec,
                config,
                registry_changed: AtomicBool::new(false),
                rebuild_guard: Arc::new(Mutex::new(())),
            }),
        })
    }

    /// Subscribe to headers and registry events from `from` on.
    pub fn attach(&self, monitor: &ChainMonitor, registry_address: Address, from: BlockNumber) {
        let this = self.clone();
        monitor.on_header(move |header| {
            let this = this.clone();
            async move {
                this.on_header(&header);
            }
        });

        let nodes = NodeRegistryMonitor::new(
            monitor.clone(),
            registry_address,
            Arc::clone(&self.inner.codec),
        );
        let this = self.clone();
        let reload = move |_event: NodeEvent| {
            let this = this.clone();
            async move { this.reload() }
        };
        nodes.on_node_added(from, reload.clone());
        nodes.on_node_removed(from, reload.clone());
        nodes.on_node_status_updated(from, reload);

        let this = self.clone();
        let topics = vec![vec![self.inner.codec.topic(RegistryEvent::StreamUpdated)]];
        monitor.on_contract_with_topics_event(from, registry_address, topics, move |log| {
            let this = this.clone();
            async move { this.on_stream_update(&log).await }
        });
    }

    /// Choose `count` nodes for `stream_id` from all operational nodes.
    pub fn choose_stream_nodes(
        &self,
        stream_id: &StreamId,
        count: usize,
    ) -> Result<Vec<Address>, DistributorError> {
        self.choose_stream_nodes_with_criteria(stream_id, count, |_, _| true)
    }

    /// Choose `count` nodes for `stream_id` among nodes for which
    /// `accept(node, operator)` holds.
    pub fn choose_stream_nodes_with_criteria(
        &self,
        stream_id: &StreamId,
        count: usize,
        accept: impl Fn(Address, Address) -> bool,
    ) -> Result<Vec<Address>, DistributorError> {
        let candidates = self
            .inner
            .config
            .stream_distribution()
            .effective_candidates_count();
        self.inner
            .snapshot
            .load()
            .choose(stream_id, count, candidates, accept)
    }

    /// Mark the registry as changed; the next header rebuilds the snapshot.
    pub fn reload(&self) {
        self.inner.registry_changed.store(true, Ordering::Release);
    }

    /// Whether a rebuild is pending.
    pub fn registry_changed(&self) -> bool {
        self.inner.registry_changed.load(Ordering::Acquire)
    }

    /// Start a background rebuild at `header.number` when the registry changed
    /// and no rebuild is running. Returns the spawned task, if any.
    pub fn on_header(&self, header: &Header) -> Option<JoinHandle<()>> {
        if !self.registry_changed() {
            return None;
        }
        let guard = Arc::clone(&self.inner.rebuild_guard).try_lock_owned().ok()?;
        let inner = Arc::clone(&self.inner);
        let at = header.number;
        Some(tokio::spawn(async move {
            inner.refresh(at).await;
            drop(guard);
        }))
    }

    /// Apply the updates carried by one stream-updated log to node load.
    pub async fn on_stream_update(&self, log: &Log) {
        let updates = match self.inner.codec.decode_stream_updates(log) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    tx = %log.tx_hash,
                    index = log.log_index,
                    "unable to decode stream updated event"
                );
                return;
            }
        };

        let snapshot = self.inner.snapshot.load_full();
        for update in updates {
            match update {
                StreamUpdate::Allocate(stream) | StreamUpdate::Create(stream) => {
                    for node in stream.nodes.iter().filter_map(|a| snapshot.node(a)) {
                        node.add_stream();
                    }
                    snapshot.add_total_streams(1);
                }
                StreamUpdate::PlacementUpdated(stream) => {
                    let at = log.block_number.prev();
                    match self.inner.registry.get_stream(stream.stream_id, at).await {
                        Ok(previous) => {
                            for node in previous.nodes.iter().filter_map(|a| snapshot.node(a)) {
                                node.remove_stream();
                            }
                            for node in stream.nodes.iter().filter_map(|a| snapshot.node(a)) {
                                node.add_stream();
                            }
                        }
                        Err(e) => tracing::warn!(
                            error = %e,
                            stream = %stream.stream_id,
                            block = %at,
                            "unable to load previous stream placement"
                        ),
                    }
                }
                StreamUpdate::LastMiniblockBatchUpdated(_) => {}
            }
        }
    }

    /// The snapshot placements currently read.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    #[cfg(any(test, feature = "simulation"))]
    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }
}

impl Inner {
    async fn refresh(&self, at: BlockNumber) {
        if self
            .registry_changed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let settings = self.config.stream_distribution();
        match Snapshot::load(self.registry.as_ref(), settings, at).await {
            Ok(snapshot) => {
                tracing::info!(
                    block = %at,
                    nodes = snapshot.node_count(),
                    "stream distributor rebuilt"
                );
                self.snapshot.store(Arc::new(snapshot));
            }
            Err(e) => {
                self.registry_changed.store(true, Ordering::Release);
                tracing::error!(
                    error = %e,
                    block = %at,
                    "unable to rebuild stream distributor"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use chainplace_core::{MemoryChain, NodeStatus, StaticOnChainConfig, StreamDistribution};

    const REGISTRY: Address = Address::new([0xee; 20]);

    fn node(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn header(number: BlockNumber) -> Header {
        Header {
            number,
            timestamp: 0,
            base_fee: None,
        }
    }

    async fn setup(nodes: &[(u8, u8)]) -> (Arc<MemoryChain>, Distributor) {
        let chain = Arc::new(MemoryChain::new(1, REGISTRY));
        for (n, o) in nodes {
            chain.add_node(node(*n), node(*o), "https://n", NodeStatus::Operational);
        }
        let at = chain.commit();
        let distributor = Distributor::detached(
            chain.clone(),
            Arc::new(chain.codec()),
            Arc::new(StaticOnChainConfig::new(StreamDistribution::new(40, 0))),
            at,
        )
        .await
        .unwrap();
        (chain, distributor)
    }

    fn load(d: &Distributor, b: u8) -> i64 {
        d.snapshot().node(&node(b)).unwrap().stream_count()
    }

    fn stream_log(chain: &MemoryChain, update: StreamUpdate, block: u64) -> Log {
        let (topics, data) = chain.codec().encode_stream_updates(vec![update]);
        Log {
            address: REGISTRY,
            topics,
            data,
            block_number: BlockNumber(block),
            tx_hash: B256::ZERO,
            log_index: 0,
            removed: false,
        }
    }

    #[tokio::test]
    async fn snapshot_skips_non_operational_nodes() {
        let chain = Arc::new(MemoryChain::new(1, REGISTRY));
        chain.add_node(node(1), node(0xa1), "https://n1", NodeStatus::Operational);
        chain.add_node(node(2), node(0xa2), "https://n2", NodeStatus::Departing);
        chain.allocate_stream(B256::repeat_byte(1), vec![node(1)]);
        let at = chain.commit();

        let d = Distributor::detached(
            chain.clone(),
            Arc::new(chain.codec()),
            Arc::new(StaticOnChainConfig::default()),
            at,
        )
        .await
        .unwrap();
        let snapshot = d.snapshot();
        assert_eq!(snapshot.node_count(), 1);
        assert_eq!(snapshot.ring_len(), 150);
        assert_eq!(snapshot.total_streams(), 1);
        assert_eq!(load(&d, 1), 1);
    }

    #[tokio::test]
    async fn registry_failure_fails_construction() {
        let chain = Arc::new(MemoryChain::new(1, REGISTRY));
        chain.fail_next_registry_reads(1);
        let result = Distributor::detached(
            chain.clone(),
            Arc::new(chain.codec()),
            Arc::new(StaticOnChainConfig::default()),
            BlockNumber(0),
        )
        .await;
        assert!(matches!(result, Err(DistributorError::Registry(_))));
    }

    #[tokio::test]
    async fn allocate_and_create_add_load() {
        let (chain, d) = setup(&[(1, 0xa1), (2, 0xa2), (3, 0xa3)]).await;
        let id = B256::repeat_byte(7);

        let log = stream_log(
            &chain,
            StreamUpdate::Allocate(chainplace_core::StreamState {
                stream_id: id,
                nodes: vec![node(1), node(2), node(9)],
            }),
            5,
        );
        d.on_stream_update(&log).await;
        let log = stream_log(
            &chain,
            StreamUpdate::Create(chainplace_core::StreamState {
                stream_id: B256::repeat_byte(8),
                nodes: vec![node(2)],
            }),
            6,
        );
        d.on_stream_update(&log).await;

        assert_eq!((load(&d, 1), load(&d, 2), load(&d, 3)), (1, 2, 0));
        assert_eq!(d.snapshot().total_streams(), 2);
    }

    #[tokio::test]
    async fn placement_update_moves_load() {
        let (chain, d) = setup(&[(1, 0xa1), (2, 0xa2), (3, 0xa3)]).await;
        let id = B256::repeat_byte(7);
        chain.allocate_stream(id, vec![node(1), node(2)]);
        chain.commit();
        d.on_stream_update(&stream_log(
            &chain,
            StreamUpdate::Allocate(chainplace_core::StreamState {
                stream_id: id,
                nodes: vec![node(1), node(2)],
            }),
            2,
        ))
        .await;

        chain.update_placement(id, vec![node(2), node(3)]);
        let moved = chain.commit();
        d.on_stream_update(&stream_log(
            &chain,
            StreamUpdate::PlacementUpdated(chainplace_core::StreamState {
                stream_id: id,
                nodes: vec![node(2), node(3)],
            }),
            moved.as_u64(),
        ))
        .await;

        assert_eq!((load(&d, 1), load(&d, 2), load(&d, 3)), (0, 1, 1));
        assert_eq!(d.snapshot().total_streams(), 1);
    }

    #[tokio::test]
    async fn placement_update_for_unknown_stream_is_ignored() {
        let (chain, d) = setup(&[(1, 0xa1)]).await;
        let log = stream_log(
            &chain,
            StreamUpdate::PlacementUpdated(chainplace_core::StreamState {
                stream_id: B256::repeat_byte(3),
                nodes: vec![node(1)],
            }),
            9,
        );
        d.on_stream_update(&log).await;
        assert_eq!(load(&d, 1), 0);
    }

    #[tokio::test]
    async fn undecodable_stream_update_is_dropped() {
        let (chain, d) = setup(&[(1, 0xa1)]).await;
        let mut log = stream_log(
            &chain,
            StreamUpdate::Create(chainplace_core::StreamState {
                stream_id: B256::repeat_byte(3),
                nodes: vec![node(1)],
            }),
            2,
        );
        log.data = vec![0xff, 0x00].into();
        d.on_stream_update(&log).await;
        assert_eq!(load(&d, 1), 0);
        assert_eq!(d.snapshot().total_streams(), 0);
    }

    #[tokio::test]
    async fn header_without_registry_change_spawns_nothing() {
        let (chain, d) = setup(&[(1, 0xa1)]).await;
        let before = d.snapshot();
        chain.add_node(node(2), node(0xa2), "https://n2", NodeStatus::Operational);
        let at = chain.commit();

        assert!(d.on_header(&header(at)).is_none());
        assert!(Arc::ptr_eq(&before, &d.snapshot()));
    }

    #[tokio::test]
    async fn reload_rebuilds_on_next_header() {
        let (chain, d) = setup(&[(1, 0xa1)]).await;
        chain.add_node(node(2), node(0xa2), "https://n2", NodeStatus::Operational);
        let at = chain.commit();

        d.reload();
        assert!(d.registry_changed());
        d.on_header(&header(at)).unwrap().await.unwrap();
        assert!(!d.registry_changed());
        assert_eq!(d.snapshot().node_count(), 2);
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_flag_and_old_snapshot() {
        let (chain, d) = setup(&[(1, 0xa1)]).await;
        chain.add_node(node(2), node(0xa2), "https://n2", NodeStatus::Operational);
        let at = chain.commit();
        chain.fail_next_registry_reads(1);

        d.reload();
        d.on_header(&header(at)).unwrap().await.unwrap();
        assert!(d.registry_changed());
        assert_eq!(d.snapshot().node_count(), 1);

        d.on_header(&header(at)).unwrap().await.unwrap();
        assert!(!d.registry_changed());
        assert_eq!(d.snapshot().node_count(), 2);
    }

    #[tokio::test]
    async fn only_one_rebuild_runs_at_a_time() {
        let (_chain, d) = setup(&[(1, 0xa1)]).await;
        let _held = Arc::clone(&d.inner.rebuild_guard).try_lock_owned().unwrap();
        d.reload();
        assert!(d.on_header(&header(BlockNumber(1))).is_none());
        assert!(d.registry_changed());
    }

    #[tokio::test]
    async fn candidates_count_is_read_from_config() {
        let chain = Arc::new(MemoryChain::new(1, REGISTRY));
        for b in 1..=6u8 {
            chain.add_node(node(b), node(0xa0 + b), "https://n", NodeStatus::Operational);
        }
        let at = chain.commit();
        let config = Arc::new(StaticOnChainConfig::new(StreamDistribution::new(30, 1)));
        let d = Distributor::detached(chain.clone(), Arc::new(chain.codec()), config.clone(), at)
            .await
            .unwrap();

        // with a single candidate the first ring neighbour wins regardless of load
        let id = B256::repeat_byte(0x33);
        let first = d.choose_stream_nodes(&id, 1).unwrap();
        d.snapshot().node(&first[0]).unwrap().set_stream_count(1_000);
        assert_eq!(d.choose_stream_nodes(&id, 1).unwrap(), first);

        config.set(StreamDistribution::new(30, 6));
        assert_ne!(d.choose_stream_nodes(&id, 1).unwrap(), first);
    }
}
