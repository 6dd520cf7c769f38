//! Typed node registry events on top of [`ChainMonitor`].

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::Address;

use chainplace_core::{BlockNumber, Log, NodeEvent, RegistryCodec, RegistryEvent};

use crate::monitor::ChainMonitor;

/// Decodes node registry logs and hands the typed events to callbacks.
///
/// Logs that fail to decode are logged and dropped; delivery continues with
/// the next log.
#[derive(Clone)]
pub struct NodeRegistryMonitor {
    monitor: ChainMonitor,
    registry: Address,
    codec: Arc<dyn RegistryCodec>,
}

impl NodeRegistryMonitor {
    pub fn new(monitor: ChainMonitor, registry: Address, codec: Arc<dyn RegistryCodec>) -> Self {
        Self {
            monitor,
            registry,
            codec,
        }
    }

    pub fn on_node_added<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(from, RegistryEvent::NodeAdded, cb);
    }

    pub fn on_node_removed<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(from, RegistryEvent::NodeRemoved, cb);
    }

    pub fn on_node_status_updated<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(from, RegistryEvent::NodeStatusUpdated, cb);
    }

    pub fn on_node_url_updated<F, Fut>(&self, from: BlockNumber, cb: F)
    where
        F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(from, RegistryEvent::NodeUrlUpdated, cb);
    }

    fn subscribe<F, Fut>(&self, from: BlockNumber, event: RegistryEvent, cb: F)
    where
        F: Fn(NodeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let codec = Arc::clone(&self.codec);
        let cb = Arc::new(cb);
        let topics = vec![vec![self.codec.topic(event)]];

        self.monitor
            .on_contract_with_topics_event(from, self.registry, topics, move |log: Log| {
                let decoded = codec.decode_node_event(&log);
                let cb = Arc::clone(&cb);
                async move {
                    match decoded {
                        Ok(node_event) => cb(node_event).await,
                        Err(e) => tracing::error!(
                            error = %e,
                            tx = %log.tx_hash,
                            index = log.log_index,
                            "unable to decode node registry event"
                        ),
                    }
                }
            });
    }
}
