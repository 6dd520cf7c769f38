//! Hooks for load simulations.
//!
//! Only compiled for tests and with the `simulation` feature. Production code
//! never mutates load outside of chain events.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;

use chainplace_core::{NodeRecord, NodeStatus};

use crate::distributor::Distributor;
use crate::error::DistributorError;

/// Direct access to node load and membership for simulations.
pub trait DistributorSimulator {
    /// Streams currently placed on `node`, `0` for unknown nodes.
    fn node_stream_load(&self, node: &Address) -> u64;

    /// Overwrite the load of every listed node present in the snapshot.
    fn set_node_stream_load(&self, load: &HashMap<Address, u64>);

    /// Record one more stream on `node`.
    fn assign_stream_to_node(&self, node: &Address) -> Result<(), DistributorError>;

    /// Load of every node in the snapshot.
    fn node_stream_count(&self) -> HashMap<Address, i64>;

    /// Put an operational node with zero load on the ring. No-op if present.
    fn add_new_node(&self, node: Address, operator: Address);
}

impl DistributorSimulator for Distributor {
    fn node_stream_load(&self, node: &Address) -> u64 {
        self.snapshot()
            .node(node)
            .map_or(0, |n| n.stream_count().max(0) as u64)
    }

    fn set_node_stream_load(&self, load: &HashMap<Address, u64>) {
        let snapshot = self.snapshot();
        for (address, count) in load {
            if let Some(node) = snapshot.node(address) {
                node.set_stream_count(i64::try_from(*count).unwrap_or(i64::MAX));
            }
        }
    }

    fn assign_stream_to_node(&self, node: &Address) -> Result<(), DistributorError> {
        let snapshot = self.snapshot();
        let entry = snapshot
            .node(node)
            .ok_or(DistributorError::UnknownNode(*node))?;
        entry.add_stream();
        snapshot.add_total_streams(1);
        Ok(())
    }

    fn node_stream_count(&self) -> HashMap<Address, i64> {
        self.snapshot()
            .nodes()
            .map(|n| (n.address(), n.stream_count()))
            .collect()
    }

    fn add_new_node(&self, node: Address, operator: Address) {
        let inner = self.inner();
        let vnode_count = inner.config.stream_distribution().effective_vnode_count();
        let record = NodeRecord {
            address: node,
            operator,
            status: NodeStatus::Operational,
            url: format!("https://{node}.nodes.local:443"),
        };
        inner
            .snapshot
            .rcu(|current| Arc::new(current.with_node(record.clone(), 0, vnode_count)));
    }
}
