//! Monitor counters and gauges.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live metrics of one monitor, labelled by chain id once it is resolved.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    chain_id: AtomicU64,
    head_block: AtomicU64,
    processed_block: AtomicU64,
    /// Base fee in wei, saturated to `u64::MAX`.
    base_fee_wei: AtomicU64,
    received_events: AtomicU64,
    poll_iterations: AtomicU64,
}

/// Point-in-time copy of [`MonitorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorMetricsSnapshot {
    pub chain_id: u64,
    pub head_block: u64,
    pub processed_block: u64,
    pub base_fee_wei: u64,
    pub received_events: u64,
    pub poll_iterations: u64,
}

impl MonitorMetrics {
    pub(crate) fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::Relaxed);
    }

    pub(crate) fn set_head(&self, block: u64, base_fee: Option<u128>) {
        self.head_block.store(block, Ordering::Relaxed);
        if let Some(fee) = base_fee {
            let fee = u64::try_from(fee).unwrap_or(u64::MAX);
            self.base_fee_wei.store(fee, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_processed(&self, block: u64) {
        self.processed_block.store(block, Ordering::Relaxed);
    }

    pub(crate) fn add_received_events(&self, n: usize) {
        self.received_events.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_poll(&self) {
        self.poll_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorMetricsSnapshot {
        MonitorMetricsSnapshot {
            chain_id: self.chain_id.load(Ordering::Relaxed),
            head_block: self.head_block.load(Ordering::Relaxed),
            processed_block: self.processed_block.load(Ordering::Relaxed),
            base_fee_wei: self.base_fee_wei.load(Ordering::Relaxed),
            received_events: self.received_events.load(Ordering::Relaxed),
            poll_iterations: self.poll_iterations.load(Ordering::Relaxed),
        }
    }
}
