//! On-chain stream distribution settings.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Virtual nodes placed on the ring per operational node when unset on-chain.
pub const DEFAULT_VNODE_COUNT: u64 = 150;

/// Ring neighbours to pick the least-loaded nodes from when unset on-chain.
pub const DEFAULT_CANDIDATES_COUNT: u64 = 4;

/// Settings for the stream distribution algorithm.
///
/// A value of `0` means "unset" and falls back to the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDistribution {
    /// Virtual nodes per real node (`stream.distribution.vnodecount`).
    #[serde(default)]
    pub vnode_count: u64,
    /// Candidate nodes to pick the best nodes from (`stream.distribution.candidatescount`).
    #[serde(default)]
    pub candidates_count: u64,
}

impl StreamDistribution {
    pub fn new(vnode_count: u64, candidates_count: u64) -> Self {
        Self {
            vnode_count,
            candidates_count,
        }
    }

    pub fn effective_vnode_count(&self) -> usize {
        match self.vnode_count {
            0 => DEFAULT_VNODE_COUNT as usize,
            n => n as usize,
        }
    }

    pub fn effective_candidates_count(&self) -> usize {
        match self.candidates_count {
            0 => DEFAULT_CANDIDATES_COUNT as usize,
            n => n as usize,
        }
    }
}

/// Source of on-chain settings. Read on every snapshot rebuild and placement.
pub trait OnChainConfig: Send + Sync {
    fn stream_distribution(&self) -> StreamDistribution;
}

/// Fixed settings that can be replaced at runtime without locking readers.
pub struct StaticOnChainConfig {
    current: ArcSwap<StreamDistribution>,
}

impl StaticOnChainConfig {
    pub fn new(settings: StreamDistribution) -> Self {
        Self {
            current: ArcSwap::from_pointee(settings),
        }
    }

    /// Replace the settings seen by subsequent reads.
    pub fn set(&self, settings: StreamDistribution) {
        self.current.store(Arc::new(settings));
    }
}

impl Default for StaticOnChainConfig {
    fn default() -> Self {
        Self::new(StreamDistribution::default())
    }
}

impl OnChainConfig for StaticOnChainConfig {
    fn stream_distribution(&self) -> StreamDistribution {
        **self.current.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_values_use_defaults() {
        let cfg = StreamDistribution::default();
        assert_eq!(cfg.effective_vnode_count(), 150);
        assert_eq!(cfg.effective_candidates_count(), 4);

        let cfg = StreamDistribution::new(20, 7);
        assert_eq!(cfg.effective_vnode_count(), 20);
        assert_eq!(cfg.effective_candidates_count(), 7);
    }

    #[test]
    fn static_config_swaps() {
        let cfg = StaticOnChainConfig::default();
        assert_eq!(cfg.stream_distribution(), StreamDistribution::default());
        cfg.set(StreamDistribution::new(10, 3));
        assert_eq!(cfg.stream_distribution().vnode_count, 10);
    }

    #[test]
    fn deserialize_partial() {
        let cfg: StreamDistribution = serde_json::from_str(r#"{"vnode_count": 64}"#).unwrap();
        assert_eq!(cfg.effective_vnode_count(), 64);
        assert_eq!(cfg.effective_candidates_count(), 4);
    }
}
