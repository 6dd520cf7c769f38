//! Monitor configuration with a fluent builder.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chainplace_monitor::MonitorConfig;
//!
//! let config = MonitorConfig::builder()
//!     .chain("base-sepolia")
//!     .block_period(Duration::from_secs(2))
//!     .max_block_range(50)
//!     .build();
//! assert_eq!(config.max_block_range, 50);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

/// Configuration for a [`ChainMonitor`](crate::ChainMonitor).
///
/// Durations serialise as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Chain label used in logs.
    pub chain: String,
    /// Expected time between blocks.
    #[serde(with = "duration_ms")]
    pub block_period: Duration,
    /// Max `to - from` of one scan; RPC providers cap `eth_getLogs` ranges.
    pub max_block_range: u64,
    /// Upper bound of the error backoff. Never below one second.
    #[serde(with = "duration_ms")]
    pub err_slowdown_limit: Duration,
    /// Time stopped callbacks get to finish after cancellation.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".into(),
            block_period: Duration::from_secs(2),
            max_block_range: 25,
            err_slowdown_limit: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.block_period.is_zero() {
            return Err(MonitorError::InvalidConfig("block_period must be > 0".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`MonitorConfig`].
#[derive(Default)]
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    pub fn block_period(mut self, period: Duration) -> Self {
        self.config.block_period = period;
        self
    }

    pub fn max_block_range(mut self, range: u64) -> Self {
        self.config.max_block_range = range;
        self
    }

    pub fn err_slowdown_limit(mut self, limit: Duration) -> Self {
        self.config.err_slowdown_limit = limit;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> MonitorConfig {
        self.config
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = MonitorConfig::builder().build();
        assert_eq!(cfg.block_period, Duration::from_secs(2));
        assert_eq!(cfg.max_block_range, 25);
        assert_eq!(cfg.err_slowdown_limit, Duration::from_secs(30));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(60));
    }

    #[test]
    fn builder_custom() {
        let cfg = MonitorConfig::builder()
            .chain("river")
            .block_period(Duration::from_millis(500))
            .max_block_range(10)
            .shutdown_grace(Duration::from_secs(1))
            .build();
        assert_eq!(cfg.chain, "river");
        assert_eq!(cfg.block_period, Duration::from_millis(500));
        assert_eq!(cfg.max_block_range, 10);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn durations_in_millis() {
        let cfg: MonitorConfig =
            serde_json::from_str(r#"{"block_period": 1500, "shutdown_grace": 2000}"#).unwrap();
        assert_eq!(cfg.block_period, Duration::from_millis(1500));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
        assert_eq!(cfg.max_block_range, 25);

        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["err_slowdown_limit"], 30_000);
    }

    #[test]
    fn zero_block_period_rejected() {
        let cfg = MonitorConfig::builder().block_period(Duration::ZERO).build();
        assert!(cfg.validate().is_err());
    }
}
