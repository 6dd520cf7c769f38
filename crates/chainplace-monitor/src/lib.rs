//! chainplace-monitor: turns a polled ledger into ordered callbacks.
//!
//! # Poll loop
//! Every iteration fetches the latest header, scans at most
//! `max_block_range + 1` blocks starting at the cursor, fetches matching logs
//! when a log subscriber exists, and fans out to the registered callbacks.
//! The cursor only advances once every callback of the iteration returned.
//!
//! # Late subscribers
//! A subscription registered with a start block behind the cursor pulls the
//! cursor back. Subscribers that already saw those blocks are skipped, so
//! nobody receives a block or log twice.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chainplace_core::{BlockNumber, MemoryChain};
//! use chainplace_monitor::{ChainMonitor, MonitorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let chain = Arc::new(MemoryChain::new(1, Default::default()));
//! let monitor = ChainMonitor::new(MonitorConfig::builder().block_period(Duration::from_secs(2)).build());
//! monitor.on_block(|block| async move { println!("block {block}") });
//! let cancel = CancellationToken::new();
//! monitor.start(chain, BlockNumber(0), cancel.clone());
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod node_registry;
pub mod poll;

pub use config::{MonitorConfig, MonitorConfigBuilder};
pub use error::MonitorError;
pub use metrics::{MonitorMetrics, MonitorMetricsSnapshot};
pub use monitor::{ChainMonitor, MonitorState};
pub use node_registry::NodeRegistryMonitor;
pub use poll::{DefaultPollInterval, PollInterval};
