//! chainplace-distributor: deterministic stream placement on a consistent-hash ring.
//!
//! Every operational node owns `vnode_count` positions on a 64-bit ring. A
//! stream is placed by walking clockwise from `sha256(stream_id) mod 2^64`,
//! collecting a few candidate nodes across distinct operators and keeping the
//! least loaded ones.
//!
//! ```text
//! ChainMonitor ─┬─ headers ──────────► Distributor::on_header ─► rebuild if changed
//!               ├─ node events ──────► Distributor::reload
//!               └─ stream events ────► Distributor::on_stream_update ─► node load
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use chainplace_distributor::Distributor;
//!
//! let distributor = Distributor::new(registry, codec, config, block, &monitor, registry_address).await?;
//! let nodes = distributor.choose_stream_nodes(&stream_id, 3)?;
//! ```

pub mod distributor;
pub mod error;
pub mod ring;
#[cfg(any(test, feature = "simulation"))]
pub mod simulator;

pub use distributor::Distributor;
pub use error::DistributorError;
pub use ring::{position, stream_position, vnode_position, Snapshot, StreamNode, MAX_RING_STEPS};
#[cfg(any(test, feature = "simulation"))]
pub use simulator::DistributorSimulator;
