//! chainplace-core: shared foundation for the chain monitor and the stream distributor.
//!
//! # Architecture
//!
//! ```text
//! LedgerClient ──► ChainMonitor (chainplace-monitor)
//!                      ├── header callbacks ──► Distributor::on_header (snapshot rebuild)
//!                      ├── node events      ──► Distributor::reload
//!                      └── stream events    ──► load counters
//! NodeRegistry ──► Distributor snapshot (chainplace-distributor)
//! OnChainConfig ─► vnode / candidate counts
//! RegistryCodec ─► typed node + stream events from raw logs
//! ```
//!
//! This crate owns the types that cross those seams, the collaborator traits,
//! and an in-memory chain used by tests and the simulation CLI.

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod telemetry;
pub mod types;

pub use client::LedgerClient;
pub use config::{OnChainConfig, StaticOnChainConfig, StreamDistribution};
pub use error::ChainError;
pub use memory::{MemoryChain, MemoryRegistryCodec};
pub use registry::{NodeRegistry, RegistryCodec, RegistryEvent};
pub use types::{
    BlockNumber, FilterQuery, Header, Log, MiniblockUpdate, NodeEvent, NodeRecord, NodeStatus,
    StreamId, StreamRecord, StreamState, StreamUpdate,
};
