//! chainplace-rpc: `LedgerClient` over Ethereum JSON-RPC.
//!
//! ```rust,no_run
//! use chainplace_rpc::HttpLedgerClient;
//! use chainplace_core::LedgerClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpLedgerClient::default_for("https://eth.llamarpc.com")?;
//! let head = client.latest_header().await?;
//! println!("head = {}", head.number);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod request;
pub mod retry;

pub use client::{HttpClientConfig, HttpLedgerClient};
pub use error::TransportError;
pub use retry::{RetryConfig, RetryPolicy};
