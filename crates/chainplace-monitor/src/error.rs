//! Monitor error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// `start` was called on a monitor that is already running or stopped.
    #[error("chain monitor already started")]
    AlreadyStarted,

    #[error("invalid monitor config: {0}")]
    InvalidConfig(String),
}
