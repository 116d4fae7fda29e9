use thiserror::Error;

/// All error kinds
///
/// Errors are cloneable so that a single protocol outcome can complete
/// every future waiting on the same acknowledgement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Raised when the router cannot resolve a shard for a channel
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// Raised when an acknowledgement watchdog fires before the backend answered
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Raised when a pub/sub connection cannot be acquired from the backend pool
    #[error("Connect error: {0}")]
    Connect(String),
    /// Raised when the transport fails to write a command
    #[error("Wire error: {0}")]
    Wire(String),
    /// Raised when the connection manager is shutting down
    #[error("Shutting down")]
    Shutdown,
    /// Raised if an internal invariant is violated
    #[error("Internal error: {0}")]
    Internal(String),
    /// Raised if an error occurs in the [`PubSubConfig`](crate::PubSubConfig) validation
    #[error("Config error: {0}")]
    Config(String),
}
