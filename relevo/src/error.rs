//! Error types for supervisor operations.

/// Alias for `Result<T, relevo::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by supervisor operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Every port in the configured range is leased.
    #[error("no available ports")]
    PortsExhausted,

    /// A reservation was requested while no instance is active.
    #[error("no active instance")]
    NoActiveInstance,

    /// A stop or kill request matched no running instance.
    #[error("instance is not running")]
    NotRunning,

    /// An RPC request named an unknown application.
    #[error("invalid app: {0}")]
    InvalidApp(String),
}
