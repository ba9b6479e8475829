//! Error types for the gossip sync control plane.

use thiserror::Error;

/// Errors surfaced by the control plane itself.
///
/// Only configuration and lifecycle problems end up here; transient peer
/// failures are recorded per peer and never escalated.
#[derive(Error, Debug)]
pub enum GossipSyncError {
    /// A configuration value is out of range.
    #[error("invalid gossip sync config: {0}")]
    InvalidConfig(String),

    /// A background thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        /// Name of the thread we tried to start.
        name: String,
        /// Underlying OS error.
        source: std::io::Error,
    },
}

/// Errors reported by the external exchange and snapshot collaborators.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Socket-level failure mid-exchange.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the protocol or sent garbage.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The exchange exceeded its protocol-level deadline.
    #[error("exchange timed out after {0}ms")]
    Timeout(u64),
}

/// Convenience result type for control-plane operations.
pub type Result<T> = std::result::Result<T, GossipSyncError>;
