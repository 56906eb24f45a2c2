//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the synchronization engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A synchronization is already running.
    #[error("synchronization already running")]
    Busy,

    /// Undelivered blocks from a previous run still wait for the consumer.
    #[error("pending blocks in queue")]
    PendingQueue,

    /// The peer id is not registered.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// The peer id is already registered.
    #[error("peer {0} already registered")]
    DuplicatePeer(String),

    /// Hash-phase failover ran out of candidate peers.
    #[error("hash fetch timed out")]
    Timeout,

    /// The active peer answered a hash request with an empty batch.
    #[error("empty hash set from peer")]
    EmptyHashSet,

    /// The block phase lost every registered peer.
    #[error("no peers to keep download active")]
    NoPeers,

    /// No idle peer can take a reservation and none are in flight.
    #[error("no peers available for block download")]
    PeersUnavailable,

    /// The hash phase was cancelled.
    #[error("hash fetching cancelled")]
    HashFetchCancelled,

    /// The block phase was cancelled.
    #[error("block downloading cancelled")]
    BlockFetchCancelled,

    /// A delivery arrived while no synchronization was running.
    #[error("no sync active")]
    NoSyncActive,

    /// A dispatched block request no longer matches the peer's reservation.
    #[error("stale block request for peer {0}")]
    StaleRequest(String),
}

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
