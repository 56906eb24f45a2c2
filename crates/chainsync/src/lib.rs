//! # chainsync
//!
//! Block-chain synchronization engine.
//!
//! This crate provides:
//! - Hash backfill from a target head down to a locally known ancestor
//! - Parallel block download across registered peers
//! - Reservation scheduling with expiry, throttling and ordered delivery
//! - Peer reputation tracking with eviction of misbehaving peers
//!
//! The engine is embedded: it owns no transport and no chain store. The
//! local chain is consulted through two callbacks, each registered peer
//! brings two fire-and-forget request callbacks, and the transport pushes
//! responses back in through the delivery methods on
//! [`Downloader`].

mod downloader;
mod error;
mod peer;
mod queue;
mod types;

pub use downloader::{Downloader, DownloaderConfig, GetBlockFn, HasBlockFn};
pub use error::{SyncError, SyncResult};
pub use peer::{BlockRequestFn, HashRequestFn, Peer, PeerSet, REP_CEILING, REP_FLOOR};
pub use queue::{DeliverError, Queue, Request};
pub use types::{Block, Hash, HASH_LENGTH};

use std::time::Duration;

/// Maximum number of blocks requested from a peer in one chunk.
pub const MAX_BLOCK_FETCH: usize = 128;

/// Time allowed for a peer to answer a hash request before failover.
pub const HASH_TTL: Duration = Duration::from_secs(20);

/// Time allowed for a peer to deliver a reserved block chunk.
pub const BLOCK_TTL: Duration = Duration::from_secs(20);

/// Interval between scheduling passes in the block download phase.
pub const FETCH_TICK: Duration = Duration::from_millis(20);

/// Undrained blocks (cached plus reserved) tolerated before dispatch pauses
/// to let the consumer catch up.
pub const BLOCK_CACHE_LIMIT: usize = 8 * MAX_BLOCK_FETCH;

/// Peers a caller should want to know about before starting a sync. A
/// caller-side gate parameter; the engine itself does not consume it.
pub const MIN_DESIRED_PEER_COUNT: usize = 5;

/// How long a caller should wait for [`MIN_DESIRED_PEER_COUNT`] peers
/// before syncing anyway. A caller-side gate parameter; the engine itself
/// does not consume it.
pub const PEER_COUNT_TIMEOUT: Duration = Duration::from_secs(12);
