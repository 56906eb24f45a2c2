//! Block download scheduling and chain-ordered delivery.
//!
//! The queue tracks the hashes discovered during backfill, fans them out to
//! peers in bounded reservations, validates the blocks that come back, and
//! surfaces them to the consumer strictly in chain order.

use crate::peer::Peer;
use crate::types::{Block, Hash};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// A chunk of hashes reserved by a single peer for block retrieval.
#[derive(Debug, Clone)]
pub struct Request {
    /// Peer the chunk is reserved for.
    pub peer_id: String,
    /// Hashes to fetch, chain-oldest first.
    pub hashes: Vec<Hash>,
    /// Reservation time.
    pub started: Instant,
}

/// Why a block delivery was rejected.
///
/// Rejections are not surfaced to external callers; the orchestrator treats
/// them as a demotion signal for the delivering peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliverError {
    /// The peer holds no outstanding reservation.
    #[error("peer {0} holds no reservation")]
    NoReservation(String),

    /// The delivery contained no blocks at all.
    #[error("empty block delivery")]
    Empty,

    /// A delivered block was not part of the peer's reservation, or appeared
    /// twice in one delivery.
    #[error("block {0} was not requested from this peer")]
    Unsolicited(Hash),

    /// A block's number does not match its chain position.
    #[error("block {hash} carries number {got}, expected {want}")]
    NumberMismatch {
        /// Offending block hash.
        hash: Hash,
        /// Number the peer delivered.
        got: u64,
        /// Number the schedule requires.
        want: u64,
    },

    /// A block does not link to its predecessor in the schedule.
    #[error("block {0} does not extend its predecessor")]
    ParentMismatch(Hash),

    /// A block maps outside the allocated download cache.
    #[error("block {0} overflows the download cache")]
    Overflow(Hash),
}

/// An outstanding per-peer reservation.
#[derive(Debug)]
struct Reservation {
    hashes: Vec<Hash>,
    started: Instant,
}

#[derive(Default)]
struct QueueInner {
    /// Hashes in the order they were appended (chain tip first).
    order: Vec<Hash>,
    /// Hash -> position in `order`, for every hash not yet taken.
    index: HashMap<Hash, usize>,
    /// Hashes still awaiting a block.
    pool: HashSet<Hash>,
    /// Hashes currently reserved by some peer.
    reserved: HashSet<Hash>,
    /// Outstanding reservations keyed by peer id.
    fetching: HashMap<String, Reservation>,
    /// Chain-ordered cache of delivered blocks; sized by `alloc`.
    cache: Vec<Option<Block>>,
    /// Block number of the oldest pending hash.
    offset: u64,
    /// Cache slot of the next block owed to the consumer.
    next_take: usize,
    /// Number of filled, untaken cache slots.
    cached: usize,
}

impl QueueInner {
    /// Chain position of the hash at `order` index `i`: the hash appended
    /// last is the oldest and sits at slot zero.
    fn slot_of(&self, index: usize) -> usize {
        self.order.len() - 1 - index
    }
}

/// The download scheduler.
pub struct Queue {
    inner: RwLock<QueueInner>,
    /// High-water mark for undrained blocks plus reserved hashes.
    cache_limit: usize,
}

impl Queue {
    /// Create an empty queue throttling at `cache_limit` blocks.
    pub fn new(cache_limit: usize) -> Self {
        Self {
            inner: RwLock::new(QueueInner::default()),
            cache_limit,
        }
    }

    /// Append hashes to the schedule, silently skipping any the queue has
    /// already seen. Returns how many were actually inserted.
    pub fn insert(&self, hashes: &[Hash]) -> usize {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        for hash in hashes {
            if inner.index.contains_key(hash) {
                continue;
            }
            let position = inner.order.len();
            inner.order.push(*hash);
            inner.index.insert(*hash, position);
            inner.pool.insert(*hash);
            inserted += 1;
        }
        inserted
    }

    /// Whether the queue has seen this hash.
    pub fn has(&self, hash: &Hash) -> bool {
        self.inner.read().index.contains_key(hash)
    }

    /// Number of hashes still awaiting a block.
    pub fn pending(&self) -> usize {
        self.inner.read().pool.len()
    }

    /// Number of outstanding reservations across peers.
    pub fn in_flight(&self) -> usize {
        self.inner.read().fetching.len()
    }

    /// Pending hash count and cached (undrained) block count.
    pub fn size(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.pool.len(), inner.cached)
    }

    /// Fetch a delivered block back out of the cache.
    pub fn get_block(&self, hash: &Hash) -> Option<Block> {
        let inner = self.inner.read();
        let index = *inner.index.get(hash)?;
        let slot = inner.slot_of(index);
        inner.cache.get(slot)?.clone()
    }

    /// The block at the consumer cursor, if it has been delivered.
    pub fn head_block(&self) -> Option<Block> {
        let inner = self.inner.read();
        inner.cache.get(inner.next_take)?.clone()
    }

    /// Size the chain-ordered cache for every pending hash and record the
    /// block number of the oldest one. Called once, at the transition from
    /// hash backfill to block download.
    pub fn alloc(&self, offset: u64) {
        let mut inner = self.inner.write();
        let slots = inner.order.len();
        inner.offset = offset;
        inner.cache = vec![None; slots];
        inner.next_take = 0;
        inner.cached = 0;
        debug!(blocks = slots, offset, "Allocated download cache");
    }

    /// Reserve up to `count` unassigned hashes for `peer`, oldest first,
    /// marking the peer busy as part of the same operation.
    ///
    /// The idle flag flips under the queue lock, before the reservation is
    /// recorded, so a held reservation is never observable on a peer that
    /// still reads idle. Returns `None` when the peer already holds a
    /// reservation, is not idle, or no unreserved work remains. The chunk
    /// is additionally bounded by the peer's trusted capacity.
    pub fn reserve(&self, peer: &Peer, count: usize) -> Option<Request> {
        let mut inner = self.inner.write();
        if inner.fetching.contains_key(peer.id()) {
            return None;
        }

        let space = count.min(peer.capacity());
        let mut hashes = Vec::new();
        for index in (0..inner.order.len()).rev() {
            if hashes.len() == space {
                break;
            }
            let hash = inner.order[index];
            if inner.pool.contains(&hash) && !inner.reserved.contains(&hash) {
                hashes.push(hash);
            }
        }
        if hashes.is_empty() {
            return None;
        }
        if !peer.mark_busy() {
            return None;
        }

        for hash in &hashes {
            inner.reserved.insert(*hash);
        }
        let started = Instant::now();
        inner.fetching.insert(
            peer.id().to_string(),
            Reservation {
                hashes: hashes.clone(),
                started,
            },
        );
        debug!(peer = %peer.id(), count = hashes.len(), "Reserved block chunk");

        Some(Request {
            peer_id: peer.id().to_string(),
            hashes,
            started,
        })
    }

    /// Validate and store a block delivery from `peer_id`.
    ///
    /// Any subset of the reservation is accepted: delivered hashes leave the
    /// pool and the whole reservation is cleared, so undelivered remainders
    /// become reschedulable at once. On rejection the reservation is left in
    /// place for the caller to demote and the expiry sweep to reclaim.
    pub fn deliver(&self, peer_id: &str, blocks: Vec<Block>) -> Result<usize, DeliverError> {
        let mut inner = self.inner.write();

        let requested: Vec<Hash> = match inner.fetching.get(peer_id) {
            Some(reservation) => reservation.hashes.clone(),
            None => return Err(DeliverError::NoReservation(peer_id.to_string())),
        };
        if blocks.is_empty() {
            return Err(DeliverError::Empty);
        }

        // Validate the whole batch before touching any state.
        let allowed: HashSet<Hash> = requested.iter().copied().collect();
        let mut seen = HashSet::with_capacity(blocks.len());
        let mut placements = Vec::with_capacity(blocks.len());
        for block in &blocks {
            if !allowed.contains(&block.hash) || !seen.insert(block.hash) {
                return Err(DeliverError::Unsolicited(block.hash));
            }
            let index = match inner.index.get(&block.hash) {
                Some(index) => *index,
                None => return Err(DeliverError::Unsolicited(block.hash)),
            };
            let slot = inner.slot_of(index);
            if slot >= inner.cache.len() {
                return Err(DeliverError::Overflow(block.hash));
            }
            let want = inner.offset + slot as u64;
            if block.number != want {
                return Err(DeliverError::NumberMismatch {
                    hash: block.hash,
                    got: block.number,
                    want,
                });
            }
            if index + 1 < inner.order.len() && block.parent != inner.order[index + 1] {
                return Err(DeliverError::ParentMismatch(block.hash));
            }
            placements.push(slot);
        }

        let delivered = blocks.len();
        for (slot, block) in placements.into_iter().zip(blocks) {
            inner.pool.remove(&block.hash);
            inner.reserved.remove(&block.hash);
            if inner.cache[slot].is_none() {
                inner.cached += 1;
            }
            inner.cache[slot] = Some(block);
        }

        // Release whatever part of the reservation was not delivered.
        if let Some(reservation) = inner.fetching.remove(peer_id) {
            for hash in reservation.hashes {
                inner.reserved.remove(&hash);
            }
        }

        debug!(peer = %peer_id, count = delivered, "Accepted block delivery");
        Ok(delivered)
    }

    /// Return a dispatched-but-refused reservation to the pool.
    pub fn cancel(&self, request: &Request) {
        let mut inner = self.inner.write();
        if let Some(reservation) = inner.fetching.remove(&request.peer_id) {
            for hash in reservation.hashes {
                inner.reserved.remove(&hash);
            }
            debug!(peer = %request.peer_id, "Returned reservation to pool");
        }
    }

    /// Release every reservation older than `ttl` and report the peers that
    /// held them.
    pub fn expire(&self, ttl: Duration) -> Vec<String> {
        let mut inner = self.inner.write();
        let now = Instant::now();

        let stale: Vec<String> = inner
            .fetching
            .iter()
            .filter(|(_, reservation)| now.duration_since(reservation.started) > ttl)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        for peer_id in &stale {
            if let Some(reservation) = inner.fetching.remove(peer_id) {
                debug!(
                    peer = %peer_id,
                    count = reservation.hashes.len(),
                    "Expired block reservation"
                );
                for hash in reservation.hashes {
                    inner.reserved.remove(&hash);
                }
            }
        }

        stale
    }

    /// Whether dispatch should pause until the consumer drains the cache.
    pub fn throttle(&self) -> bool {
        let inner = self.inner.read();
        inner.cached + inner.reserved.len() >= self.cache_limit
    }

    /// Drain the longest contiguous chain-ordered run of delivered blocks
    /// starting at `head`. Taken blocks are forgotten entirely.
    pub fn take_blocks(&self, head: &Block) -> Vec<Block> {
        let mut inner = self.inner.write();

        match inner.cache.get(inner.next_take) {
            Some(Some(block)) if block == head => {}
            _ => return Vec::new(),
        }

        let mut taken = Vec::new();
        while inner.next_take < inner.cache.len() {
            let slot = inner.next_take;
            match inner.cache[slot].take() {
                Some(block) => {
                    inner.cached -= 1;
                    inner.index.remove(&block.hash);
                    inner.next_take += 1;
                    taken.push(block);
                }
                None => break,
            }
        }
        taken
    }

    /// Discard every piece of state.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        *inner = QueueInner::default();
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(crate::BLOCK_CACHE_LIMIT)
    }
}
