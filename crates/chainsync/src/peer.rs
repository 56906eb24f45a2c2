//! Download peer handles and the registered peer set.

use crate::error::{SyncError, SyncResult};
use crate::queue::Request;
use crate::types::Hash;
use crate::MAX_BLOCK_FETCH;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback asking a peer for a batch of ancestor hashes starting at the
/// given hash. Fire-and-forget: the response arrives through
/// [`Downloader::deliver_hashes`](crate::Downloader::deliver_hashes).
pub type HashRequestFn = Box<dyn Fn(Hash) + Send + Sync>;

/// Callback asking a peer for the blocks behind the given hashes.
/// Fire-and-forget: the response arrives through
/// [`Downloader::deliver_blocks`](crate::Downloader::deliver_blocks).
pub type BlockRequestFn = Box<dyn Fn(&[Hash]) + Send + Sync>;

/// Reputation ceiling; promotions saturate here.
pub const REP_CEILING: i32 = 100;

/// Reputation floor; a peer demoted below this is dropped from the set.
pub const REP_FLOOR: i32 = -10;

/// Smallest chunk capacity a repeatedly failing peer degrades to.
const MIN_CAPACITY: usize = 1;

/// A registered download peer.
///
/// Holds the head hash the peer claimed at registration, the two request
/// callbacks, an idle flag, a reputation score, and the chunk capacity the
/// engine currently trusts the peer with.
pub struct Peer {
    id: String,
    head: Hash,
    get_hashes: HashRequestFn,
    get_blocks: BlockRequestFn,
    idle: AtomicBool,
    rep: AtomicI32,
    capacity: AtomicUsize,
}

impl Peer {
    /// Create a new idle peer with neutral reputation.
    pub fn new(
        id: impl Into<String>,
        head: Hash,
        get_hashes: HashRequestFn,
        get_blocks: BlockRequestFn,
    ) -> Self {
        Self {
            id: id.into(),
            head,
            get_hashes,
            get_blocks,
            idle: AtomicBool::new(true),
            rep: AtomicI32::new(0),
            capacity: AtomicUsize::new(MAX_BLOCK_FETCH),
        }
    }

    /// Peer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Head hash the peer claimed at registration.
    pub fn head(&self) -> Hash {
        self.head
    }

    /// Whether the peer currently holds no block reservation.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Mark the peer idle again.
    pub fn set_idle(&self) {
        self.idle.store(true, Ordering::SeqCst);
    }

    /// Flip the peer from idle to busy. Returns `false` if it already
    /// held work.
    pub fn mark_busy(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Current reputation score.
    pub fn rep(&self) -> i32 {
        self.rep.load(Ordering::SeqCst)
    }

    /// Number of blocks the engine trusts this peer to deliver per chunk.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Reward a successful delivery.
    pub fn promote(&self) {
        let _ = self
            .rep
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |rep| {
                Some((rep + 1).min(REP_CEILING))
            });
    }

    /// Penalize a timeout or invalid delivery.
    pub fn demote(&self) {
        self.rep.fetch_sub(1, Ordering::SeqCst);
    }

    /// Double the trusted chunk size, capped at [`MAX_BLOCK_FETCH`].
    pub fn grow_capacity(&self) {
        let _ = self
            .capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cap| {
                Some((cap * 2).clamp(MIN_CAPACITY, MAX_BLOCK_FETCH))
            });
    }

    /// Halve the trusted chunk size after a missed delivery.
    pub fn shrink_capacity(&self) {
        let _ = self
            .capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cap| {
                Some((cap / 2).max(MIN_CAPACITY))
            });
    }

    /// Issue a hash request starting at `from`.
    pub fn request_hashes(&self, from: Hash) {
        debug!(peer = %self.id, from = %from, "Requesting hashes");
        (self.get_hashes)(from);
    }

    /// Dispatch a reserved chunk of block hashes to the peer.
    ///
    /// The idle flag is flipped by [`Queue::reserve`](crate::Queue::reserve)
    /// together with the reservation itself; a request addressed to another
    /// peer, or one whose idle flag was raced back on, is refused so the
    /// caller can return the chunk to the queue.
    pub fn fetch(&self, request: &Request) -> SyncResult<()> {
        if request.peer_id != self.id || self.is_idle() {
            return Err(SyncError::StaleRequest(self.id.clone()));
        }
        debug!(peer = %self.id, count = request.hashes.len(), "Requesting blocks");
        (self.get_blocks)(&request.hashes);
        Ok(())
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("head", &self.head)
            .field("idle", &self.is_idle())
            .field("rep", &self.rep())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// The set of registered download peers.
#[derive(Default)]
pub struct PeerSet {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a new peer. Fails if the id is already taken.
    pub fn register(&self, peer: Peer) -> SyncResult<()> {
        match self.peers.entry(peer.id().to_string()) {
            Entry::Occupied(_) => Err(SyncError::DuplicatePeer(peer.id().to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(peer));
                Ok(())
            }
        }
    }

    /// Remove a peer. Fails if the id is not registered.
    pub fn unregister(&self, id: &str) -> SyncResult<()> {
        self.peers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))
    }

    /// Look up a peer by id.
    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of every registered peer.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of the currently idle peers, in randomized order so that
    /// late registrations are not starved by iteration order.
    pub fn idle_peers(&self) -> Vec<Arc<Peer>> {
        let mut idle: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_idle())
            .map(|entry| entry.value().clone())
            .collect();
        idle.shuffle(&mut rand::thread_rng());
        idle
    }

    /// Reward a peer for a successful delivery.
    pub fn promote(&self, id: &str) {
        if let Some(peer) = self.peer(id) {
            peer.promote();
        }
    }

    /// Penalize a peer, dropping it from the set once its reputation falls
    /// below [`REP_FLOOR`]. Returns `true` if the peer was dropped.
    pub fn demote(&self, id: &str) -> bool {
        if let Some(peer) = self.peer(id) {
            peer.demote();
            if peer.rep() < REP_FLOOR {
                warn!(peer = %id, rep = peer.rep(), "Dropping misbehaving peer");
                self.peers.remove(id);
                return true;
            }
            debug!(peer = %id, rep = peer.rep(), "Demoted peer");
        }
        false
    }

    /// Mark every peer idle again. Membership, reputation and learned
    /// capacity survive; only the reservation state is cleared.
    pub fn reset(&self) {
        for entry in self.peers.iter() {
            entry.value().set_idle();
        }
    }
}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSet").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use crate::BLOCK_CACHE_LIMIT;

    fn test_hash(seed: u8) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        Hash::new(bytes)
    }

    fn test_peer(id: &str) -> Peer {
        Peer::new(id, test_hash(1), Box::new(|_| {}), Box::new(|_| {}))
    }

    #[test]
    fn test_register_and_lookup() {
        let peers = PeerSet::new();

        peers.register(test_peer("a")).unwrap();
        peers.register(test_peer("b")).unwrap();

        assert_eq!(peers.len(), 2);
        assert!(peers.peer("a").is_some());
        assert!(peers.peer("c").is_none());
    }

    #[test]
    fn test_register_duplicate_fails() {
        let peers = PeerSet::new();

        peers.register(test_peer("a")).unwrap();
        let err = peers.register(test_peer("a")).unwrap_err();
        assert_eq!(err, SyncError::DuplicatePeer("a".to_string()));
    }

    #[test]
    fn test_unregister_unknown_fails() {
        let peers = PeerSet::new();

        assert_eq!(
            peers.unregister("ghost").unwrap_err(),
            SyncError::UnknownPeer("ghost".to_string())
        );

        peers.register(test_peer("a")).unwrap();
        peers.unregister("a").unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_idle_lifecycle() {
        let peers = PeerSet::new();
        peers.register(test_peer("a")).unwrap();

        let peer = peers.peer("a").unwrap();
        assert!(peer.is_idle());
        assert_eq!(peers.idle_peers().len(), 1);

        // The reservation itself flips the flag.
        let queue = Queue::new(BLOCK_CACHE_LIMIT);
        queue.insert(&[test_hash(9)]);
        queue.alloc(0);
        let request = queue.reserve(&peer, 16).unwrap();
        assert!(!peer.is_idle());
        assert!(peers.idle_peers().is_empty());

        peer.fetch(&request).unwrap();
        assert!(!peer.is_idle());

        peer.set_idle();
        assert_eq!(peers.idle_peers().len(), 1);
    }

    #[test]
    fn test_fetch_refuses_stale_request() {
        let peers = PeerSet::new();
        peers.register(test_peer("a")).unwrap();
        let peer = peers.peer("a").unwrap();

        let queue = Queue::new(BLOCK_CACHE_LIMIT);
        queue.insert(&[test_hash(1), test_hash(2)]);
        queue.alloc(0);

        let request = queue.reserve(&peer, 1).unwrap();
        // The idle flag was raced back on; the dispatch is refused.
        peer.set_idle();
        let err = peer.fetch(&request).unwrap_err();
        assert_eq!(err, SyncError::StaleRequest("a".to_string()));

        // A request addressed to a different peer is refused outright.
        peers.register(test_peer("b")).unwrap();
        let other = peers.peer("b").unwrap();
        assert!(other.fetch(&request).is_err());
    }

    #[test]
    fn test_promote_saturates_at_ceiling() {
        let peer = test_peer("a");

        for _ in 0..(REP_CEILING + 50) {
            peer.promote();
        }
        assert_eq!(peer.rep(), REP_CEILING);
    }

    #[test]
    fn test_demote_below_floor_evicts() {
        let peers = PeerSet::new();
        peers.register(test_peer("a")).unwrap();

        let mut dropped = false;
        for _ in 0..=(REP_FLOOR.unsigned_abs() + 1) {
            dropped = peers.demote("a");
            if dropped {
                break;
            }
        }

        assert!(dropped);
        assert!(peers.peer("a").is_none());
        assert!(peers.is_empty());
    }

    #[test]
    fn test_capacity_adjustment() {
        let peer = test_peer("a");
        assert_eq!(peer.capacity(), MAX_BLOCK_FETCH);

        peer.shrink_capacity();
        assert_eq!(peer.capacity(), MAX_BLOCK_FETCH / 2);

        for _ in 0..20 {
            peer.shrink_capacity();
        }
        assert_eq!(peer.capacity(), MIN_CAPACITY);

        peer.grow_capacity();
        assert_eq!(peer.capacity(), 2 * MIN_CAPACITY);

        for _ in 0..20 {
            peer.grow_capacity();
        }
        assert_eq!(peer.capacity(), MAX_BLOCK_FETCH);
    }

    #[test]
    fn test_reset_preserves_membership_and_rep() {
        let peers = PeerSet::new();
        peers.register(test_peer("a")).unwrap();

        peers.promote("a");
        peers.promote("a");
        let peer = peers.peer("a").unwrap();

        let queue = Queue::new(BLOCK_CACHE_LIMIT);
        queue.insert(&[test_hash(3)]);
        queue.alloc(0);
        let request = queue.reserve(&peer, 4).unwrap();
        peer.fetch(&request).unwrap();
        assert!(!peer.is_idle());

        peers.reset();

        assert_eq!(peers.len(), 1);
        let peer = peers.peer("a").unwrap();
        assert!(peer.is_idle());
        assert_eq!(peer.rep(), 2);
    }
}
