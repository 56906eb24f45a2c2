//! Chain synchronization orchestrator.
//!
//! The downloader runs one synchronization at a time: a hash backfill phase
//! walking from the target head to a locally known ancestor, then a block
//! download phase fanning reservations out to idle peers until every
//! scheduled block has been delivered. Transports feed responses in through
//! [`Downloader::deliver_hashes`] and [`Downloader::deliver_blocks`]; the
//! chain-insertion collaborator drains results through
//! [`Downloader::take_blocks`].

use crate::error::{SyncError, SyncResult};
use crate::peer::{BlockRequestFn, HashRequestFn, Peer, PeerSet};
use crate::queue::Queue;
use crate::types::{Block, Hash};
use crate::{BLOCK_CACHE_LIMIT, BLOCK_TTL, FETCH_TICK, HASH_TTL, MAX_BLOCK_FETCH};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback asking the local chain whether it already knows a block hash.
pub type HasBlockFn = Box<dyn Fn(Hash) -> bool + Send + Sync>;

/// Callback fetching a full block from the local chain.
pub type GetBlockFn = Box<dyn Fn(Hash) -> Option<Block> + Send + Sync>;

/// A batch of hashes received from one peer.
#[derive(Debug)]
struct HashPack {
    peer_id: String,
    hashes: Vec<Hash>,
}

/// A batch of blocks received from one peer.
#[derive(Debug)]
struct BlockPack {
    peer_id: String,
    blocks: Vec<Block>,
}

/// Downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Largest chunk of hashes dispatched to one peer.
    pub max_block_fetch: usize,
    /// Time allowed for a peer to answer a hash request.
    pub hash_ttl: Duration,
    /// Time allowed for a peer to deliver a reserved chunk.
    pub block_ttl: Duration,
    /// Interval between scheduling passes in the block phase.
    pub tick_interval: Duration,
    /// High-water mark for undrained blocks before dispatch pauses.
    pub block_cache_limit: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_block_fetch: MAX_BLOCK_FETCH,
            hash_ttl: HASH_TTL,
            block_ttl: BLOCK_TTL,
            tick_interval: FETCH_TICK,
            block_cache_limit: BLOCK_CACHE_LIMIT,
        }
    }
}

/// Inbound delivery channels, owned by the running sync.
struct Inbound {
    hashes: mpsc::Receiver<HashPack>,
    blocks: mpsc::Receiver<BlockPack>,
}

impl Inbound {
    /// Drop whatever the transports managed to enqueue.
    fn drain(&mut self) {
        while self.hashes.try_recv().is_ok() {}
        while self.blocks.try_recv().is_ok() {}
    }
}

/// The synchronization engine.
pub struct Downloader {
    config: DownloaderConfig,
    queue: Queue,
    peers: PeerSet,
    has_block: HasBlockFn,
    get_block: GetBlockFn,
    /// Set while exactly one `synchronize` call is in flight.
    synchronizing: AtomicBool,
    hash_tx: mpsc::Sender<HashPack>,
    block_tx: mpsc::Sender<BlockPack>,
    inbound: tokio::sync::Mutex<Inbound>,
    cancel: Mutex<CancellationToken>,
}

impl Downloader {
    /// Create a downloader with default configuration.
    pub fn new(has_block: HasBlockFn, get_block: GetBlockFn) -> Self {
        Self::with_config(DownloaderConfig::default(), has_block, get_block)
    }

    /// Create a downloader with explicit configuration.
    pub fn with_config(
        config: DownloaderConfig,
        has_block: HasBlockFn,
        get_block: GetBlockFn,
    ) -> Self {
        // Depth-1 channels put backpressure on the transport and keep the
        // cancellation drain trivial.
        let (hash_tx, hash_rx) = mpsc::channel(1);
        let (block_tx, block_rx) = mpsc::channel(1);

        Self {
            queue: Queue::new(config.block_cache_limit),
            config,
            peers: PeerSet::new(),
            has_block,
            get_block,
            synchronizing: AtomicBool::new(false),
            hash_tx,
            block_tx,
            inbound: tokio::sync::Mutex::new(Inbound {
                hashes: hash_rx,
                blocks: block_rx,
            }),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Register a new download peer.
    pub fn register_peer(
        &self,
        id: &str,
        head: Hash,
        get_hashes: HashRequestFn,
        get_blocks: BlockRequestFn,
    ) -> SyncResult<()> {
        debug!(peer = %id, head = %head, "Registering peer");
        self.peers.register(Peer::new(id, head, get_hashes, get_blocks))
    }

    /// Remove a peer, preventing any further work from being assigned to it.
    pub fn unregister_peer(&self, id: &str) -> SyncResult<()> {
        debug!(peer = %id, "Unregistering peer");
        self.peers.unregister(id)
    }

    /// The registered peer set.
    pub fn peer_set(&self) -> &PeerSet {
        &self.peers
    }

    /// Pending hash count and cached block count.
    pub fn stats(&self) -> (usize, usize) {
        self.queue.size()
    }

    /// Whether the download schedule has seen this hash.
    pub fn has(&self, hash: &Hash) -> bool {
        self.queue.has(hash)
    }

    /// Run a full synchronization against peer `id`, starting from
    /// `target_head`.
    ///
    /// Admits one caller at a time: a concurrent second call returns
    /// [`SyncError::Busy`] immediately and without side effects. On any
    /// error the queue is reset; peer reputation survives across calls.
    pub async fn synchronize(&self, id: &str, target_head: Hash) -> SyncResult<()> {
        if self
            .synchronizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Busy);
        }

        let result = self.sync_with_peer(id, target_head).await;
        self.synchronizing.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_with_peer(&self, id: &str, target_head: Hash) -> SyncResult<()> {
        // Fresh cancellation scope for this run.
        *self.cancel.lock() = CancellationToken::new();

        // Blocks the consumer has not drained yet must not be clobbered.
        let (_, cached) = self.queue.size();
        if cached > 0 && self.queue.head_block().is_some() {
            return Err(SyncError::PendingQueue);
        }
        self.queue.reset();
        self.peers.reset();

        let origin = self
            .peers
            .peer(id)
            .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))?;

        let mut inbound = self.inbound.lock().await;
        inbound.drain();

        info!(peer = %id, head = %target_head, "Synchronizing");
        let result = {
            match self.fetch_hashes(&mut inbound, origin, target_head).await {
                Ok(()) => self.fetch_blocks(&mut inbound).await,
                Err(err) => Err(err),
            }
        };
        if result.is_err() {
            self.queue.reset();
        } else {
            info!(peer = %id, "Synchronization completed");
        }
        result
    }

    /// Phase 1: walk the hash chain backwards from the target head until a
    /// locally known ancestor turns up.
    async fn fetch_hashes(
        &self,
        inbound: &mut Inbound,
        origin: Arc<Peer>,
        target_head: Hash,
    ) -> SyncResult<()> {
        let cancel = self.cancel.lock().clone();
        let ttl = self.config.hash_ttl;

        self.queue.insert(&[target_head]);
        origin.request_hashes(target_head);

        let mut active = origin;
        let mut attempted: HashSet<String> = HashSet::new();
        attempted.insert(active.id().to_string());
        // The hash most recently asked for; zero until a first batch lands.
        let mut last_hash = Hash::ZERO;

        // The response timer is one-shot: only a valid batch from the
        // active peer re-arms it. A failover leaves it quiet until the
        // replacement responds.
        let timeout = tokio::time::sleep(ttl);
        tokio::pin!(timeout);
        let mut timer_armed = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::HashFetchCancelled);
                }

                Some(pack) = inbound.hashes.recv() => {
                    // Late replies from a superseded peer are dropped.
                    if pack.peer_id != active.id() {
                        debug!(peer = %pack.peer_id, "Discarding hashes from inactive peer");
                        continue;
                    }
                    timeout.as_mut().reset(tokio::time::Instant::now() + ttl);
                    timer_armed = true;

                    if pack.hashes.is_empty() {
                        debug!(peer = %active.id(), "Peer responded with empty hash set");
                        self.queue.reset();
                        return Err(SyncError::EmptyHashSet);
                    }

                    // Stop at the first hash the local chain or the schedule
                    // already knows.
                    let mut known = None;
                    for (position, hash) in pack.hashes.iter().enumerate() {
                        if (self.has_block)(*hash) || self.queue.has(hash) {
                            known = Some((position, *hash));
                            break;
                        }
                    }

                    match known {
                        Some((position, ancestor)) => {
                            self.queue.insert(&pack.hashes[..position]);
                            let offset = (self.get_block)(ancestor)
                                .map(|block| block.number + 1)
                                .unwrap_or(0);
                            self.queue.alloc(offset);
                            info!(
                                ancestor = %ancestor,
                                pending = self.queue.pending(),
                                "Hash download complete"
                            );
                            return Ok(());
                        }
                        None => {
                            if let Some(last) = pack.hashes.last() {
                                last_hash = *last;
                            }
                            self.queue.insert(&pack.hashes);
                            debug!(
                                peer = %active.id(),
                                count = pack.hashes.len(),
                                pending = self.queue.pending(),
                                "Queued hashes"
                            );
                            active.request_hashes(last_hash);
                        }
                    }
                }

                () = &mut timeout, if timer_armed => {
                    warn!(peer = %active.id(), "Peer did not respond in time to hash request");

                    // A replacement must claim a head the schedule has seen,
                    // otherwise it cannot be on the chain being fetched.
                    let replacement = self
                        .peers
                        .all_peers()
                        .into_iter()
                        .find(|peer| {
                            !attempted.contains(peer.id()) && self.queue.has(&peer.head())
                        });

                    match replacement {
                        Some(next) if !last_hash.is_zero() => {
                            attempted.insert(next.id().to_string());
                            debug!(peer = %next.id(), "Hash fetching switched to new peer");
                            // From here on the previous peer's in-flight
                            // reply fails the sender check above.
                            active = next;
                            active.request_hashes(last_hash);
                            timer_armed = false;
                        }
                        _ => {
                            self.queue.reset();
                            return Err(SyncError::Timeout);
                        }
                    }
                }
            }
        }
    }

    /// Phase 2: fan block reservations out to idle peers until the whole
    /// schedule has been delivered.
    async fn fetch_blocks(&self, inbound: &mut Inbound) -> SyncResult<()> {
        let cancel = self.cancel.lock().clone();
        debug!(pending = self.queue.pending(), "Downloading blocks");

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::BlockFetchCancelled);
                }

                Some(pack) = inbound.blocks.recv() => {
                    // Deliveries from peers unregistered mid-flight are
                    // dropped on the floor.
                    let Some(peer) = self.peers.peer(&pack.peer_id) else {
                        continue;
                    };
                    match self.queue.deliver(&pack.peer_id, pack.blocks) {
                        Ok(count) => {
                            debug!(peer = %pack.peer_id, count, "Added blocks");
                            peer.promote();
                            peer.grow_capacity();
                            peer.set_idle();
                        }
                        Err(err) => {
                            debug!(peer = %pack.peer_id, error = %err, "Failed block delivery");
                            self.peers.demote(&pack.peer_id);
                        }
                    }
                }

                _ = ticker.tick() => {
                    // Reclaim reservations from stragglers first.
                    for peer_id in self.queue.expire(self.config.block_ttl) {
                        warn!(peer = %peer_id, "Block delivery timed out");
                        if let Some(peer) = self.peers.peer(&peer_id) {
                            peer.shrink_capacity();
                            peer.set_idle();
                        }
                        self.peers.demote(&peer_id);
                    }

                    if self.peers.is_empty() {
                        self.queue.reset();
                        return Err(SyncError::NoPeers);
                    }

                    if self.queue.pending() > 0 {
                        if self.queue.throttle() {
                            continue;
                        }
                        for peer in self.peers.idle_peers() {
                            if self.queue.throttle() {
                                break;
                            }
                            let Some(request) =
                                self.queue.reserve(&peer, self.config.max_block_fetch)
                            else {
                                continue;
                            };
                            // A refused fetch means the reservation was
                            // raced away; hand the chunk back.
                            if peer.fetch(&request).is_err() {
                                warn!(peer = %peer.id(), "Peer refused block request");
                                self.queue.cancel(&request);
                            }
                        }
                        if self.queue.in_flight() == 0 {
                            self.queue.reset();
                            return Err(SyncError::PeersUnavailable);
                        }
                    } else if self.queue.in_flight() == 0 {
                        debug!("Block download complete");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Inject a batch of hashes received from a remote peer. Called by the
    /// transport layer when a hash response arrives.
    pub async fn deliver_hashes(&self, peer_id: &str, hashes: Vec<Hash>) -> SyncResult<()> {
        if !self.synchronizing.load(Ordering::SeqCst) {
            return Err(SyncError::NoSyncActive);
        }
        self.hash_tx
            .send(HashPack {
                peer_id: peer_id.to_string(),
                hashes,
            })
            .await
            .map_err(|_| SyncError::NoSyncActive)
    }

    /// Inject a batch of blocks received from a remote peer. Called by the
    /// transport layer when a block response arrives.
    pub async fn deliver_blocks(&self, peer_id: &str, blocks: Vec<Block>) -> SyncResult<()> {
        if !self.synchronizing.load(Ordering::SeqCst) {
            return Err(SyncError::NoSyncActive);
        }
        self.block_tx
            .send(BlockPack {
                peer_id: peer_id.to_string(),
                blocks,
            })
            .await
            .map_err(|_| SyncError::NoSyncActive)
    }

    /// Drain the chain-ordered run of downloaded blocks whose first parent
    /// the local chain already knows. Returns an empty vector when nothing
    /// is deliverable yet.
    pub fn take_blocks(&self) -> Vec<Block> {
        let Some(head) = self.queue.head_block() else {
            return Vec::new();
        };
        if !(self.has_block)(head.parent) {
            return Vec::new();
        }
        self.queue.take_blocks(&head)
    }

    /// Abort an in-flight synchronization and discard all queued state.
    ///
    /// Returns `false` when nothing was running and nothing was queued.
    /// Safe to call repeatedly.
    pub fn cancel(&self) -> bool {
        let (pending, cached) = self.queue.size();
        if !self.synchronizing.load(Ordering::SeqCst) && pending == 0 && cached == 0 {
            return false;
        }

        info!("Cancelling synchronization");
        self.cancel.lock().cancel();

        // With no sync holding the receivers, flush whatever is in flight;
        // a running sync drains at its next start instead.
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.drain();
        }
        self.queue.reset();

        true
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (pending, cached) = self.stats();
        f.debug_struct("Downloader")
            .field("peers", &self.peers.len())
            .field("pending", &pending)
            .field("cached", &cached)
            .field("synchronizing", &self.synchronizing.load(Ordering::SeqCst))
            .finish()
    }
}
