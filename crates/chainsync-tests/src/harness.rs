//! In-memory harness for exercising the downloader end to end.
//!
//! Simulates a local chain (the `has_block`/`get_block` callables) and a set
//! of remote peers. Each simulated peer's request callbacks feed a task that
//! answers through the downloader's delivery sinks, the same way a real
//! transport would.

use crate::generators::{chain_hash, linked_chain};
use chainsync::{
    Block, BlockRequestFn, Downloader, DownloaderConfig, Hash, HashRequestFn,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Number of hashes a simulated peer returns per hash request.
pub const HASH_BATCH: usize = 16;

/// Install a tracing subscriber for test debugging. Only the first call in
/// a process wins; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// A deterministic linked chain, genesis first.
pub struct TestChain {
    blocks: Vec<Block>,
}

impl TestChain {
    /// Generate a chain of `len` blocks, numbered from 0.
    pub fn generate(len: usize) -> Self {
        assert!(len >= 1, "a chain needs at least a genesis block");
        Self {
            blocks: linked_chain(len),
        }
    }

    /// Chain length in blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the chain is empty (never true for generated chains).
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The tip hash.
    pub fn head(&self) -> Hash {
        self.blocks[self.blocks.len() - 1].hash
    }

    /// Hash of the block at `number`.
    pub fn hash_at(&self, number: u64) -> Hash {
        chain_hash(number)
    }

    /// Look up a block by hash.
    pub fn block(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.iter().find(|block| block.hash == *hash)
    }

    /// Up to `count` ancestor hashes strictly after `from`, walking toward
    /// genesis. Empty when `from` is unknown or already at genesis.
    pub fn ancestors(&self, from: Hash, count: usize) -> Vec<Hash> {
        let Some(position) = self.blocks.iter().position(|block| block.hash == from) else {
            return Vec::new();
        };
        self.blocks[..position]
            .iter()
            .rev()
            .take(count)
            .map(|block| block.hash)
            .collect()
    }

    /// The blocks behind the given hashes, in request order. Unknown hashes
    /// are skipped.
    pub fn blocks_for(&self, hashes: &[Hash]) -> Vec<Block> {
        hashes
            .iter()
            .filter_map(|hash| self.block(hash).cloned())
            .collect()
    }
}

/// How a simulated peer answers requests.
#[derive(Debug, Clone, Copy)]
pub enum PeerBehavior {
    /// Answers every request from its chain after the given delay.
    Reliable { latency: Duration },
    /// Never answers anything.
    Silent,
    /// Serves the given number of hash batches promptly, ignores later hash
    /// requests; blocks are served normally.
    LimitedHashes { batches: usize },
    /// Serves the first `batches` hash requests promptly and later ones
    /// only after `latency`; blocks are served normally.
    SlowsDown { batches: usize, latency: Duration },
    /// Serves hashes but never delivers blocks.
    SilentBlocks,
    /// Answers hash requests with an empty batch.
    EmptyHashes,
    /// Delivers blocks with corrupted block numbers.
    BadBlocks,
}

impl PeerBehavior {
    /// A peer that answers everything immediately.
    pub fn reliable() -> Self {
        Self::Reliable {
            latency: Duration::ZERO,
        }
    }
}

/// What a simulated peer was asked for.
enum PeerRequest {
    Hashes(Hash),
    Blocks(Vec<Hash>),
}

/// A local node wired to a downloader, tracking which blocks the chain
/// store already knows.
pub struct TestNode {
    /// The engine under test.
    pub downloader: Arc<Downloader>,
    chain: Arc<TestChain>,
    known: Arc<RwLock<HashSet<Hash>>>,
}

impl TestNode {
    /// Create a node that already knows the first `local_blocks` blocks of
    /// `chain`.
    pub fn new(chain: TestChain, local_blocks: usize, config: DownloaderConfig) -> Self {
        assert!(local_blocks >= 1, "the node must know at least genesis");
        let chain = Arc::new(chain);
        let known: Arc<RwLock<HashSet<Hash>>> = Arc::new(RwLock::new(
            chain.blocks[..local_blocks]
                .iter()
                .map(|block| block.hash)
                .collect(),
        ));

        let has_known = known.clone();
        let has_block = Box::new(move |hash: Hash| has_known.read().contains(&hash));

        let get_known = known.clone();
        let get_chain = chain.clone();
        let get_block = Box::new(move |hash: Hash| {
            if get_known.read().contains(&hash) {
                get_chain.block(&hash).cloned()
            } else {
                None
            }
        });

        Self {
            downloader: Arc::new(Downloader::with_config(config, has_block, get_block)),
            chain,
            known,
        }
    }

    /// The chain every simulated peer serves from.
    pub fn chain(&self) -> &TestChain {
        &self.chain
    }

    /// Whether the local chain store knows a hash.
    pub fn knows(&self, hash: &Hash) -> bool {
        self.known.read().contains(hash)
    }

    /// Register a simulated peer claiming `head`, served by a background
    /// task with the given behavior.
    pub fn add_peer(&self, id: &str, head: Hash, behavior: PeerBehavior) {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();

        let hash_tx = request_tx.clone();
        let get_hashes: HashRequestFn = Box::new(move |from| {
            let _ = hash_tx.send(PeerRequest::Hashes(from));
        });
        let block_tx = request_tx;
        let get_blocks: BlockRequestFn = Box::new(move |hashes: &[Hash]| {
            let _ = block_tx.send(PeerRequest::Blocks(hashes.to_vec()));
        });

        self.downloader
            .register_peer(id, head, get_hashes, get_blocks)
            .expect("peer id is unique");

        let downloader = self.downloader.clone();
        let chain = self.chain.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut hash_batches_served = 0usize;
            while let Some(request) = request_rx.recv().await {
                match request {
                    PeerRequest::Hashes(from) => {
                        match behavior {
                            PeerBehavior::Silent => continue,
                            PeerBehavior::LimitedHashes { batches }
                                if hash_batches_served >= batches =>
                            {
                                continue
                            }
                            PeerBehavior::Reliable { latency } if !latency.is_zero() => {
                                tokio::time::sleep(latency).await;
                            }
                            PeerBehavior::SlowsDown { batches, latency }
                                if hash_batches_served >= batches =>
                            {
                                tokio::time::sleep(latency).await;
                            }
                            _ => {}
                        }
                        let hashes = match behavior {
                            PeerBehavior::EmptyHashes => Vec::new(),
                            _ => chain.ancestors(from, HASH_BATCH),
                        };
                        hash_batches_served += 1;
                        // The sync may have ended; a rejected delivery is fine.
                        let _ = downloader.deliver_hashes(&id, hashes).await;
                    }
                    PeerRequest::Blocks(hashes) => {
                        match behavior {
                            PeerBehavior::Silent | PeerBehavior::SilentBlocks => continue,
                            PeerBehavior::Reliable { latency } if !latency.is_zero() => {
                                tokio::time::sleep(latency).await;
                            }
                            _ => {}
                        }
                        let mut blocks = chain.blocks_for(&hashes);
                        if matches!(behavior, PeerBehavior::BadBlocks) {
                            for block in &mut blocks {
                                block.number += 1_000;
                            }
                        }
                        let _ = downloader.deliver_blocks(&id, blocks).await;
                    }
                }
            }
        });
    }

    /// Drain deliverable blocks and record them as inserted into the local
    /// chain, the way the chain-insertion collaborator would.
    pub fn import_blocks(&self) -> Vec<Block> {
        let taken = self.downloader.take_blocks();
        if !taken.is_empty() {
            let mut known = self.known.write();
            for block in &taken {
                known.insert(block.hash);
            }
        }
        taken
    }

    /// Keep draining until `count` blocks have been imported or the
    /// deadline passes.
    pub async fn import_until(&self, count: usize, deadline: Duration) -> Vec<Block> {
        let until = tokio::time::Instant::now() + deadline;
        let mut imported = Vec::new();
        while imported.len() < count && tokio::time::Instant::now() < until {
            imported.extend(self.import_blocks());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        imported
    }
}

/// Assert that `blocks` is a strictly linked ascending chain run.
pub fn assert_chain_ordered(blocks: &[Block]) {
    for pair in blocks.windows(2) {
        assert_eq!(
            pair[1].parent, pair[0].hash,
            "block {} does not link to its predecessor",
            pair[1].number
        );
        assert_eq!(pair[1].number, pair[0].number + 1);
    }
}
