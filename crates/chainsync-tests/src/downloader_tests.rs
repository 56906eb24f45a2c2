//! End-to-end synchronization scenarios against the in-memory harness.

use crate::harness::{assert_chain_ordered, PeerBehavior, TestChain, TestNode};
use chainsync::{DownloaderConfig, SyncError};
use std::time::Duration;

/// Configuration with timeouts short enough for tests.
fn fast_config() -> DownloaderConfig {
    DownloaderConfig {
        hash_ttl: Duration::from_millis(150),
        block_ttl: Duration::from_millis(150),
        tick_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn node_with(chain_len: usize, config: DownloaderConfig) -> TestNode {
    TestNode::new(TestChain::generate(chain_len), 1, config)
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn test_happy_path_single_peer() {
    crate::harness::init_tracing();
    let node = node_with(40, fast_config());
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_blocks();
    assert_eq!(imported.len(), 39);
    assert_eq!(imported[0].number, 1);
    assert_eq!(imported[38].number, 39);
    assert_chain_ordered(&imported);

    assert_eq!(node.downloader.stats(), (0, 0));
    assert!(node.knows(&head));
}

#[tokio::test]
async fn test_multi_peer_round_trip() {
    let node = node_with(400, fast_config());
    let head = node.chain().head();
    node.add_peer(
        "a",
        head,
        PeerBehavior::Reliable {
            latency: Duration::from_millis(5),
        },
    );
    node.add_peer(
        "b",
        head,
        PeerBehavior::Reliable {
            latency: Duration::from_millis(5),
        },
    );
    node.add_peer(
        "c",
        head,
        PeerBehavior::Reliable {
            latency: Duration::from_millis(5),
        },
    );

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_until(399, Duration::from_secs(10)).await;
    assert_eq!(imported.len(), 399);
    assert_chain_ordered(&imported);
    assert_eq!(node.downloader.stats(), (0, 0));
}

#[tokio::test]
async fn test_small_chunks_force_multiple_reservations() {
    let config = DownloaderConfig {
        max_block_fetch: 16,
        ..fast_config()
    };
    let node = node_with(100, config);
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_blocks();
    assert_eq!(imported.len(), 99);
    assert_chain_ordered(&imported);
}

#[tokio::test]
async fn test_throttle_waits_for_consumer() {
    let config = DownloaderConfig {
        max_block_fetch: 16,
        block_cache_limit: 64,
        ..fast_config()
    };
    let node = node_with(300, config);
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::reliable());
    node.add_peer("b", head, PeerBehavior::reliable());

    let downloader = node.downloader.clone();
    let sync = tokio::spawn(async move { downloader.synchronize("a", head).await });

    // The cache is far smaller than the chain, so the sync can only finish
    // if dispatch pauses while the consumer drains.
    let imported = node.import_until(299, Duration::from_secs(15)).await;

    sync.await.unwrap().unwrap();
    let remaining = node.import_blocks();

    let mut all = imported;
    all.extend(remaining);
    assert_eq!(all.len(), 299);
    assert_chain_ordered(&all);
    assert_eq!(node.downloader.stats(), (0, 0));
}

// ============================================================================
// Hash phase failover
// ============================================================================

#[tokio::test]
async fn test_hash_failover_to_second_peer() {
    let node = node_with(80, fast_config());
    let head = node.chain().head();
    // Peer a answers exactly one hash batch, then ignores hash requests.
    node.add_peer("a", head, PeerBehavior::LimitedHashes { batches: 1 });
    node.add_peer("b", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_until(79, Duration::from_secs(10)).await;
    assert_eq!(imported.len(), 79);
    assert_chain_ordered(&imported);
}

#[tokio::test]
async fn test_late_hash_reply_is_discarded() {
    let node = node_with(80, fast_config());
    let head = node.chain().head();
    // Peer a turns slow after its first batch; its second reply lands well
    // after the failover and must be ignored by the sender check.
    node.add_peer(
        "a",
        head,
        PeerBehavior::SlowsDown {
            batches: 1,
            latency: Duration::from_millis(400),
        },
    );
    node.add_peer("b", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_until(79, Duration::from_secs(10)).await;
    assert_eq!(imported.len(), 79);
    assert_chain_ordered(&imported);
}

#[tokio::test]
async fn test_hash_timeout_without_fallback() {
    let node = node_with(40, fast_config());
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::Silent);

    let err = node.downloader.synchronize("a", head).await.unwrap_err();
    assert_eq!(err, SyncError::Timeout);
    assert_eq!(node.downloader.stats(), (0, 0));
}

#[tokio::test]
async fn test_empty_hash_set() {
    let node = node_with(40, fast_config());
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::EmptyHashes);

    let err = node.downloader.synchronize("a", head).await.unwrap_err();
    assert_eq!(err, SyncError::EmptyHashSet);
    assert_eq!(node.downloader.stats(), (0, 0));
}

// ============================================================================
// Block phase misbehavior
// ============================================================================

#[tokio::test]
async fn test_block_straggler_is_demoted_and_work_reassigned() {
    let config = DownloaderConfig {
        max_block_fetch: 32,
        ..fast_config()
    };
    let node = node_with(120, config);
    let head = node.chain().head();
    // Peer a serves hashes but sits on every block request.
    node.add_peer("a", head, PeerBehavior::SilentBlocks);
    node.add_peer("b", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    let imported = node.import_until(119, Duration::from_secs(10)).await;
    assert_eq!(imported.len(), 119);
    assert_chain_ordered(&imported);

    // The straggler lost reputation (or the whole registration); the
    // delivering peer gained it.
    let peers = node.downloader.peer_set();
    let straggler_rep = peers.peer("a").map(|peer| peer.rep());
    assert!(straggler_rep.map_or(true, |rep| rep < 0));
    assert!(peers.peer("b").unwrap().rep() > 0);
}

#[tokio::test]
async fn test_bad_blocks_peer_is_evicted() {
    let config = DownloaderConfig {
        block_ttl: Duration::from_millis(100),
        ..fast_config()
    };
    let node = node_with(60, config);
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::BadBlocks);

    let err = node.downloader.synchronize("a", head).await.unwrap_err();
    assert_eq!(err, SyncError::NoPeers);
    assert!(node.downloader.peer_set().is_empty());
    assert_eq!(node.downloader.stats(), (0, 0));
}

// ============================================================================
// Cancellation and exclusion
// ============================================================================

#[tokio::test]
async fn test_cancel_mid_flight() {
    crate::harness::init_tracing();
    let config = DownloaderConfig {
        block_ttl: Duration::from_millis(200),
        ..fast_config()
    };
    let node = node_with(60, config);
    let head = node.chain().head();
    // The only peer never delivers blocks, so phase 2 runs until cancelled.
    node.add_peer("a", head, PeerBehavior::SilentBlocks);

    let downloader = node.downloader.clone();
    let sync = tokio::spawn(async move { downloader.synchronize("a", head).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(node.downloader.cancel());
    let err = sync.await.unwrap().unwrap_err();
    assert_eq!(err, SyncError::BlockFetchCancelled);
    assert_eq!(node.downloader.stats(), (0, 0));

    // Cancelling again with nothing running is a no-op.
    assert!(!node.downloader.cancel());

    // A subsequent sync against a working peer proceeds.
    node.add_peer("b", head, PeerBehavior::reliable());
    node.downloader.synchronize("b", head).await.unwrap();
    let imported = node.import_until(59, Duration::from_secs(10)).await;
    assert_eq!(imported.len(), 59);
    assert_chain_ordered(&imported);
}

#[tokio::test]
async fn test_cancel_during_hash_phase() {
    let config = DownloaderConfig {
        hash_ttl: Duration::from_secs(5),
        ..fast_config()
    };
    let node = node_with(40, config);
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::Silent);

    let downloader = node.downloader.clone();
    let sync = tokio::spawn(async move { downloader.synchronize("a", head).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(node.downloader.cancel());
    let err = sync.await.unwrap().unwrap_err();
    assert_eq!(err, SyncError::HashFetchCancelled);
    assert_eq!(node.downloader.stats(), (0, 0));
}

#[tokio::test]
async fn test_second_synchronize_is_busy() {
    let config = DownloaderConfig {
        hash_ttl: Duration::from_secs(5),
        ..fast_config()
    };
    let node = node_with(40, config);
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::Silent);

    let downloader = node.downloader.clone();
    let sync = tokio::spawn(async move { downloader.synchronize("a", head).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = node.downloader.synchronize("a", head).await.unwrap_err();
    assert_eq!(err, SyncError::Busy);

    node.downloader.cancel();
    let err = sync.await.unwrap().unwrap_err();
    assert_eq!(err, SyncError::HashFetchCancelled);
}

#[tokio::test]
async fn test_cancel_clears_undrained_blocks() {
    let node = node_with(30, fast_config());
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();
    let (_, cached) = node.downloader.stats();
    assert!(cached > 0);

    // Nothing is running, but residual blocks make cancel meaningful.
    assert!(node.downloader.cancel());
    assert_eq!(node.downloader.stats(), (0, 0));
    assert!(node.import_blocks().is_empty());
}

#[tokio::test]
async fn test_pending_queue_blocks_new_sync() {
    let node = node_with(30, fast_config());
    let head = node.chain().head();
    node.add_peer("a", head, PeerBehavior::reliable());

    node.downloader.synchronize("a", head).await.unwrap();

    // The consumer has not drained yet.
    let err = node.downloader.synchronize("a", head).await.unwrap_err();
    assert_eq!(err, SyncError::PendingQueue);

    let imported = node.import_blocks();
    assert_eq!(imported.len(), 29);

    // Drained, a new sync goes through again.
    node.downloader.synchronize("a", head).await.unwrap();
}

#[tokio::test]
async fn test_unknown_peer_rejected() {
    let node = node_with(10, fast_config());
    let head = node.chain().head();

    let err = node.downloader.synchronize("ghost", head).await.unwrap_err();
    assert_eq!(err, SyncError::UnknownPeer("ghost".to_string()));
}
