//! KV syncer — the durability output.
//!
//! Snapshots the cache on a coarse interval and writes every dirty entry
//! back to the store in one transaction per peer. Coalescing to the sync
//! cadence absorbs the per-second endpoint churn from the poller without
//! thrashing the store; a failed write leaves the entry dirty for the next
//! tick. The store being down degrades durability, never serving.

use std::time::Duration;

use tokio::sync::watch;

use crate::cache::PeerCache;
use crate::kv::KvStore;

pub async fn run(cache: PeerCache, kv: KvStore, interval: Duration, mut stop: watch::Receiver<bool>) {
    tracing::info!(?interval, "kv syncer started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sync_once(&cache, &kv).await;
            }
            _ = stop.changed() => {
                // One final drain so a clean shutdown persists what it can.
                sync_once(&cache, &kv).await;
                tracing::info!("kv syncer stopped");
                return;
            }
        }
    }
}

/// Write all dirty entries; returns how many were persisted.
pub async fn sync_once(cache: &PeerCache, kv: &KvStore) -> usize {
    let mut synced = 0;

    for peer in cache.snapshot() {
        if !peer.is_dirty() {
            continue;
        }
        match kv.write_peer(&peer).await {
            Ok(()) => {
                cache.clear_dirty_if_unchanged(&peer.public_key, peer.version);
                synced += 1;
            }
            Err(e) => {
                tracing::warn!(pubkey = %peer.public_key, error = %e, "peer sync failed");
            }
        }
    }

    if synced > 0 {
        tracing::debug!(synced, "synced dirty peers");
    }
    synced
}
