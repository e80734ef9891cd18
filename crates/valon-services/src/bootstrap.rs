//! Startup reconciliation between the KV store, the cache, and the kernel.

use anyhow::{Context, Result};

use crate::cache::PeerCache;
use crate::kv::KvStore;
use crate::peer::PeerInfo;
use crate::wg::WgDevice;

/// Fill the cache from the KV store. Failure is degraded, not fatal: the
/// daemon starts empty and repopulates as the poller and HTTP reports come
/// in. Loaded entries are clean, so the first sync tick has nothing to do.
pub async fn load_cache(cache: &PeerCache, kv: &KvStore) {
    match kv.load_peers().await {
        Ok(peers) => {
            let count = peers.len();
            for peer in peers {
                let key = peer.public_key.clone();
                cache.set(&key, peer);
            }
            tracing::info!(count, "loaded peers from store");
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load peers from store, starting empty");
        }
    }
}

/// Reinstall cached peers that are missing from the kernel device, with
/// `allowed_ips = overlay_ip/32` and no endpoint override. Per-peer
/// failures are logged and skipped.
pub async fn restore_device_peers(cache: &PeerCache, device: &WgDevice) -> Result<()> {
    let installed = device
        .installed_keys()
        .await
        .context("failed to read device peers")?;

    let mut restored = 0usize;
    let mut skipped = 0usize;

    for peer in cache.snapshot() {
        if installed.contains(&peer.public_key) {
            skipped += 1;
            continue;
        }
        let overlay_ip = match peer.overlay_ip {
            Some(ip) => ip,
            None => {
                tracing::warn!(pubkey = %peer.public_key, "peer has no overlay ip, not restoring");
                continue;
            }
        };
        match device.install_peer(&peer.public_key, overlay_ip).await {
            Ok(()) => {
                restored += 1;
                tracing::info!(pubkey = %peer.public_key, ip = %overlay_ip, "restored wireguard peer");
            }
            Err(e) => {
                tracing::warn!(pubkey = %peer.public_key, error = %e, "failed to restore peer");
            }
        }
    }

    tracing::info!(restored, skipped, "wireguard peer restoration complete");
    Ok(())
}

/// Discover this node's own key and overlay IP from the kernel and insert a
/// dirty self record so it gets published on the first sync. A missing
/// interface is fatal.
pub async fn register_self(cache: &PeerCache, device: &WgDevice) -> Result<(String, std::net::Ipv4Addr)> {
    let (public_key, overlay_ip) = device
        .self_identity()
        .await
        .context("failed to discover own identity")?;

    let mut info = PeerInfo::new(public_key.clone());
    info.overlay_ip = Some(overlay_ip);
    info.dirty = true;
    cache.set(&public_key, info);

    tracing::info!(pubkey = %public_key, ip = %overlay_ip, "registered self");
    Ok((public_key, overlay_ip))
}
