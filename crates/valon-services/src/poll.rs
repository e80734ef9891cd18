//! WireGuard poller — the liveness input.
//!
//! Reads the local device on a short interval and folds each peer's kernel
//! state into the cache: overlay IP from allowed-ips, NAT endpoint and
//! handshake time from the kernel's observation. A kernel peer missing from
//! the cache triggers a targeted KV read (the admin may have added it since
//! the startup sweep); a peer the kernel trusts but the store has never
//! heard of is logged and left alone.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;

use crate::cache::PeerCache;
use crate::kv::{KvStore, PeerDirectory};
use crate::wg::{WgDevice, WgObservation};

/// Only complain about unregistered kernel peers that are actually alive.
const UNKNOWN_PEER_HANDSHAKE_WINDOW: Duration = Duration::from_secs(180);
/// And at most this often per key.
const UNKNOWN_PEER_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(
    cache: PeerCache,
    kv: KvStore,
    device: WgDevice,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    tracing::info!(interface = device.interface(), ?interval, "wireguard poller started");
    let mut ticker = tokio::time::interval(interval);
    let mut unknown_logged: HashMap<String, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&cache, &kv, &device, &mut unknown_logged).await;
            }
            _ = stop.changed() => {
                tracing::info!("wireguard poller stopped");
                return;
            }
        }
    }
}

async fn poll_once(
    cache: &PeerCache,
    kv: &KvStore,
    device: &WgDevice,
    unknown_logged: &mut HashMap<String, Instant>,
) {
    let observations = match device.observations().await {
        Ok(obs) => obs,
        Err(e) => {
            tracing::warn!(error = %e, "wireguard poll failed");
            return;
        }
    };

    for obs in observations {
        if apply_observation(cache, &obs) {
            continue;
        }

        // Not in cache: the admin may have seeded it since the startup
        // sweep. One targeted read settles it.
        match kv.fetch_peer(&obs.public_key).await {
            Ok(Some(peer)) => {
                tracing::info!(pubkey = %obs.public_key, "peer found in store, caching");
                cache.set(&obs.public_key, peer);
                apply_observation(cache, &obs);
            }
            Ok(None) => log_unknown_peer(&obs, unknown_logged),
            Err(e) => {
                tracing::warn!(pubkey = %obs.public_key, error = %e, "peer lookup failed");
            }
        }
    }
}

/// Fold one kernel observation into the cache. Returns false when the key
/// is not cached. The entry is only touched when something changed, so a
/// quiet mesh stays clean between syncs.
fn apply_observation(cache: &PeerCache, obs: &WgObservation) -> bool {
    let current = match cache.get(&obs.public_key) {
        Some(c) => c,
        None => return false,
    };

    let overlay_changed = obs.overlay_ip.is_some() && obs.overlay_ip != current.overlay_ip;
    let endpoint_changed = obs.endpoint.is_some() && obs.endpoint != current.nat_endpoint;
    let handshake_changed = obs.last_handshake != current.last_handshake;

    if overlay_changed && current.overlay_ip.is_some() {
        // The admin allocates overlay IPs uniquely; the kernel disagreeing
        // with the store means somebody edited one of them behind our back.
        tracing::error!(
            pubkey = %obs.public_key,
            cached = ?current.overlay_ip,
            kernel = ?obs.overlay_ip,
            "overlay ip mismatch between kernel and cache"
        );
    }

    if overlay_changed || endpoint_changed || handshake_changed {
        cache.update(&obs.public_key, |peer| {
            if let Some(ip) = obs.overlay_ip {
                peer.overlay_ip = Some(ip);
            }
            if let Some(ep) = obs.endpoint {
                peer.nat_endpoint = Some(ep);
            }
            peer.last_handshake = obs.last_handshake;
        });
    }
    true
}

fn log_unknown_peer(obs: &WgObservation, logged: &mut HashMap<String, Instant>) {
    let recent = obs
        .last_handshake
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|age| age < UNKNOWN_PEER_HANDSHAKE_WINDOW)
        .unwrap_or(false);
    if !recent {
        return;
    }

    let now = Instant::now();
    let due = logged
        .get(&obs.public_key)
        .map(|last| now.duration_since(*last) >= UNKNOWN_PEER_LOG_INTERVAL)
        .unwrap_or(true);
    if due {
        tracing::warn!(
            pubkey = %obs.public_key,
            "kernel peer not registered in store, awaiting first self-report"
        );
        logged.insert(obs.public_key.clone(), now);
    }
}
