//! In-memory peer cache — the coordination point between every plane.
//!
//! The DNS and HTTP handlers read it, the WireGuard poller and HTTP API
//! write it, the KV syncer drains its dirty entries. Writers on the same
//! key serialize on the map's shard locks; `snapshot` clones entries out so
//! nothing does I/O while a lock is held.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::peer::PeerInfo;

#[derive(Clone, Default)]
pub struct PeerCache {
    peers: Arc<DashMap<String, PeerInfo>>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone out the entry for a public key.
    pub fn get(&self, pubkey: &str) -> Option<PeerInfo> {
        self.peers.get(pubkey).map(|e| e.value().clone())
    }

    /// Insert or replace an entry, stamping `updated_at`. The dirty flag is
    /// taken from `info` as given — the KV loader inserts clean records, the
    /// bootstrap self-record arrives dirty. A replaced entry's version
    /// carries forward so a stale syncer snapshot cannot clear the new one.
    pub fn set(&self, pubkey: &str, mut info: PeerInfo) {
        info.updated_at = SystemTime::now();
        match self.peers.entry(pubkey.to_string()) {
            Entry::Occupied(mut entry) => {
                info.version = entry.get().version + 1;
                entry.insert(info);
            }
            Entry::Vacant(entry) => {
                entry.insert(info);
            }
        }
    }

    /// Mutate an existing entry in place, stamping `updated_at` and marking
    /// it dirty. A missing key is a no-op: callers that need insertion use
    /// [`set`](Self::set).
    pub fn update(&self, pubkey: &str, mutate: impl FnOnce(&mut PeerInfo)) {
        if let Some(mut entry) = self.peers.get_mut(pubkey) {
            mutate(entry.value_mut());
            entry.updated_at = SystemTime::now();
            entry.dirty = true;
            entry.version += 1;
        }
    }

    pub fn delete(&self, pubkey: &str) {
        self.peers.remove(pubkey);
    }

    /// Clone all entries out of the map.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    /// Clear the dirty flag for an entry, but only if its version still
    /// matches the snapshotted one. An entry touched after the syncer's
    /// snapshot keeps its flag and is picked up on the next tick.
    pub(crate) fn clear_dirty_if_unchanged(&self, pubkey: &str, seen_version: u64) {
        if let Some(mut entry) = self.peers.get_mut(pubkey) {
            if entry.version == seen_version {
                entry.dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn get_returns_last_set() {
        let cache = PeerCache::new();
        assert!(cache.get("k1").is_none());

        cache.set("k1", PeerInfo::new("k1"));
        assert_eq!(cache.get("k1").unwrap().public_key, "k1");
        assert_eq!(cache.count(), 1);

        cache.delete("k1");
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn update_marks_dirty_and_stamps() {
        let cache = PeerCache::new();
        cache.set("k1", PeerInfo::new("k1"));
        let before = cache.get("k1").unwrap();
        assert!(!before.is_dirty());

        cache.update("k1", |p| {
            p.overlay_ip = Some(Ipv4Addr::new(100, 64, 0, 5));
        });

        let after = cache.get("k1").unwrap();
        assert!(after.is_dirty());
        assert_eq!(after.overlay_ip, Some(Ipv4Addr::new(100, 64, 0, 5)));
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn update_on_missing_key_is_a_noop() {
        let cache = PeerCache::new();
        cache.update("ghost", |p| {
            p.overlay_ip = Some(Ipv4Addr::new(10, 0, 0, 1));
        });
        assert!(cache.get("ghost").is_none());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let cache = PeerCache::new();
        cache.set("k1", PeerInfo::new("k1"));
        cache.set("k2", PeerInfo::new("k2"));

        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);

        cache.delete("k1");
        // The snapshot is unaffected.
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn clear_dirty_respects_later_mutation() {
        let cache = PeerCache::new();
        cache.set("k1", PeerInfo::new("k1"));
        cache.update("k1", |p| {
            p.overlay_ip = Some(Ipv4Addr::new(100, 64, 0, 1));
        });

        let seen = cache.get("k1").unwrap().version;
        cache.clear_dirty_if_unchanged("k1", seen);
        assert!(!cache.get("k1").unwrap().is_dirty());

        // Mutate after the snapshot, then try to clear with the stale
        // version: the flag must survive for the next tick.
        cache.update("k1", |p| {
            p.lan_endpoint = Some("192.168.1.7:51820".parse().unwrap());
        });
        cache.clear_dirty_if_unchanged("k1", seen);
        assert!(cache.get("k1").unwrap().is_dirty());
    }

    #[test]
    fn replacement_set_also_defeats_stale_clear() {
        let cache = PeerCache::new();
        cache.set("k1", PeerInfo::new("k1"));
        cache.update("k1", |p| {
            p.overlay_ip = Some(Ipv4Addr::new(100, 64, 0, 1));
        });
        let seen = cache.get("k1").unwrap().version;

        // A wholesale replacement lands between snapshot and clear.
        let mut replacement = PeerInfo::new("k1");
        replacement.dirty = true;
        cache.set("k1", replacement);

        cache.clear_dirty_if_unchanged("k1", seen);
        assert!(cache.get("k1").unwrap().is_dirty());
    }
}
