//! Shared state and background services for the VALON discovery daemon:
//! the peer cache, the etcd-backed peer directory, WireGuard device access,
//! and the poller/syncer loops that keep them reconciled.

pub mod bootstrap;
pub mod cache;
pub mod kv;
pub mod peer;
pub mod poll;
pub mod sync;
pub mod wg;

pub use cache::PeerCache;
pub use kv::{KvStore, PeerDirectory};
pub use peer::PeerInfo;
pub use wg::{WgDevice, WgObservation};
