//! etcd-backed peer directory.
//!
//! Key layout (values are plain ASCII strings):
//!
//! ```text
//! /valon/peers/<base64-key>/overlay_ip       "100.64.0.5"
//! /valon/peers/<base64-key>/endpoints/lan    "192.168.1.7:51820"
//! /valon/peers/<base64-key>/endpoints/nated  "203.0.113.9:41820"
//! /valon/peers/<base64-key>/alias            "alice"
//! /valon/aliases/<alias>                     "<base64-key>"
//! ```
//!
//! Base64 keys contain `/`, so relative keys are split by locating a known
//! field suffix rather than on the separator.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions, Txn, TxnOp};
use tokio::time::timeout;

use crate::peer::PeerInfo;

pub const PEERS_PREFIX: &str = "/valon/peers/";
pub const ALIASES_PREFIX: &str = "/valon/aliases/";

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(2);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const LOAD_DEADLINE: Duration = Duration::from_secs(10);

/// The subset of directory operations the request planes need. The HTTP API
/// and the DNS handler go through this trait so their logic is testable
/// against an in-memory stub.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Resolve an alias to its base64 public key.
    async fn alias_target(&self, alias: &str) -> Result<Option<String>>;

    /// Write both alias rows: the reverse index and the peer's alias field.
    async fn publish_alias(&self, alias: &str, pubkey: &str) -> Result<()>;

    /// Read one peer's subtree.
    async fn fetch_peer(&self, pubkey: &str) -> Result<Option<PeerInfo>>;

    /// Delete a peer's subtree and, if known, its alias row.
    async fn remove_peer(&self, pubkey: &str, alias: Option<&str>) -> Result<()>;
}

#[derive(Clone)]
pub struct KvStore {
    client: Client,
}

impl KvStore {
    /// Connect to the KV store. A refused connection is fatal to the
    /// caller; an empty store is not.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_DEADLINE)
            .with_timeout(WRITE_DEADLINE);
        let client = Client::connect(endpoints, Some(options))
            .await
            .context("failed to connect to etcd")?;
        Ok(Self { client })
    }

    /// Issue a throwaway read so connectivity problems surface at startup
    /// instead of on the first query. Failure is logged, not returned: an
    /// empty store answers this fine, and a flaky one will be retried by
    /// the loops anyway.
    pub async fn probe(&self) {
        let mut client = self.client.clone();
        match timeout(READ_DEADLINE, client.get("/valon/health", None)).await {
            Ok(Ok(_)) => tracing::info!("etcd connection verified"),
            Ok(Err(e)) => tracing::warn!(error = %e, "etcd probe failed"),
            Err(_) => tracing::warn!("etcd probe timed out"),
        }
    }

    /// Range over the whole peers prefix and assemble one `PeerInfo` per
    /// public key. Records with malformed keys or values are skipped.
    /// Returned entries are clean (`dirty = false`).
    pub async fn load_peers(&self) -> Result<Vec<PeerInfo>> {
        let mut client = self.client.clone();
        let resp = timeout(
            LOAD_DEADLINE,
            client.get(PEERS_PREFIX, Some(GetOptions::new().with_prefix())),
        )
        .await
        .context("etcd load deadline exceeded")?
        .context("etcd range over peers failed")?;

        let entries: Vec<(String, String)> = resp
            .kvs()
            .iter()
            .filter_map(|kv| match (kv.key_str(), kv.value_str()) {
                (Ok(k), Ok(v)) => Some((k.to_string(), v.to_string())),
                _ => {
                    tracing::warn!("skipping non-utf8 kv entry");
                    None
                }
            })
            .collect();

        Ok(assemble_peers(&entries))
    }

    /// Write one peer's synced fields in a single transaction. Fields that
    /// are unset are left untouched in the store.
    pub async fn write_peer(&self, peer: &PeerInfo) -> Result<()> {
        let mut ops = Vec::new();
        if let Some(ip) = peer.overlay_ip {
            ops.push(TxnOp::put(
                format!("{PEERS_PREFIX}{}/overlay_ip", peer.public_key),
                ip.to_string(),
                None,
            ));
        }
        if let Some(ep) = peer.lan_endpoint {
            ops.push(TxnOp::put(
                format!("{PEERS_PREFIX}{}/endpoints/lan", peer.public_key),
                ep.to_string(),
                None,
            ));
        }
        if let Some(ep) = peer.nat_endpoint {
            ops.push(TxnOp::put(
                format!("{PEERS_PREFIX}{}/endpoints/nated", peer.public_key),
                ep.to_string(),
                None,
            ));
        }
        if ops.is_empty() {
            return Ok(());
        }

        let mut client = self.client.clone();
        timeout(WRITE_DEADLINE, client.txn(Txn::new().and_then(ops)))
            .await
            .context("etcd txn deadline exceeded")?
            .context("etcd peer txn failed")?;
        Ok(())
    }
}

#[async_trait]
impl PeerDirectory for KvStore {
    async fn alias_target(&self, alias: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = timeout(
            READ_DEADLINE,
            client.get(format!("{ALIASES_PREFIX}{alias}"), None),
        )
        .await
        .context("etcd alias read deadline exceeded")?
        .context("etcd alias read failed")?;

        match resp.kvs().first() {
            Some(kv) => Ok(Some(
                kv.value_str()
                    .map_err(|e| anyhow!("alias value not utf8: {e}"))?
                    .to_string(),
            )),
            None => Ok(None),
        }
    }

    async fn publish_alias(&self, alias: &str, pubkey: &str) -> Result<()> {
        let ops = vec![
            TxnOp::put(format!("{ALIASES_PREFIX}{alias}"), pubkey, None),
            TxnOp::put(format!("{PEERS_PREFIX}{pubkey}/alias"), alias, None),
        ];
        let mut client = self.client.clone();
        timeout(WRITE_DEADLINE, client.txn(Txn::new().and_then(ops)))
            .await
            .context("etcd alias txn deadline exceeded")?
            .context("etcd alias txn failed")?;
        Ok(())
    }

    async fn fetch_peer(&self, pubkey: &str) -> Result<Option<PeerInfo>> {
        let mut client = self.client.clone();
        let prefix = format!("{PEERS_PREFIX}{pubkey}/");
        let resp = timeout(
            READ_DEADLINE,
            client.get(prefix, Some(GetOptions::new().with_prefix())),
        )
        .await
        .context("etcd peer read deadline exceeded")?
        .context("etcd peer read failed")?;

        if resp.kvs().is_empty() {
            return Ok(None);
        }

        let entries: Vec<(String, String)> = resp
            .kvs()
            .iter()
            .filter_map(|kv| match (kv.key_str(), kv.value_str()) {
                (Ok(k), Ok(v)) => Some((k.to_string(), v.to_string())),
                _ => None,
            })
            .collect();

        Ok(assemble_peers(&entries).into_iter().next())
    }

    async fn remove_peer(&self, pubkey: &str, alias: Option<&str>) -> Result<()> {
        let mut client = self.client.clone();

        timeout(
            WRITE_DEADLINE,
            client.delete(
                format!("{PEERS_PREFIX}{pubkey}/"),
                Some(DeleteOptions::new().with_prefix()),
            ),
        )
        .await
        .context("etcd delete deadline exceeded")?
        .context("etcd peer delete failed")?;

        if let Some(alias) = alias {
            timeout(
                WRITE_DEADLINE,
                client.delete(format!("{ALIASES_PREFIX}{alias}"), None),
            )
            .await
            .context("etcd delete deadline exceeded")?
            .context("etcd alias delete failed")?;
        }
        Ok(())
    }
}

/// Split a key relative to `/valon/peers/` into `(pubkey, field)`. The
/// pubkey segment may itself contain `/`, so the field suffix is located
/// by pattern, not by separator.
fn split_peer_key(rel: &str) -> Option<(&str, &str)> {
    for field in ["/overlay_ip", "/endpoints/", "/alias"] {
        if let Some(idx) = rel.find(field) {
            return Some((&rel[..idx], &rel[idx + 1..]));
        }
    }
    None
}

/// Group raw `(key, value)` pairs into one clean `PeerInfo` per public key.
/// Malformed keys and unparseable values are logged and skipped; a public
/// key that does not decode to 32 bytes drops the whole record.
fn assemble_peers(entries: &[(String, String)]) -> Vec<PeerInfo> {
    use std::collections::BTreeMap;

    let mut peers: BTreeMap<String, PeerInfo> = BTreeMap::new();

    for (key, value) in entries {
        let rel = match key.strip_prefix(PEERS_PREFIX) {
            Some(r) => r,
            None => continue,
        };
        let (pubkey, field) = match split_peer_key(rel) {
            Some(p) => p,
            None => {
                tracing::warn!(key, "unrecognized peer key, skipping");
                continue;
            }
        };
        if valon_core::key_to_label(pubkey).is_err() {
            tracing::warn!(pubkey, "malformed public key in store, skipping record");
            continue;
        }

        let peer = peers
            .entry(pubkey.to_string())
            .or_insert_with(|| PeerInfo::new(pubkey));

        match field {
            "overlay_ip" => match value.parse() {
                Ok(ip) => peer.overlay_ip = Some(ip),
                Err(_) => tracing::warn!(pubkey, value, "bad overlay_ip value"),
            },
            "endpoints/lan" => match value.parse() {
                Ok(ep) => peer.lan_endpoint = Some(ep),
                Err(_) => tracing::warn!(pubkey, value, "bad lan endpoint value"),
            },
            "endpoints/nated" => match value.parse() {
                Ok(ep) => peer.nat_endpoint = Some(ep),
                Err(_) => tracing::warn!(pubkey, value, "bad nat endpoint value"),
            },
            "alias" => peer.alias = Some(value.clone()),
            other => tracing::debug!(pubkey, field = other, "ignoring unknown peer field"),
        }
    }

    peers.into_values().collect()
}
