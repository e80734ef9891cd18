//! Endpoint-update API handlers.
//!
//! Authorization is source-IP only: the WireGuard kernel already guarantees
//! that a packet carrying overlay IP X came from the peer holding X's
//! private key, so a peer may update exactly its own record and the
//! daemon's own address acts as the administrative identity. Forwarding
//! headers are deliberately ignored.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use valon_services::peer::parse_lan_endpoint;
use valon_services::{PeerCache, PeerDirectory};

/// Aliases are user-facing DNS labels; keep them short.
const MAX_ALIAS_LEN: usize = 32;

/// Leading strings that collide with the zone grammar.
const RESERVED_ALIAS_PREFIXES: [&str; 4] = ["lan", "nated", "_wireguard", "_udp"];

#[derive(Clone)]
pub struct ApiState {
    pub cache: PeerCache,
    pub directory: Arc<dyn PeerDirectory>,
    /// This node's own overlay address — the administrative identity.
    pub self_overlay_ip: Ipv4Addr,
}

#[derive(Deserialize)]
pub struct EndpointUpdate {
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub lan_endpoint: String,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Deserialize)]
pub struct EndpointDelete {
    #[serde(default)]
    pub pubkey: String,
}

#[derive(Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    fn ok(message: &str) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                message: Some(message.to_string()),
            }),
        )
    }

    fn err(status: StatusCode, message: &str) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                message: Some(message.to_string()),
            }),
        )
    }
}

// ── POST /api/endpoint ────────────────────────────────────────────────────────

pub async fn handle_endpoint_update(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<EndpointUpdate>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.pubkey.is_empty() {
        return ApiResponse::err(StatusCode::BAD_REQUEST, "pubkey is required");
    }

    let client_ip = match client_v4(&remote) {
        Some(ip) => ip,
        None => {
            return ApiResponse::err(StatusCode::FORBIDDEN, "requests must come from the overlay")
        }
    };
    if !authorized(&state, client_ip, &req.pubkey) {
        tracing::warn!(%client_ip, pubkey = %req.pubkey, "endpoint update rejected");
        return ApiResponse::err(StatusCode::FORBIDDEN, "not authorized to modify this peer");
    }

    let lan_endpoint = match parse_lan_endpoint(&req.lan_endpoint) {
        Ok(ep) => ep,
        Err(_) => {
            return ApiResponse::err(
                StatusCode::BAD_REQUEST,
                "invalid lan_endpoint format (expected IP:port)",
            )
        }
    };

    let alias = match req.alias.as_deref().filter(|a| !a.is_empty()) {
        Some(raw) => match validate_alias(raw) {
            Ok(a) => Some(a),
            Err(reason) => return ApiResponse::err(StatusCode::BAD_REQUEST, reason),
        },
        None => None,
    };

    state.cache.update(&req.pubkey, |peer| {
        peer.lan_endpoint = lan_endpoint;
        if let Some(a) = &alias {
            peer.alias = Some(a.clone());
        }
    });

    match lan_endpoint {
        Some(ep) => tracing::info!(pubkey = %req.pubkey, endpoint = %ep, "lan endpoint updated"),
        None => tracing::info!(pubkey = %req.pubkey, "peer went offline"),
    }

    if let Some(alias) = &alias {
        // Alias rows are written inline so DNS CNAME resolution is
        // consistent the moment this request returns.
        if let Err(e) = state.directory.publish_alias(alias, &req.pubkey).await {
            tracing::warn!(alias, error = %e, "alias write failed");
            return ApiResponse::err(
                StatusCode::INTERNAL_SERVER_ERROR,
                "endpoint updated, but alias could not be stored",
            );
        }
        tracing::info!(alias, pubkey = %req.pubkey, "alias registered");
    }

    ApiResponse::ok("endpoint updated")
}

// ── POST|DELETE /api/endpoint/delete ──────────────────────────────────────────

pub async fn handle_endpoint_delete(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<EndpointDelete>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.pubkey.is_empty() {
        return ApiResponse::err(StatusCode::BAD_REQUEST, "pubkey is required");
    }
    if client_v4(&remote) != Some(state.self_overlay_ip) {
        tracing::warn!(remote = %remote, "delete rejected, administrative only");
        return ApiResponse::err(StatusCode::FORBIDDEN, "only the discovery node can delete peers");
    }

    let alias = state.cache.get(&req.pubkey).and_then(|p| p.alias);
    state.cache.delete(&req.pubkey);

    if let Err(e) = state
        .directory
        .remove_peer(&req.pubkey, alias.as_deref())
        .await
    {
        tracing::warn!(pubkey = %req.pubkey, error = %e, "store delete failed");
        return ApiResponse::err(
            StatusCode::INTERNAL_SERVER_ERROR,
            "peer removed from cache, but store delete failed",
        );
    }

    tracing::info!(pubkey = %req.pubkey, "peer deleted");
    ApiResponse::ok("peer deleted")
}

// ── wrong method ──────────────────────────────────────────────────────────────

/// Every error leaves this API as the same JSON envelope, including a
/// request with the wrong verb.
pub async fn handle_method_not_allowed() -> (StatusCode, Json<ApiResponse>) {
    ApiResponse::err(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

// ── GET /health ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub peers_count: usize,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        peers_count: state.cache.count(),
    })
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn client_v4(remote: &SocketAddr) -> Option<Ipv4Addr> {
    match remote.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

/// A request may modify a record iff it comes from this node itself
/// (administrative) or from the overlay IP of the peer being modified.
fn authorized(state: &ApiState, client_ip: Ipv4Addr, pubkey: &str) -> bool {
    if client_ip == state.self_overlay_ip {
        return true;
    }
    state
        .cache
        .get(pubkey)
        .and_then(|p| p.overlay_ip)
        .map(|ip| ip == client_ip)
        .unwrap_or(false)
}

/// Validate and canonicalize an alias: lowercase letters, digits and
/// inner hyphens, at most 32 characters, and not shadowing the zone
/// grammar's reserved prefixes.
fn validate_alias(raw: &str) -> Result<String, &'static str> {
    let alias = raw.to_ascii_lowercase();

    if alias.len() > MAX_ALIAS_LEN {
        return Err("alias too long (max 32 characters)");
    }
    if !alias
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("alias may only contain letters, digits and hyphens");
    }
    if alias.starts_with('-') || alias.ends_with('-') {
        return Err("alias may not start or end with a hyphen");
    }
    if alias.contains("--") {
        return Err("alias may not contain consecutive hyphens");
    }
    for prefix in RESERVED_ALIAS_PREFIXES {
        if alias.starts_with(prefix) {
            return Err("alias starts with a reserved prefix");
        }
    }
    Ok(alias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::sync::Mutex;
    use valon_services::PeerInfo;

    #[derive(Default)]
    struct RecordingDirectory {
        aliases: Mutex<Vec<(String, String)>>,
        removed: Mutex<Vec<(String, Option<String>)>>,
        failing: bool,
    }

    #[async_trait]
    impl PeerDirectory for RecordingDirectory {
        async fn alias_target(&self, _alias: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn publish_alias(&self, alias: &str, pubkey: &str) -> anyhow::Result<()> {
            if self.failing {
                anyhow::bail!("store unavailable");
            }
            self.aliases
                .lock()
                .unwrap()
                .push((alias.to_string(), pubkey.to_string()));
            Ok(())
        }

        async fn fetch_peer(&self, _pubkey: &str) -> anyhow::Result<Option<PeerInfo>> {
            Ok(None)
        }

        async fn remove_peer(&self, pubkey: &str, alias: Option<&str>) -> anyhow::Result<()> {
            if self.failing {
                anyhow::bail!("store unavailable");
            }
            self.removed
                .lock()
                .unwrap()
                .push((pubkey.to_string(), alias.map(str::to_string)));
            Ok(())
        }
    }

    const SELF_IP: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 1);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 5);

    fn sample_key(seed: u8) -> String {
        BASE64.encode((0..32).map(|i| seed.wrapping_add(i)).collect::<Vec<u8>>())
    }

    fn state_with_peer(key: &str) -> (ApiState, Arc<RecordingDirectory>) {
        let cache = PeerCache::new();
        let mut peer = PeerInfo::new(key);
        peer.overlay_ip = Some(PEER_IP);
        cache.set(key, peer);

        let directory = Arc::new(RecordingDirectory::default());
        let state = ApiState {
            cache,
            directory: directory.clone(),
            self_overlay_ip: SELF_IP,
        };
        (state, directory)
    }

    fn from_ip(ip: Ipv4Addr) -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::new(IpAddr::V4(ip), 40000))
    }

    fn update(pubkey: &str, lan: &str, alias: Option<&str>) -> Json<EndpointUpdate> {
        Json(EndpointUpdate {
            pubkey: pubkey.to_string(),
            lan_endpoint: lan.to_string(),
            alias: alias.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn peer_updates_its_own_record() {
        let key = sample_key(1);
        let (state, _) = state_with_peer(&key);

        let (status, Json(resp)) = handle_endpoint_update(
            State(state.clone()),
            from_ip(PEER_IP),
            update(&key, "192.168.1.7:51820", None),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(resp.success);
        let peer = state.cache.get(&key).unwrap();
        assert_eq!(peer.lan_endpoint, Some("192.168.1.7:51820".parse().unwrap()));
        assert!(peer.is_dirty());
    }

    #[tokio::test]
    async fn sentinel_clears_lan_endpoint() {
        let key = sample_key(2);
        let (state, _) = state_with_peer(&key);

        handle_endpoint_update(
            State(state.clone()),
            from_ip(PEER_IP),
            update(&key, "192.168.1.7:51820", None),
        )
        .await;
        assert!(state.cache.get(&key).unwrap().lan_endpoint.is_some());

        let (status, _) = handle_endpoint_update(
            State(state.clone()),
            from_ip(PEER_IP),
            update(&key, "0.0.0.0:0", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.cache.get(&key).unwrap().lan_endpoint.is_none());
    }

    #[tokio::test]
    async fn stranger_is_denied_and_cache_untouched() {
        let key = sample_key(3);
        let (state, _) = state_with_peer(&key);
        let before = state.cache.get(&key).unwrap();

        let (status, Json(resp)) = handle_endpoint_update(
            State(state.clone()),
            from_ip(Ipv4Addr::new(198, 51, 100, 4)),
            update(&key, "192.168.1.7:51820", None),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!resp.success);
        assert_eq!(state.cache.get(&key).unwrap(), before);
    }

    #[tokio::test]
    async fn admin_may_update_any_peer() {
        let key = sample_key(4);
        let (state, _) = state_with_peer(&key);

        let (status, _) = handle_endpoint_update(
            State(state.clone()),
            from_ip(SELF_IP),
            update(&key, "192.168.1.7:51820", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_endpoint_is_rejected() {
        let key = sample_key(5);
        let (state, _) = state_with_peer(&key);

        let (status, _) = handle_endpoint_update(
            State(state),
            from_ip(PEER_IP),
            update(&key, "not-an-endpoint", None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_pubkey_is_rejected() {
        let key = sample_key(6);
        let (state, _) = state_with_peer(&key);

        let (status, _) =
            handle_endpoint_update(State(state), from_ip(PEER_IP), update("", "", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn alias_is_stored_and_published() {
        let key = sample_key(7);
        let (state, directory) = state_with_peer(&key);

        let (status, _) = handle_endpoint_update(
            State(state.clone()),
            from_ip(PEER_IP),
            update(&key, "192.168.1.7:51820", Some("Alice")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.cache.get(&key).unwrap().alias.as_deref(), Some("alice"));
        let published = directory.aliases.lock().unwrap();
        assert_eq!(published.as_slice(), &[("alice".to_string(), key.clone())]);
    }

    #[tokio::test]
    async fn alias_write_failure_is_500_but_endpoint_sticks() {
        let key = sample_key(8);
        let cache = PeerCache::new();
        let mut peer = PeerInfo::new(&key);
        peer.overlay_ip = Some(PEER_IP);
        cache.set(&key, peer);
        let state = ApiState {
            cache,
            directory: Arc::new(RecordingDirectory {
                failing: true,
                ..RecordingDirectory::default()
            }),
            self_overlay_ip: SELF_IP,
        };

        let (status, _) = handle_endpoint_update(
            State(state.clone()),
            from_ip(PEER_IP),
            update(&key, "192.168.1.7:51820", Some("alice")),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.cache.get(&key).unwrap().lan_endpoint.is_some());
    }

    #[tokio::test]
    async fn invalid_aliases_are_rejected() {
        let key = sample_key(9);
        let (state, _) = state_with_peer(&key);

        for alias in ["-leading", "trailing-", "dou--ble", "has space", "lan-party"] {
            let (status, _) = handle_endpoint_update(
                State(state.clone()),
                from_ip(PEER_IP),
                update(&key, "192.168.1.7:51820", Some(alias)),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "alias {alias:?} should fail");
        }
    }

    #[tokio::test]
    async fn delete_requires_admin() {
        let key = sample_key(10);
        let (state, _) = state_with_peer(&key);

        let (status, _) = handle_endpoint_delete(
            State(state.clone()),
            from_ip(PEER_IP),
            Json(EndpointDelete { pubkey: key.clone() }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(state.cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn delete_cascades_to_store() {
        let key = sample_key(11);
        let (state, directory) = state_with_peer(&key);
        state.cache.update(&key, |p| p.alias = Some("alice".to_string()));

        let (status, _) = handle_endpoint_delete(
            State(state.clone()),
            from_ip(SELF_IP),
            Json(EndpointDelete { pubkey: key.clone() }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(state.cache.get(&key).is_none());
        let removed = directory.removed.lock().unwrap();
        assert_eq!(
            removed.as_slice(),
            &[(key.clone(), Some("alice".to_string()))]
        );
    }

    #[tokio::test]
    async fn wrong_method_gets_json_envelope() {
        let (status, Json(resp)) = handle_method_not_allowed().await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(!resp.success);
        assert!(resp.message.is_some());
    }

    #[tokio::test]
    async fn health_reports_peer_count() {
        let key = sample_key(12);
        let (state, _) = state_with_peer(&key);

        let Json(health) = handle_health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.peers_count, 1);
    }

    #[test]
    fn alias_validation_accepts_sane_names() {
        assert_eq!(validate_alias("alice").unwrap(), "alice");
        assert_eq!(validate_alias("Alice-Macbook").unwrap(), "alice-macbook");
        assert_eq!(validate_alias("node42").unwrap(), "node42");
    }

    #[test]
    fn alias_validation_rejects_reserved_prefixes() {
        assert!(validate_alias("lan").is_err());
        assert!(validate_alias("nated-box").is_err());
    }
}
