//! valond — VALON discovery daemon.
//!
//! Startup order matters: the KV loader fills the cache before the syncer
//! starts (so the first sync tick cannot race a half-loaded cache), and
//! self-registration runs before the servers so the administrative identity
//! is known from the first request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use valon_api::ApiState;
use valon_core::ValonConfig;
use valon_dns::DnsHandler;
use valon_services::{bootstrap, poll, sync, KvStore, PeerCache, WgDevice};

/// How long in-flight requests get after the loops have drained.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ValonConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    tracing::info!(
        zone = %config.zone,
        etcd = ?config.etcd_endpoints,
        interface = %config.wg_interface,
        "valond starting"
    );

    let kv = KvStore::connect(&config.etcd_endpoints)
        .await
        .context("kv store unreachable")?;
    kv.probe().await;

    let cache = PeerCache::new();
    bootstrap::load_cache(&cache, &kv).await;

    let device = WgDevice::new(&config.wg_interface);
    if let Err(e) = bootstrap::restore_device_peers(&cache, &device).await {
        tracing::warn!(error = %e, "wireguard restore incomplete, continuing");
    }

    // Fatal when the interface is absent: this node cannot serve a mesh it
    // is not part of.
    let (_self_key, self_overlay_ip) = bootstrap::register_self(&cache, &device).await?;

    let (stop_tx, stop_rx) = watch::channel(false);

    let poller = tokio::spawn(poll::run(
        cache.clone(),
        kv.clone(),
        device.clone(),
        config.wg_poll_interval,
        stop_rx.clone(),
    ));
    let syncer = tokio::spawn(sync::run(
        cache.clone(),
        kv.clone(),
        config.etcd_sync_interval,
        stop_rx,
    ));

    let api_listener = TcpListener::bind(config.ddns_listen)
        .await
        .with_context(|| format!("failed to bind http api on {}", config.ddns_listen))?;
    let api_state = ApiState {
        cache: cache.clone(),
        directory: Arc::new(kv.clone()),
        self_overlay_ip,
    };
    let mut api_task = tokio::spawn(async move {
        if let Err(e) = valon_api::serve(api_state, api_listener).await {
            tracing::error!(error = %e, "endpoint api failed");
        }
    });

    let dns_socket = UdpSocket::bind(config.dns_listen)
        .await
        .with_context(|| format!("failed to bind dns on {}", config.dns_listen))?;
    tracing::info!(addr = %config.dns_listen, zone = %config.zone, "dns listening");
    let dns_handler = DnsHandler::new(cache.clone(), Arc::new(kv.clone()), &config.zone);
    let mut dns_task = tokio::spawn(valon_dns::serve(dns_handler, dns_socket));

    tracing::info!(peers = cache.count(), "valond serving");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        r = &mut api_task => {
            tracing::error!("endpoint api exited: {r:?}");
        }
        r = &mut dns_task => {
            tracing::error!("dns server exited: {r:?}");
        }
    }

    // Drain: the loops observe the stop channel between ticks (the syncer
    // flushes once more), then the servers are cut.
    let _ = stop_tx.send(true);
    let _ = poller.await;
    let _ = syncer.await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    api_task.abort();
    dns_task.abort();

    tracing::info!("valond stopped");
    Ok(())
}
