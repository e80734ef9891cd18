//! Local WireGuard device access.
//!
//! The kernel is read through the WireGuard control interface; reads and
//! writes are synchronous netlink calls, so they run under `spawn_blocking`.
//! Keys cross this boundary as base64 strings — the rest of the daemon never
//! sees raw key bytes.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

const BACKEND: Backend = Backend::Kernel;

/// One peer as seen in a single read of the device.
#[derive(Debug, Clone)]
pub struct WgObservation {
    /// Base64 public key.
    pub public_key: String,
    /// First IPv4 allowed-ip — by mesh convention each peer is allowed
    /// exactly its overlay /32.
    pub overlay_ip: Option<Ipv4Addr>,
    /// Remote endpoint the kernel used for the last handshake.
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
}

/// Handle on the configured WireGuard device.
#[derive(Clone)]
pub struct WgDevice {
    interface: String,
}

impl WgDevice {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn ifname(&self) -> Result<InterfaceName> {
        self.interface
            .parse()
            .map_err(|e| anyhow!("invalid interface name {:?}: {e}", self.interface))
    }

    /// Read the device and return one observation per kernel peer.
    pub async fn observations(&self) -> Result<Vec<WgObservation>> {
        let ifname = self.ifname()?;
        let device = tokio::task::spawn_blocking(move || Device::get(&ifname, BACKEND))
            .await
            .context("wireguard read task failed")?
            .context("failed to read wireguard device")?;

        Ok(device
            .peers
            .iter()
            .map(|peer| WgObservation {
                public_key: peer.config.public_key.to_base64(),
                overlay_ip: peer.config.allowed_ips.iter().find_map(|ip| match ip.address {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                }),
                endpoint: peer.config.endpoint,
                last_handshake: peer.stats.last_handshake_time,
            })
            .collect())
    }

    /// Base64 public keys currently installed on the device.
    pub async fn installed_keys(&self) -> Result<HashSet<String>> {
        Ok(self
            .observations()
            .await?
            .into_iter()
            .map(|o| o.public_key)
            .collect())
    }

    /// This node's own identity: device public key plus the interface's
    /// first IPv4 address. Fails when the interface is missing — the daemon
    /// cannot serve a mesh it is not part of.
    pub async fn self_identity(&self) -> Result<(String, Ipv4Addr)> {
        let ifname = self.ifname()?;
        let device = tokio::task::spawn_blocking(move || Device::get(&ifname, BACKEND))
            .await
            .context("wireguard read task failed")?
            .with_context(|| format!("wireguard interface {:?} not found", self.interface))?;

        let public_key = device
            .public_key
            .map(|k| k.to_base64())
            .ok_or_else(|| anyhow!("device {:?} has no public key", self.interface))?;

        let overlay_ip = interface_ipv4(&self.interface)?;
        Ok((public_key, overlay_ip))
    }

    /// Install a peer with `allowed_ips = overlay_ip/32` and no endpoint
    /// override; the kernel rediscovers underlay endpoints on the next
    /// handshake.
    pub async fn install_peer(&self, pubkey: &str, overlay_ip: Ipv4Addr) -> Result<()> {
        let key = Key::from_base64(pubkey)
            .map_err(|_| anyhow!("invalid base64 public key: {pubkey:?}"))?;
        let ifname = self.ifname()?;

        tokio::task::spawn_blocking(move || {
            DeviceUpdate::new()
                .add_peer(
                    PeerConfigBuilder::new(&key).add_allowed_ip(IpAddr::V4(overlay_ip), 32),
                )
                .apply(&ifname, BACKEND)
        })
        .await
        .context("wireguard write task failed")?
        .context("failed to install wireguard peer")?;
        Ok(())
    }
}

/// First IPv4 address on a named interface.
fn interface_ipv4(interface: &str) -> Result<Ipv4Addr> {
    let addrs = if_addrs::get_if_addrs().context("failed to enumerate interfaces")?;
    for iface in addrs {
        if iface.name != interface {
            continue;
        }
        if let IpAddr::V4(v4) = iface.ip() {
            return Ok(v4);
        }
    }
    bail!("no IPv4 address found on interface {interface:?}")
}
