//! Daemon configuration.
//!
//! Loaded from a TOML file with `VALON_*` environment overrides applied on
//! top. Unknown keys are a load error: a typoed directive should stop the
//! daemon at startup, not silently fall back to a default.
//!
//! Config file location:
//!   1. explicit path on the command line
//!   2. /etc/valon/valond.toml
//!   3. compiled-in defaults

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "/etc/valon/valond.toml";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValonConfig {
    /// KV store endpoints.
    pub etcd_endpoints: Vec<String>,
    /// Local WireGuard device to poll and restore peers into.
    pub wg_interface: String,
    /// HTTP endpoint-update API bind address.
    pub ddns_listen: SocketAddr,
    /// DNS UDP bind address.
    pub dns_listen: SocketAddr,
    /// Served zone, with trailing dot.
    pub zone: String,
    /// How often the WireGuard device is read.
    #[serde(with = "humantime_serde")]
    pub wg_poll_interval: Duration,
    /// How often dirty cache entries are written back to the KV store.
    #[serde(with = "humantime_serde")]
    pub etcd_sync_interval: Duration,
}

impl Default for ValonConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            wg_interface: "wg0".to_string(),
            ddns_listen: "127.0.0.1:8080".parse().expect("default listen addr"),
            dns_listen: "0.0.0.0:53".parse().expect("default dns addr"),
            zone: "valon.internal.".to_string(),
            wg_poll_interval: Duration::from_secs(1),
            etcd_sync_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("no etcd endpoints configured")]
    NoEndpoints,
    #[error("wg_interface must not be empty")]
    NoInterface,
    #[error("zone must not be empty")]
    NoZone,
}

impl ValonConfig {
    /// Load config: explicit file (or the default path if present) →
    /// env overrides → validation.
    ///
    /// A missing file at the default path means defaults; a missing file at
    /// an explicitly given path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::read_file(p)?,
            None => {
                let p = Path::new(DEFAULT_CONFIG_PATH);
                if p.exists() {
                    Self::read_file(p)?
                } else {
                    ValonConfig::default()
                }
            }
        };
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Apply VALON_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VALON_ETCD_ENDPOINTS") {
            self.etcd_endpoints = v
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("VALON_WG_INTERFACE") {
            self.wg_interface = v;
        }
        if let Ok(v) = std::env::var("VALON_DDNS_LISTEN") {
            if let Ok(addr) = v.parse() {
                self.ddns_listen = addr;
            }
        }
        if let Ok(v) = std::env::var("VALON_DNS_LISTEN") {
            if let Ok(addr) = v.parse() {
                self.dns_listen = addr;
            }
        }
        if let Ok(v) = std::env::var("VALON_ZONE") {
            self.zone = v;
        }
    }

    /// The zone is matched as a suffix of lowercased query names, so store
    /// it lowercased and dot-terminated.
    fn normalize(&mut self) {
        self.zone = self.zone.to_ascii_lowercase();
        if !self.zone.is_empty() && !self.zone.ends_with('.') {
            self.zone.push('.');
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.etcd_endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.wg_interface.is_empty() {
            return Err(ConfigError::NoInterface);
        }
        if self.zone.is_empty() {
            return Err(ConfigError::NoZone);
        }
        Ok(())
    }
}
