//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use clipcast_core::{BlastConfig, DiscoveryMethods};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Wall-clock budget for the discovery window (ms).
    /// Override: `CLIPCAST_DISCOVERY_TIMEOUT_MS`
    pub discovery_timeout_ms: u64,

    /// Per-SOAP-call timeout (ms).
    /// Override: `CLIPCAST_SOAP_TIMEOUT_MS`
    pub soap_timeout_ms: u64,

    /// Concurrent control tasks.
    /// Override: `CLIPCAST_FANOUT`
    pub fanout_parallelism: usize,

    /// Enable SSDP multicast discovery.
    pub discovery_ssdp: bool,

    /// Enable mDNS/DNS-SD discovery.
    pub discovery_mdns: bool,

    /// Enable the TCP subnet port scan.
    pub discovery_port_scan: bool,

    /// Serve cached discovery results on an unchanged network.
    pub enable_discovery_cache: bool,

    /// TTL for cached discovery results (ms).
    pub discovery_cache_ttl_ms: u64,

    /// Port scan: emit one renderer per open port instead of per host.
    pub emit_all_open_ports: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = BlastConfig::default();
        Self {
            discovery_timeout_ms: defaults.discovery_timeout_ms,
            soap_timeout_ms: defaults.soap_timeout_ms,
            fanout_parallelism: defaults.fanout_parallelism,
            discovery_ssdp: true,
            discovery_mdns: true,
            discovery_port_scan: true,
            enable_discovery_cache: defaults.enable_discovery_cache,
            discovery_cache_ttl_ms: defaults.discovery_cache_ttl_ms,
            emit_all_open_ports: defaults.emit_all_open_ports,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CLIPCAST_DISCOVERY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.discovery_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CLIPCAST_SOAP_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.soap_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CLIPCAST_FANOUT") {
            if let Ok(n) = val.parse() {
                self.fanout_parallelism = n;
            }
        }
    }

    /// Converts to clipcast-core's blast configuration.
    pub fn to_blast_config(&self) -> BlastConfig {
        BlastConfig {
            discovery_timeout_ms: self.discovery_timeout_ms,
            soap_timeout_ms: self.soap_timeout_ms,
            fanout_parallelism: self.fanout_parallelism,
            discovery_methods: DiscoveryMethods {
                ssdp: self.discovery_ssdp,
                mdns: self.discovery_mdns,
                port_scan: self.discovery_port_scan,
            },
            enable_discovery_cache: self.enable_discovery_cache,
            discovery_cache_ttl_ms: self.discovery_cache_ttl_ms,
            emit_all_open_ports: self.emit_all_open_ports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_blast_defaults() {
        let config = ServerConfig::default();
        let blast = config.to_blast_config();
        assert_eq!(blast.discovery_timeout_ms, 4000);
        assert_eq!(blast.soap_timeout_ms, 5000);
        assert_eq!(blast.fanout_parallelism, 3);
        assert!(blast.discovery_methods.ssdp);
        assert!(blast.discovery_methods.mdns);
        assert!(blast.discovery_methods.port_scan);
        assert!(!blast.enable_discovery_cache);
    }

    #[test]
    fn loads_yaml_with_partial_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "discovery_timeout_ms: 2500\ndiscovery_port_scan: false\nfanout_parallelism: 8"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.discovery_timeout_ms, 2500);
        assert!(!config.discovery_port_scan);
        assert_eq!(config.fanout_parallelism, 8);
        // Unspecified keys keep their defaults.
        assert!(config.discovery_ssdp);
        assert_eq!(config.soap_timeout_ms, 5000);
    }

    #[test]
    fn rejects_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "discovery_timeout_ms: [not a number]").unwrap();
        assert!(ServerConfig::load(Some(file.path())).is_err());
    }
}
