//! Network configuration context for the blast pipeline.
//!
//! This module provides [`NetworkContext`] which bundles network configuration
//! used across the pipeline: the primary LAN interface, the clip server's
//! bound port, and the network signature that drives discovery-cache
//! invalidation.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use local_ip_address::list_afinet_netifas;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::protocol_constants::CLIP_PATH;

/// Virtual interface prefixes to filter out during detection and discovery.
pub const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &[
    "lo", "docker", "veth", "br-", "virbr", "vmnet", "vbox", "tun", "tap",
];

/// Checks if an interface name belongs to a virtual/container interface.
pub fn is_virtual_interface(name: &str) -> bool {
    let name_lower = name.to_lowercase();
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name_lower.starts_with(prefix))
}

/// The host's primary LAN attachment: a non-loopback IPv4 and its interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInterface {
    /// IPv4 address renderers can reach us at.
    pub ip: Ipv4Addr,
    /// Interface name (e.g., "en0", "eth0").
    pub name: String,
}

/// Identifier summarizing the host's current LAN attachment.
///
/// Two signatures compare equal iff the host is (as far as we can tell) on
/// the same network. A signature change invalidates the discovery cache and
/// triggers pipeline recovery mid-blast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSignature {
    /// Primary non-loopback IPv4 address.
    pub primary_ipv4: Ipv4Addr,
    /// Name of the interface carrying that address.
    pub iface_name: String,
    /// Wi-Fi SSID when the host runtime can supply one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
}

impl NetworkSignature {
    /// Builds a signature from a detected primary interface (no SSID).
    #[must_use]
    pub fn from_interface(iface: &PrimaryInterface) -> Self {
        Self {
            primary_ipv4: iface.ip,
            iface_name: iface.name.clone(),
            ssid: None,
        }
    }
}

impl std::fmt::Display for NetworkSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ssid {
            Some(ssid) => write!(f, "{}/{}/{}", self.iface_name, self.primary_ipv4, ssid),
            None => write!(f, "{}/{}", self.iface_name, self.primary_ipv4),
        }
    }
}

/// Trait for detecting the host's primary LAN interface.
///
/// Different environments need different detection strategies; this trait
/// allows injecting the appropriate detector (and a fixed one in tests).
pub trait IpDetector: Send + Sync {
    /// Detects the primary non-loopback IPv4 interface.
    fn detect(&self) -> Result<PrimaryInterface, NetworkError>;
}

/// Default IP detector using the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Creates a new `LocalIpDetector`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a new `LocalIpDetector` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> Arc<dyn IpDetector> {
        Arc::new(Self::new())
    }
}

impl IpDetector for LocalIpDetector {
    fn detect(&self) -> Result<PrimaryInterface, NetworkError> {
        let primary = local_ip_address::local_ip()
            .map_err(|e| NetworkError::Detection(e.to_string()))?;
        let IpAddr::V4(ip) = primary else {
            return Err(NetworkError::Detection(
                "primary address is IPv6; renderers require IPv4".into(),
            ));
        };
        if ip.is_loopback() {
            return Err(NetworkError::NoInterface);
        }

        // Resolve the interface name carrying the primary address. Falls back
        // to the first non-virtual IPv4 interface when the exact match is
        // missing (some platforms report aliases).
        let netifas =
            list_afinet_netifas().map_err(|e| NetworkError::Detection(e.to_string()))?;
        let name = netifas
            .iter()
            .find(|(name, addr)| !is_virtual_interface(name) && *addr == IpAddr::V4(ip))
            .or_else(|| {
                netifas.iter().find(|(name, addr)| {
                    !is_virtual_interface(name) && matches!(addr, IpAddr::V4(v4) if !v4.is_loopback())
                })
            })
            .map(|(name, _)| name.clone())
            .ok_or(NetworkError::NoInterface)?;

        Ok(PrimaryInterface { ip, name })
    }
}

/// Errors that can occur during network detection.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect the local IP address.
    #[error("Failed to detect local IP: {0}")]
    Detection(String),

    /// No usable non-loopback IPv4 interface exists.
    #[error("No non-loopback IPv4 interface available")]
    NoInterface,
}

/// Network configuration shared across the pipeline.
///
/// Bundles the detector, the clip server's bound port, and the advertise IP
/// that renderers fetch the clip from.
#[derive(Clone)]
pub struct NetworkContext {
    /// Clip server port (0 until the listener binds).
    pub port: Arc<RwLock<u16>>,
    /// Notifier signaled when the port is assigned.
    pub port_notify: Arc<Notify>,
    /// IP address that renderers can reach us at.
    pub local_ip: Arc<RwLock<Ipv4Addr>>,
    detector: Arc<dyn IpDetector>,
}

impl NetworkContext {
    /// Creates a `NetworkContext` with the given detector.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial interface detection fails.
    pub fn new(detector: Arc<dyn IpDetector>) -> Result<Self, NetworkError> {
        let iface = detector.detect()?;
        Ok(Self {
            port: Arc::new(RwLock::new(0)),
            port_notify: Arc::new(Notify::new()),
            local_ip: Arc::new(RwLock::new(iface.ip)),
            detector,
        })
    }

    /// Creates a `NetworkContext` for testing with a fixed loopback address.
    #[cfg(test)]
    pub fn for_test() -> Self {
        struct Fixed;
        impl IpDetector for Fixed {
            fn detect(&self) -> Result<PrimaryInterface, NetworkError> {
                Ok(PrimaryInterface {
                    ip: Ipv4Addr::new(127, 0, 0, 1),
                    name: "lo0".into(),
                })
            }
        }
        Self::new(Arc::new(Fixed)).expect("fixed detector cannot fail")
    }

    /// Re-detects the primary interface and returns the current signature.
    pub fn current_signature(&self) -> Result<NetworkSignature, NetworkError> {
        let iface = self.detector.detect()?;
        *self.local_ip.write() = iface.ip;
        Ok(NetworkSignature::from_interface(&iface))
    }

    /// Returns the current port value.
    #[must_use]
    pub fn get_port(&self) -> u16 {
        *self.port.read()
    }

    /// Returns the current local IP.
    #[must_use]
    pub fn get_local_ip(&self) -> Ipv4Addr {
        *self.local_ip.read()
    }

    /// Sets the port and notifies waiters.
    pub fn set_port(&self, port: u16) {
        *self.port.write() = port;
        self.port_notify.notify_waiters();
    }

    /// Returns a `UrlBuilder` for the current network configuration.
    #[must_use]
    pub fn url_builder(&self) -> UrlBuilder {
        UrlBuilder::new(self.get_local_ip().to_string(), self.get_port())
    }

    /// Returns the clip URL renderers are pointed at.
    #[must_use]
    pub fn clip_url(&self) -> String {
        self.url_builder().clip_url()
    }
}

/// Builder for constructing URLs for the clip server.
pub struct UrlBuilder {
    ip: String,
    port: u16,
}

impl UrlBuilder {
    /// Creates a new `UrlBuilder` for the given server address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Returns the base URL for the server (e.g., `http://192.168.1.100:8080`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Returns the stable clip URL. The path never changes across hot-swaps.
    #[must_use]
    pub fn clip_url(&self) -> String {
        format!("{}{}", self.base_url(), CLIP_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockIpDetector {
        ip: Ipv4Addr,
        name: &'static str,
    }

    impl IpDetector for MockIpDetector {
        fn detect(&self) -> Result<PrimaryInterface, NetworkError> {
            Ok(PrimaryInterface {
                ip: self.ip,
                name: self.name.to_string(),
            })
        }
    }

    #[test]
    fn context_uses_detector() {
        let detector = Arc::new(MockIpDetector {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            name: "en0",
        });
        let ctx = NetworkContext::new(detector).unwrap();
        assert_eq!(ctx.get_local_ip(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ctx.get_port(), 0);
    }

    #[test]
    fn url_builder_generates_clip_url() {
        let builder = UrlBuilder::new("192.168.1.100", 8080);
        assert_eq!(builder.base_url(), "http://192.168.1.100:8080");
        assert_eq!(builder.clip_url(), "http://192.168.1.100:8080/media/current");
    }

    #[test]
    fn clip_path_stable_after_port_change() {
        let ctx = NetworkContext::for_test();
        ctx.set_port(4242);
        assert!(ctx.clip_url().ends_with(":4242/media/current"));
        ctx.set_port(9999);
        assert!(ctx.clip_url().ends_with(":9999/media/current"));
    }

    #[test]
    fn signature_equality_tracks_interface() {
        let a = NetworkSignature {
            primary_ipv4: Ipv4Addr::new(192, 168, 1, 10),
            iface_name: "en0".into(),
            ssid: None,
        };
        let b = NetworkSignature {
            primary_ipv4: Ipv4Addr::new(192, 168, 1, 10),
            iface_name: "en0".into(),
            ssid: None,
        };
        let c = NetworkSignature {
            primary_ipv4: Ipv4Addr::new(10, 0, 0, 3),
            iface_name: "en0".into(),
            ssid: None,
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn signature_includes_ssid_when_present() {
        let iface = PrimaryInterface {
            ip: Ipv4Addr::new(192, 168, 1, 10),
            name: "wlan0".into(),
        };
        let mut sig = NetworkSignature::from_interface(&iface);
        assert_eq!(sig.to_string(), "wlan0/192.168.1.10");
        sig.ssid = Some("HomeNet".into());
        assert_eq!(sig.to_string(), "wlan0/192.168.1.10/HomeNet");
    }

    #[test]
    fn test_is_virtual_interface() {
        assert!(is_virtual_interface("lo"));
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("veth1234"));
        assert!(is_virtual_interface("br-abc"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("en0"));
        assert!(!is_virtual_interface("wlan0"));
    }
}
