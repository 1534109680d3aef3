//! Shared types for renderer discovery.
//!
//! This module contains types used across all discovery methods (SSDP, mDNS,
//! port scan) and the bus that merges their results.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use thiserror::Error;

use crate::utils::contains_ignore_ascii_case;

/// Discovery method identifier for tracking which method found each renderer.
///
/// Ordering matters: when the same `ip:port` is reported by several methods,
/// fields from the higher-precedence source win (Ssdp > Mdns > PortScan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoverySource {
    /// SSDP multicast M-SEARCH to 239.255.255.250:1900.
    Ssdp,
    /// mDNS/DNS-SD service browsing.
    Mdns,
    /// TCP port scan of the primary /24 subnet.
    PortScan,
}

impl DiscoverySource {
    /// Merge precedence; higher wins field-by-field on dedup collisions.
    #[must_use]
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Ssdp => 2,
            Self::Mdns => 1,
            Self::PortScan => 0,
        }
    }
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssdp => write!(f, "SSDP"),
            Self::Mdns => write!(f, "mDNS"),
            Self::PortScan => write!(f, "port-scan"),
        }
    }
}

/// Device class of a discovered renderer.
///
/// `Chromecast` and `AirPlay` devices are discovered and reported but are not
/// controllable over UPnP AVTransport; control tasks skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RendererKind {
    /// Sonos ZonePlayer (controllable, returns 403 on root probes).
    Sonos,
    /// Google Cast device (reported, not controllable by this core).
    Chromecast,
    /// DLNA media renderer.
    Dlna,
    /// Roku device (ECP on port 8060).
    Roku,
    /// AirPlay/RAOP device (reported, not controllable by this core).
    AirPlay,
    /// Any other UPnP root device.
    GenericUpnp,
    /// Nothing recognizable yet.
    Unknown,
}

impl RendererKind {
    /// Whether this kind accepts the AVTransport SetURI/Play sequence.
    #[must_use]
    pub fn is_controllable(&self) -> bool {
        !matches!(self, Self::Chromecast | Self::AirPlay)
    }

    /// Control path used when the device description yields none.
    #[must_use]
    pub fn fallback_control_path(&self) -> &'static str {
        match self {
            Self::Sonos => "/MediaRenderer/AVTransport/Control",
            // Reported for visibility; not an AVTransport endpoint.
            Self::Chromecast => "/setup/eureka_info",
            Self::Roku => "/keypress/Home",
            Self::AirPlay => "/",
            Self::Dlna | Self::GenericUpnp | Self::Unknown => "/upnp/control/AVTransport1",
        }
    }

    /// Well-known control port for kinds that have one.
    #[must_use]
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Sonos => Some(1400),
            Self::Chromecast => Some(8008),
            _ => None,
        }
    }

    /// Classifies a kind from free-form discovery text.
    ///
    /// The text is the concatenation of whatever is available: SSDP SERVER and
    /// USN headers, the LOCATION URL, and the device description body.
    #[must_use]
    pub fn classify(text: &str) -> Self {
        if contains_ignore_ascii_case(text, "sonos") {
            Self::Sonos
        } else if contains_ignore_ascii_case(text, "chromecast")
            || contains_ignore_ascii_case(text, "cast")
        {
            Self::Chromecast
        } else if contains_ignore_ascii_case(text, "roku") {
            Self::Roku
        } else if contains_ignore_ascii_case(text, "dlna") {
            Self::Dlna
        } else {
            Self::GenericUpnp
        }
    }

    /// Best-effort kind from an open TCP port (port-scan heuristics).
    #[must_use]
    pub fn from_port(port: u16) -> Self {
        match port {
            1400..=1410 => Self::Sonos,
            8008..=8010 => Self::Chromecast,
            8060 => Self::Roku,
            5000 | 7000 | 7100 => Self::AirPlay,
            8200..=8205 | 8873 | 50002 => Self::Dlna,
            _ => Self::GenericUpnp,
        }
    }

    /// Human-readable label used when synthesizing friendly names.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sonos => "Sonos",
            Self::Chromecast => "Chromecast",
            Self::Dlna => "DLNA renderer",
            Self::Roku => "Roku",
            Self::AirPlay => "AirPlay device",
            Self::GenericUpnp => "UPnP device",
            Self::Unknown => "Unknown device",
        }
    }
}

/// An addressable control endpoint discovered on the LAN.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Renderer {
    /// Stable identifier derived from `ip:port`; dedup key within a blast.
    pub id: String,
    /// Best available display name (XML > SSDP SERVER header > synthesized).
    pub friendly_name: String,
    /// IPv4 address of the renderer.
    pub ip: Ipv4Addr,
    /// Control port.
    pub port: u16,
    /// Absolute URL path for AVTransport SOAP posts.
    pub control_path: String,
    /// Device class.
    pub kind: RendererKind,
    /// Which discoverer originated (or currently owns) this record.
    pub source: DiscoverySource,
    /// Key/value metadata harvested from the description XML and TXT records.
    pub metadata: HashMap<String, String>,
}

impl Renderer {
    /// Derives the dedup key for an address.
    #[must_use]
    pub fn id_for(ip: Ipv4Addr, port: u16) -> String {
        format!("{}:{}", ip, port)
    }

    /// Creates a bare renderer record for an address seen by a discoverer.
    #[must_use]
    pub fn new(ip: Ipv4Addr, port: u16, source: DiscoverySource) -> Self {
        Self {
            id: Self::id_for(ip, port),
            friendly_name: String::new(),
            ip,
            port,
            control_path: String::new(),
            kind: RendererKind::Unknown,
            source,
            metadata: HashMap::new(),
        }
    }

    /// Whether control tasks should attempt the AVTransport sequence.
    #[must_use]
    pub fn is_controllable(&self) -> bool {
        self.kind.is_controllable()
    }

    /// Base HTTP URL of the renderer's control port.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Full control URL for SOAP posts.
    #[must_use]
    pub fn control_url(&self) -> String {
        format!("{}{}", self.base_url(), self.control_path)
    }

    /// Merges another record for the same `ip:port` into this one.
    ///
    /// Higher-precedence sources (Ssdp > Mdns > PortScan) replace fields
    /// one-by-one, but only where the incoming value is non-empty. Metadata
    /// maps are always unioned; the higher-precedence side wins key
    /// collisions. Lower or equal precedence contributes metadata only.
    pub fn merge_from(&mut self, incoming: Renderer) {
        debug_assert_eq!(self.id, incoming.id, "merge requires matching ids");

        if incoming.source.precedence() > self.source.precedence() {
            if !incoming.friendly_name.is_empty() {
                self.friendly_name = incoming.friendly_name;
            }
            if !incoming.control_path.is_empty() {
                self.control_path = incoming.control_path;
            }
            if incoming.kind != RendererKind::Unknown {
                self.kind = incoming.kind;
            }
            self.source = incoming.source;
            // Incoming (higher precedence) wins on key collision.
            for (k, v) in incoming.metadata {
                self.metadata.insert(k, v);
            }
        } else {
            // Existing record wins; incoming only fills missing keys.
            for (k, v) in incoming.metadata {
                self.metadata.entry(k).or_insert(v);
            }
        }
    }
}

/// Errors that can occur while running a discoverer.
///
/// Per-candidate degradations (unreachable probes, failed description
/// fetches) are handled inside the discoverers; only setup-level failures
/// surface here, and even those never fail a blast.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Failed to bind a UDP socket for SSDP.
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] std::io::Error),

    /// No usable network interfaces found.
    #[error("no usable network interfaces found")]
    NoInterfaces,

    /// mDNS daemon error.
    #[error("mDNS daemon error: {0}")]
    MdnsDaemon(String),

    /// Device description fetch failed.
    #[error("device description fetch failed: {0}")]
    XmlFetch(String),

    /// Device description could not be parsed.
    #[error("device description parse failed: {0}")]
    XmlParse(String),
}

/// Convenient Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
