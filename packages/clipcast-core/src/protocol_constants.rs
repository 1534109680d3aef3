//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (UPnP, SSDP, SOAP) or
//! by observed renderer behavior, and changing them would break protocol
//! compliance or device compatibility.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// SSDP (Simple Service Discovery Protocol)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard SSDP multicast address and port (protocol specification).
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// SSDP search target: all UPnP root devices.
pub const SSDP_SEARCH_TARGET: &str = "upnp:rootdevice";

/// MX value (max response delay in seconds) carried in the M-SEARCH.
pub const SSDP_MX_SECS: u64 = 3;

/// Interval between repeated M-SEARCH sends within the discovery window.
pub const SSDP_RESEND_INTERVAL: Duration = Duration::from_millis(2000);

/// Timeout for fetching a device description document at LOCATION.
pub const DESCRIPTION_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

// ─────────────────────────────────────────────────────────────────────────────
// Port Scanning
// ─────────────────────────────────────────────────────────────────────────────

/// Per-port TCP connect timeout during scans and reachability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum concurrent TCP probes across the whole subnet scan.
pub const PORT_SCAN_PARALLELISM: usize = 40;

/// Candidate ports probed when an SSDP LOCATION carries no explicit port.
pub const LOCATION_FALLBACK_PORTS: &[u16] = &[80, 8080, 7000, 8000, 49152];

/// Returns the canonical ordered port list for subnet scans.
///
/// Covers common renderer control ports: HTTP(S), RTSP, AirPlay, Cast,
/// Roku ECP, DLNA/UPnP ranges, Sonos (1400-1410) and the UPnP ephemeral
/// base range (49152-49170).
pub fn scan_ports() -> Vec<u16> {
    let mut ports: Vec<u16> = vec![80, 443, 5000, 554, 7000, 7100];
    ports.extend(8008..=8010);
    ports.push(8043);
    ports.push(8060);
    ports.push(8080);
    ports.extend(8090..=8099);
    ports.extend(8200..=8205);
    ports.push(8873);
    ports.extend(9000..=9010);
    ports.extend(10000..=10010);
    ports.extend(1400..=1410);
    ports.extend(49152..=49170);
    ports.push(50002);
    ports.push(5353);
    ports
}

// ─────────────────────────────────────────────────────────────────────────────
// mDNS
// ─────────────────────────────────────────────────────────────────────────────

/// Service types browsed during mDNS discovery (trailing dot required by mdns-sd).
pub const MDNS_SERVICE_TYPES: &[&str] = &[
    "_googlecast._tcp.local.",
    "_airplay._tcp.local.",
    "_raop._tcp.local.",
    "_dlna._tcp.local.",
];

// ─────────────────────────────────────────────────────────────────────────────
// SOAP / AVTransport
// ─────────────────────────────────────────────────────────────────────────────

/// UPnP AVTransport service URN.
pub const AVTRANSPORT_URN: &str = "urn:schemas-upnp-org:service:AVTransport:1";

/// Timeout for a single SOAP HTTP request.
pub const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between SetAVTransportURI and Play.
///
/// Some renderers reject Play while still loading the URI; 200ms is the
/// shortest spacing that works across the tested device population.
pub const SOAP_INTER_CALL_DELAY: Duration = Duration::from_millis(200);

// ─────────────────────────────────────────────────────────────────────────────
// Clip Server
// ─────────────────────────────────────────────────────────────────────────────

/// The single stable path the clip is served under, across hot-swaps.
pub const CLIP_PATH: &str = "/media/current";

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default wall-clock budget for a discovery window (ms).
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 4000;

/// Default number of concurrent control tasks.
pub const DEFAULT_FANOUT_PARALLELISM: usize = 3;

/// Default TTL for cached discovery results (ms).
pub const DEFAULT_DISCOVERY_CACHE_TTL_MS: u64 = 60_000;

/// Backoff schedule for pipeline retries after a network change (ms).
pub const NETWORK_CHANGE_BACKOFF_MS: [u64; 3] = [3000, 6000, 12000];

/// Capacity of the event broadcast channel for metrics consumers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
