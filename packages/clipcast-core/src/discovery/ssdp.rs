//! SSDP-based renderer discovery.
//!
//! Sends `M-SEARCH` queries for `upnp:rootdevice` to 239.255.255.250:1900 on
//! every usable interface and turns the HTTP-like unicast replies into
//! [`Renderer`] records. For each new responder the device description at
//! LOCATION is fetched and parsed for identity metadata and the AVTransport
//! control URL; fetch failures degrade to per-kind fallbacks.
//!
//! The same socket is used for send AND receive since devices reply unicast
//! back to the sending socket/port.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use local_ip_address::list_afinet_netifas;
use reqwest::Client;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::description::{fetch_description, parse_description};
use super::types::{DiscoveryError, DiscoveryResult, DiscoverySource, Renderer, RendererKind};
use super::Discoverer;
use crate::context::is_virtual_interface;
use crate::protocol_constants::{
    LOCATION_FALLBACK_PORTS, PROBE_TIMEOUT, SSDP_MULTICAST_ADDR, SSDP_MX_SECS,
    SSDP_RESEND_INTERVAL, SSDP_SEARCH_TARGET,
};
use crate::utils::{starts_with_ignore_ascii_case, tcp_reachable};

/// Builds the M-SEARCH message, byte-exact.
///
/// Header order and quoting are part of the wire contract; several renderer
/// firmwares reject reordered or unquoted variants.
fn build_msearch_message() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         ST: {}\r\n\
         MX: {}\r\n\r\n",
        SSDP_SEARCH_TARGET, SSDP_MX_SECS
    )
}

/// Network interface information for discovery.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "en0", "eth0").
    pub name: String,
    /// IPv4 address bound to this interface.
    pub ip: Ipv4Addr,
}

/// Gets all usable network interfaces for discovery.
///
/// Filters out virtual/container interfaces and loopback.
pub fn get_interfaces() -> Vec<InterfaceInfo> {
    list_afinet_netifas()
        .unwrap_or_else(|e| {
            log::warn!("Failed to list network interfaces: {}", e);
            Vec::new()
        })
        .into_iter()
        .filter_map(|(name, addr)| {
            if is_virtual_interface(&name) {
                log::debug!("Skipping virtual interface: {}", name);
                return None;
            }
            match addr {
                IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(InterfaceInfo { name, ip: ipv4 }),
                _ => None,
            }
        })
        .collect()
}

/// Creates a UDP socket bound to a specific interface.
///
/// Socket options follow UPnP practice: SO_REUSEADDR for rapid restarts,
/// SO_REUSEPORT on Unix, multicast TTL of 4 per the UPnP 1.0 spec.
fn create_socket(iface_ip: Ipv4Addr) -> DiscoveryResult<UdpSocket> {
    let bind_addr = SocketAddr::new(IpAddr::V4(iface_ip), 0);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::SocketBind)?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("Failed to set SO_REUSEADDR on {}: {}", iface_ip, e);
    }

    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("Failed to set SO_REUSEPORT on {}: {}", iface_ip, e);
    }

    if let Err(e) = socket.set_multicast_ttl_v4(4) {
        log::warn!("Failed to set multicast TTL on {}: {}", iface_ip, e);
    }

    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::SocketBind)?;

    socket
        .bind(&bind_addr.into())
        .map_err(DiscoveryError::SocketBind)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(DiscoveryError::SocketBind)
}

/// A parsed SSDP search response.
#[derive(Debug, Clone, Default, PartialEq)]
struct SsdpResponse {
    location: Option<String>,
    server: Option<String>,
    usn: Option<String>,
}

impl SsdpResponse {
    /// Combined header text used for kind classification.
    fn classification_text(&self) -> String {
        let mut text = String::new();
        for part in [&self.server, &self.usn, &self.location].into_iter().flatten() {
            text.push_str(part);
            text.push(' ');
        }
        text
    }
}

/// Parses an SSDP response into its relevant headers.
///
/// Returns None unless the status line is an HTTP 200. Header names are
/// matched ASCII-case-insensitively; some devices send lowercase headers.
fn parse_ssdp_response(response: &str) -> Option<SsdpResponse> {
    let mut lines = response.lines();
    let status = lines.next()?;
    if !status.starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut parsed = SsdpResponse::default();
    for line in lines {
        // Find colon index to preserve URL colons in the value.
        let header_value = |prefix: &str| {
            starts_with_ignore_ascii_case(line, prefix)
                .then(|| line.find(':').map(|idx| line[idx + 1..].trim().to_string()))
                .flatten()
        };
        if let Some(v) = header_value("location:") {
            parsed.location = Some(v);
        } else if let Some(v) = header_value("server:") {
            parsed.server = Some(v);
        } else if let Some(v) = header_value("usn:") {
            parsed.usn = Some(v);
        }
    }

    Some(parsed)
}

/// Extracts an explicit port from a LOCATION URL, if one is present.
fn port_from_location(location: &str) -> Option<u16> {
    let rest = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("https://"))?;
    let host_port = rest.split('/').next()?;
    let (_, port) = host_port.rsplit_once(':')?;
    port.parse().ok()
}

/// Port component of the responder dedup key.
///
/// Responders are accumulated into a set keyed by `ip:port`, with the port
/// taken from the LOCATION URL; one host can advertise several root devices
/// on distinct ports and each must be resolved. Follows the same fallback
/// order as [`resolve_port`] minus the reachability probes, which would
/// stall the receive loop: LOCATION port, then the classified kind's
/// well-known port, then 80.
fn dedup_key_port(response: &SsdpResponse) -> u16 {
    response
        .location
        .as_deref()
        .and_then(port_from_location)
        .or_else(|| RendererKind::classify(&response.classification_text()).default_port())
        .unwrap_or(80)
}

/// Resolves the control port for a responder.
///
/// Uses the LOCATION port when explicit, then the kind's well-known port
/// (Sonos 1400, Chromecast 8008), then probes the common fallback ports in
/// order and takes the first reachable one. Defaults to 80.
async fn resolve_port(ip: Ipv4Addr, location: Option<&str>, kind: RendererKind) -> u16 {
    if let Some(port) = location.and_then(port_from_location) {
        return port;
    }
    if let Some(port) = kind.default_port() {
        return port;
    }
    for &port in LOCATION_FALLBACK_PORTS {
        if tcp_reachable(ip, port, PROBE_TIMEOUT).await {
            return port;
        }
    }
    80
}

/// Builds a full renderer record from a new SSDP responder.
///
/// Fetches and parses the device description when a LOCATION is available;
/// on any failure degrades to the per-kind fallback control path and the
/// SERVER header (or a synthesized label) as the friendly name.
async fn resolve_renderer(client: &Client, src_ip: Ipv4Addr, response: SsdpResponse) -> Renderer {
    let mut kind = RendererKind::classify(&response.classification_text());
    let port = resolve_port(src_ip, response.location.as_deref(), kind).await;

    let mut renderer = Renderer::new(src_ip, port, DiscoverySource::Ssdp);
    if let Some(usn) = &response.usn {
        renderer.metadata.insert("usn".to_string(), usn.clone());
    }
    if let Some(server) = &response.server {
        renderer.metadata.insert("server".to_string(), server.clone());
    }

    let description = match &response.location {
        Some(location) => match fetch_description(client, location).await {
            Ok(xml) => match parse_description(&xml) {
                Ok(desc) => Some(desc),
                Err(e) => {
                    log::debug!("[SSDP] {}: description parse failed: {}", src_ip, e);
                    None
                }
            },
            Err(e) => {
                log::debug!("[SSDP] {}: description fetch failed: {}", src_ip, e);
                None
            }
        },
        None => None,
    };

    match description {
        Some(desc) => {
            // Reclassify with the description text folded in; headers alone
            // often miss the vendor.
            let combined = format!(
                "{} {}",
                response.classification_text(),
                desc.classification_text()
            );
            kind = RendererKind::classify(&combined);

            renderer.friendly_name = desc
                .friendly_name()
                .map(str::to_string)
                .or_else(|| response.server.clone())
                .unwrap_or_else(|| format!("{} on port {}", kind.label(), port));
            renderer.control_path = desc
                .av_transport_control_url()
                .map(str::to_string)
                .unwrap_or_else(|| kind.fallback_control_path().to_string());
            renderer.metadata.extend(desc.metadata());
        }
        None => {
            renderer.friendly_name = response
                .server
                .clone()
                .unwrap_or_else(|| format!("{} on port {}", kind.label(), port));
            renderer.control_path = kind.fallback_control_path().to_string();
        }
    }
    renderer.kind = kind;
    renderer
}

/// SSDP discoverer: multicast M-SEARCH plus description resolution.
pub struct SsdpDiscoverer {
    client: Client,
}

impl SsdpDiscoverer {
    /// Creates an SSDP discoverer sharing the pipeline's HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Discoverer for SsdpDiscoverer {
    fn source(&self) -> DiscoverySource {
        DiscoverySource::Ssdp
    }

    async fn discover(
        &self,
        window: Duration,
        tx: mpsc::Sender<Renderer>,
        cancel: CancellationToken,
    ) -> DiscoveryResult<()> {
        let interfaces = get_interfaces();
        if interfaces.is_empty() {
            return Err(DiscoveryError::NoInterfaces);
        }

        let msg = build_msearch_message();

        let mut sockets: Vec<(InterfaceInfo, Arc<UdpSocket>)> = Vec::new();
        for iface in &interfaces {
            match create_socket(iface.ip) {
                Ok(socket) => sockets.push((iface.clone(), Arc::new(socket))),
                Err(e) => {
                    log::warn!(
                        "[SSDP] Failed to create socket for {} ({}): {}",
                        iface.name,
                        iface.ip,
                        e
                    );
                }
            }
        }
        if sockets.is_empty() {
            return Err(DiscoveryError::NoInterfaces);
        }

        log::debug!(
            "[SSDP] Searching on {} interface(s), window {}ms",
            sockets.len(),
            window.as_millis()
        );

        // Responders already being resolved or emitted, keyed by ip:port
        // (port from LOCATION). A single responder answers every repeated
        // M-SEARCH; resolution (description fetch) must happen once, but a
        // host advertising several root devices on distinct ports gets one
        // resolution each.
        let seen: Arc<Mutex<HashSet<(Ipv4Addr, u16)>>> = Arc::new(Mutex::new(HashSet::new()));

        // Send loop: repeat the multicast every ~2s until the window closes.
        let send_sockets: Vec<Arc<UdpSocket>> =
            sockets.iter().map(|(_, s)| Arc::clone(s)).collect();
        let send_cancel = cancel.clone();
        let send_msg = msg.into_bytes();
        let send_task = async move {
            loop {
                for socket in &send_sockets {
                    if let Err(e) = socket.send_to(&send_msg, SSDP_MULTICAST_ADDR).await {
                        log::warn!("[SSDP] Failed to send M-SEARCH: {}", e);
                    }
                }
                tokio::select! {
                    () = send_cancel.cancelled() => break,
                    () = tokio::time::sleep(SSDP_RESEND_INTERVAL) => {}
                }
            }
        };

        // Receive loops: one per socket, resolving each new responder in a
        // spawned task so a slow description fetch never stalls the socket.
        let recv_tasks = sockets.iter().map(|(iface, socket)| {
            let socket = Arc::clone(socket);
            let iface_name = iface.name.clone();
            let seen = Arc::clone(&seen);
            let tx = tx.clone();
            let client = self.client.clone();
            let cancel = cancel.clone();

            async move {
                let mut buf = [0u8; 2048];
                loop {
                    let (amt, src) = tokio::select! {
                        () = cancel.cancelled() => break,
                        recv = socket.recv_from(&mut buf) => match recv {
                            Ok(r) => r,
                            Err(e) => {
                                log::warn!("[SSDP] Recv error on {}: {}", iface_name, e);
                                continue;
                            }
                        },
                    };

                    let IpAddr::V4(src_ip) = src.ip() else { continue };
                    let response = String::from_utf8_lossy(&buf[..amt]);
                    let Some(parsed) = parse_ssdp_response(&response) else {
                        continue;
                    };

                    let key_port = dedup_key_port(&parsed);
                    if !seen.lock().await.insert((src_ip, key_port)) {
                        continue;
                    }
                    log::debug!(
                        "[SSDP] Responder {}:{} via {} (location: {:?})",
                        src_ip,
                        key_port,
                        iface_name,
                        parsed.location
                    );

                    let tx = tx.clone();
                    let client = client.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            renderer = resolve_renderer(&client, src_ip, parsed) => {
                                let _ = tx.send(renderer).await;
                            }
                        }
                    });
                }
            }
        });

        // Drive sends and receives together until the window closes or the
        // bus cancels us.
        let work = async {
            tokio::join!(send_task, futures::future::join_all(recv_tasks));
        };
        tokio::select! {
            () = cancel.cancelled() => {}
            _ = timeout(window, work) => {}
        }

        log::debug!("[SSDP] Search window closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msearch_message_is_byte_exact() {
        let expected = "M-SEARCH * HTTP/1.1\r\n\
                        HOST: 239.255.255.250:1900\r\n\
                        MAN: \"ssdp:discover\"\r\n\
                        ST: upnp:rootdevice\r\n\
                        MX: 3\r\n\r\n";
        assert_eq!(build_msearch_message(), expected);
    }

    #[test]
    fn parse_response_extracts_headers() {
        let response = "HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=1800\r\n\
            LOCATION: http://192.168.4.152:1400/xml/device_description.xml\r\n\
            SERVER: Linux UPnP/1.0 Sonos/63.2-88230\r\n\
            USN: uuid:RINCON_ABC::urn:schemas-upnp-org:device:ZonePlayer:1\r\n\r\n";
        let parsed = parse_ssdp_response(response).unwrap();
        assert_eq!(
            parsed.location.as_deref(),
            Some("http://192.168.4.152:1400/xml/device_description.xml")
        );
        assert_eq!(
            parsed.server.as_deref(),
            Some("Linux UPnP/1.0 Sonos/63.2-88230")
        );
        assert!(parsed.usn.unwrap().contains("RINCON_ABC"));
    }

    #[test]
    fn parse_response_rejects_non_200() {
        let response = "HTTP/1.1 404 Not Found\r\nSERVER: whatever\r\n\r\n";
        assert!(parse_ssdp_response(response).is_none());
    }

    #[test]
    fn parse_response_lowercase_headers() {
        let response = "HTTP/1.1 200 OK\r\n\
            location: http://192.168.1.20:8008/ssdp/device-desc.xml\r\n\
            server: Chromecast Ultra\r\n\r\n";
        let parsed = parse_ssdp_response(response).unwrap();
        assert_eq!(
            parsed.location.as_deref(),
            Some("http://192.168.1.20:8008/ssdp/device-desc.xml")
        );
        assert_eq!(parsed.server.as_deref(), Some("Chromecast Ultra"));
        assert!(parsed.usn.is_none());
    }

    #[test]
    fn parse_response_empty_stream_yields_nothing() {
        assert!(parse_ssdp_response("").is_none());
    }

    #[test]
    fn port_from_location_explicit() {
        assert_eq!(
            port_from_location("http://192.168.4.152:1400/xml/device_description.xml"),
            Some(1400)
        );
        assert_eq!(port_from_location("http://192.168.1.9:8008/setup"), Some(8008));
    }

    #[test]
    fn port_from_location_missing() {
        assert_eq!(
            port_from_location("http://192.168.4.152/description.xml"),
            None
        );
        assert_eq!(port_from_location("garbage"), None);
    }

    #[tokio::test]
    async fn resolve_port_prefers_location_then_kind() {
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        assert_eq!(
            resolve_port(ip, Some("http://127.0.0.1:1400/x.xml"), RendererKind::Sonos).await,
            1400
        );
        // No location port: Sonos class default.
        assert_eq!(resolve_port(ip, None, RendererKind::Sonos).await, 1400);
        assert_eq!(resolve_port(ip, None, RendererKind::Chromecast).await, 8008);
    }

    #[test]
    fn dedup_key_port_prefers_location_port() {
        let parsed = SsdpResponse {
            location: Some("http://192.168.4.152:49153/desc.xml".into()),
            server: Some("Linux UPnP/1.0 Sonos/63".into()),
            usn: None,
        };
        assert_eq!(dedup_key_port(&parsed), 49153);
    }

    #[test]
    fn dedup_key_port_distinguishes_devices_on_one_host() {
        let first = SsdpResponse {
            location: Some("http://192.168.4.152:1400/desc.xml".into()),
            ..SsdpResponse::default()
        };
        let second = SsdpResponse {
            location: Some("http://192.168.4.152:49152/desc.xml".into()),
            ..SsdpResponse::default()
        };
        assert_ne!(dedup_key_port(&first), dedup_key_port(&second));
    }

    #[test]
    fn dedup_key_port_falls_back_to_kind_then_80() {
        let sonos = SsdpResponse {
            location: Some("http://192.168.4.152/desc.xml".into()),
            server: Some("Linux UPnP/1.0 Sonos/63".into()),
            usn: None,
        };
        assert_eq!(dedup_key_port(&sonos), 1400);

        let generic = SsdpResponse {
            location: None,
            server: Some("Some Vendor UPnP/1.1".into()),
            usn: None,
        };
        assert_eq!(dedup_key_port(&generic), 80);
    }

    #[test]
    fn classification_text_combines_headers() {
        let parsed = SsdpResponse {
            location: Some("http://192.168.1.9:1400/xml".into()),
            server: Some("Linux UPnP/1.0 Sonos/63".into()),
            usn: Some("uuid:RINCON_X".into()),
        };
        let kind = RendererKind::classify(&parsed.classification_text());
        assert_eq!(kind, RendererKind::Sonos);
    }
}
