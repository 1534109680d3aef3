//! mDNS/DNS-SD based renderer discovery.
//!
//! Browses the local domain for Cast, AirPlay/RAOP and DLNA service types.
//! Particularly effective on networks where SSDP multicast is filtered but
//! mDNS works, and it is the only method that sees Cast devices reliably.
//!
//! # Key Design Points
//!
//! - Uses resolved record data (IP from SRV/A answers), not string parsing
//! - TXT records are copied into renderer metadata verbatim
//! - Calls `stop_browse()` after the window to avoid accumulating daemon work

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{DiscoveryError, DiscoveryResult, DiscoverySource, Renderer, RendererKind};
use super::Discoverer;
use crate::protocol_constants::MDNS_SERVICE_TYPES;

/// Maps an mDNS service type to a renderer kind.
fn kind_for_service_type(service_type: &str) -> RendererKind {
    if service_type.contains("googlecast") {
        RendererKind::Chromecast
    } else if service_type.contains("airplay") || service_type.contains("raop") {
        RendererKind::AirPlay
    } else if service_type.contains("dlna") {
        RendererKind::Dlna
    } else {
        RendererKind::Unknown
    }
}

/// Extracts the service instance name from a fullname.
///
/// `Living Room TV._googlecast._tcp.local.` → `Living Room TV`.
fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Converts a resolved mDNS service into a renderer record.
///
/// Returns None when the service resolved without an IPv4 address; renderers
/// are controlled over IPv4 only.
fn parse_mdns_service(info: &ResolvedService, service_type: &str) -> Option<Renderer> {
    let ip = info.addresses.iter().find_map(|addr| match addr {
        ScopedIp::V4(v4) => Some(*v4.addr()),
        _ => None,
    })?;

    let kind = kind_for_service_type(service_type);
    let mut renderer = Renderer::new(ip, info.port, DiscoverySource::Mdns);
    renderer.kind = kind;
    renderer.control_path = "/".to_string();

    // TXT records verbatim; the `fn` key (Cast convention) doubles as the
    // friendly name when present.
    for prop in info.txt_properties.iter() {
        renderer
            .metadata
            .insert(prop.key().to_string(), prop.val_str().to_string());
    }
    renderer.friendly_name = renderer
        .metadata
        .get("fn")
        .cloned()
        .unwrap_or_else(|| instance_name(&info.fullname, service_type).to_string());

    // Record every resolved address for diagnostics.
    let all_ips: Vec<String> = info
        .addresses
        .iter()
        .map(|a| a.to_ip_addr().to_string())
        .collect();
    if !all_ips.is_empty() {
        renderer
            .metadata
            .insert("resolvedAddresses".to_string(), all_ips.join(","));
    }
    renderer
        .metadata
        .insert("serviceType".to_string(), service_type.to_string());
    if let Some(host) = non_empty(&info.host) {
        renderer.metadata.insert("host".to_string(), host);
    }

    Some(renderer)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// mDNS discoverer browsing the Cast/AirPlay/RAOP/DLNA service types.
pub struct MdnsDiscoverer {
    daemon: Arc<ServiceDaemon>,
}

impl MdnsDiscoverer {
    /// Creates a discoverer around a shared mDNS daemon.
    ///
    /// The daemon spawns a background thread; create it once and reuse it
    /// across discovery calls.
    #[must_use]
    pub fn new(daemon: Arc<ServiceDaemon>) -> Self {
        Self { daemon }
    }

    /// Creates a new mDNS service daemon.
    pub fn create_daemon() -> DiscoveryResult<ServiceDaemon> {
        ServiceDaemon::new().map_err(|e| DiscoveryError::MdnsDaemon(e.to_string()))
    }
}

#[async_trait]
impl Discoverer for MdnsDiscoverer {
    fn source(&self) -> DiscoverySource {
        DiscoverySource::Mdns
    }

    async fn discover(
        &self,
        window: Duration,
        tx: mpsc::Sender<Renderer>,
        cancel: CancellationToken,
    ) -> DiscoveryResult<()> {
        log::debug!(
            "[mDNS] Browsing {} service types, window {}ms",
            MDNS_SERVICE_TYPES.len(),
            window.as_millis()
        );

        let browse_tasks = MDNS_SERVICE_TYPES.iter().map(|&service_type| {
            let daemon = Arc::clone(&self.daemon);
            let tx = tx.clone();
            let cancel = cancel.clone();

            async move {
                let receiver = match daemon.browse(service_type) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("[mDNS] Browse failed for {}: {:?}", service_type, e);
                        return;
                    }
                };

                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = receiver.recv_async() => match event {
                            Ok(e) => e,
                            Err(_) => break, // channel closed
                        },
                    };

                    if let ServiceEvent::ServiceResolved(info) = event {
                        log::trace!("[mDNS] Resolved: {:?}", info.fullname);
                        if let Some(renderer) = parse_mdns_service(&info, service_type) {
                            log::debug!(
                                "[mDNS] {} ({}) at {}",
                                renderer.friendly_name,
                                service_type,
                                renderer.id
                            );
                            if tx.send(renderer).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                if let Err(e) = daemon.stop_browse(service_type) {
                    log::warn!("[mDNS] Failed to stop browse for {}: {:?}", service_type, e);
                }
            }
        });

        let work = futures::future::join_all(browse_tasks);
        tokio::select! {
            () = cancel.cancelled() => {}
            _ = tokio::time::timeout(window, work) => {}
        }

        // Make sure browses are stopped even when the timeout preempted the
        // per-type cleanup above.
        for &service_type in MDNS_SERVICE_TYPES {
            let _ = self.daemon.stop_browse(service_type);
        }

        log::debug!("[mDNS] Browse window closed");
        Ok(())
    }
}
