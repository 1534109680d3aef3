//! TCP port-scan renderer discovery.
//!
//! Last-resort discovery for devices that answer neither SSDP nor mDNS:
//! probes every host of the primary /24 subnet against a fixed ordered port
//! list of known renderer control ports. A host is emitted as soon as one
//! port accepts a connection; remaining ports for that host are skipped
//! (see `emit_all_open_ports` for the alternative behavior).
//!
//! Probes are bounded by a 200ms connect timeout and a process-wide
//! 40-permit semaphore, so a silent subnet finishes within roughly the
//! discovery window plus one probe timeout.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::types::{DiscoveryResult, DiscoverySource, Renderer, RendererKind};
use super::Discoverer;
use crate::protocol_constants::{scan_ports, PORT_SCAN_PARALLELISM, PROBE_TIMEOUT};
use crate::utils::tcp_reachable;

/// Builds the renderer record for an open `host:port`.
fn renderer_for_open_port(ip: Ipv4Addr, port: u16) -> Renderer {
    let kind = RendererKind::from_port(port);
    let mut renderer = Renderer::new(ip, port, DiscoverySource::PortScan);
    renderer.kind = kind;
    renderer.friendly_name = format!("{} on port {}", kind.label(), port);
    renderer.control_path = kind.fallback_control_path().to_string();
    renderer
        .metadata
        .insert("openPort".to_string(), port.to_string());
    renderer
}

/// Probes one host against the ordered port list.
///
/// Returns one renderer per open port, in list order; when `emit_all` is
/// false the scan stops at the first hit.
async fn scan_host(
    ip: Ipv4Addr,
    ports: &[u16],
    permits: &Semaphore,
    probe_timeout: Duration,
    emit_all: bool,
) -> Vec<Renderer> {
    let mut found = Vec::new();
    for &port in ports {
        let Ok(_permit) = permits.acquire().await else {
            break; // semaphore closed: scan cancelled
        };
        if tcp_reachable(ip, port, probe_timeout).await {
            found.push(renderer_for_open_port(ip, port));
            if !emit_all {
                break;
            }
        }
    }
    found
}

/// Port-scan discoverer over the primary /24 subnet.
pub struct PortScanDiscoverer {
    subnet_base: Ipv4Addr,
    emit_all_open_ports: bool,
}

impl PortScanDiscoverer {
    /// Creates a scanner for the /24 subnet containing `primary_ip`.
    ///
    /// `emit_all_open_ports` switches the per-host behavior from
    /// first-open-port-wins to one renderer per open port.
    #[must_use]
    pub fn new(primary_ip: Ipv4Addr, emit_all_open_ports: bool) -> Self {
        let o = primary_ip.octets();
        Self {
            subnet_base: Ipv4Addr::new(o[0], o[1], o[2], 0),
            emit_all_open_ports,
        }
    }

    /// Host addresses `.1` through `.254` of the subnet.
    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let o = self.subnet_base.octets();
        (1..=254u8).map(move |last| Ipv4Addr::new(o[0], o[1], o[2], last))
    }
}

#[async_trait]
impl Discoverer for PortScanDiscoverer {
    fn source(&self) -> DiscoverySource {
        DiscoverySource::PortScan
    }

    async fn discover(
        &self,
        window: Duration,
        tx: mpsc::Sender<Renderer>,
        cancel: CancellationToken,
    ) -> DiscoveryResult<()> {
        let ports = Arc::new(scan_ports());
        let permits = Arc::new(Semaphore::new(PORT_SCAN_PARALLELISM));
        let emit_all = self.emit_all_open_ports;

        log::debug!(
            "[PortScan] Scanning {}/24 against {} ports, window {}ms",
            self.subnet_base,
            ports.len(),
            window.as_millis()
        );

        let host_tasks = self.hosts().map(|ip| {
            let ports = Arc::clone(&ports);
            let permits = Arc::clone(&permits);
            let tx = tx.clone();
            async move {
                for renderer in scan_host(ip, &ports, &permits, PROBE_TIMEOUT, emit_all).await {
                    log::debug!("[PortScan] Open port at {}", renderer.id);
                    if tx.send(renderer).await.is_err() {
                        break;
                    }
                }
            }
        });

        let work = futures::future::join_all(host_tasks);
        tokio::select! {
            () = cancel.cancelled() => {
                permits.close();
            }
            _ = tokio::time::timeout(window, work) => {}
        }

        log::debug!("[PortScan] Scan window closed");
        Ok(())
    }
}
