//! Multi-method renderer discovery.
//!
//! This module provides functionality for finding every media renderer on the
//! local network, combining three differently-shaped producers behind one
//! deduplicated stream:
//!
//! - `ssdp` - SSDP multicast M-SEARCH plus device-description resolution
//! - `mdns` - DNS-SD browsing for Cast/AirPlay/RAOP/DLNA service types
//! - `portscan` - TCP probe sweep of the primary /24 subnet
//! - `description` - device description XML fetching/parsing
//! - `types` - domain types shared by all methods and the bus
//!
//! The [`DiscoveryBus`] starts the enabled discoverers in parallel, merges
//! their candidates into a dedup table keyed by `ip:port` (field precedence
//! Ssdp > Mdns > PortScan), and emits each renderer at most once. An
//! optional cache keyed by [`NetworkSignature`] short-circuits repeated
//! scans on an unchanged network.

pub mod description;
pub mod mdns;
pub mod portscan;
pub mod ssdp;
pub mod types;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use mdns_sd::ServiceDaemon;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::context::NetworkSignature;
use crate::protocol_constants::{DEFAULT_DISCOVERY_CACHE_TTL_MS, DEFAULT_DISCOVERY_TIMEOUT_MS};

pub use mdns::MdnsDiscoverer;
pub use portscan::PortScanDiscoverer;
pub use ssdp::SsdpDiscoverer;
pub use types::{DiscoveryError, DiscoveryResult, DiscoverySource, Renderer, RendererKind};

/// A single discovery producer.
///
/// Three differently-implemented producers yield the same record type; the
/// merge and dedup live in the bus, not behind this trait. Implementations
/// must observe `cancel` at every suspension point and treat `tx` closure as
/// cancellation.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Which method this producer implements (logging/metrics only).
    fn source(&self) -> DiscoverySource;

    /// Runs the producer for at most `window`, sending candidates to `tx`.
    async fn discover(
        &self,
        window: Duration,
        tx: mpsc::Sender<Renderer>,
        cancel: CancellationToken,
    ) -> DiscoveryResult<()>;
}

/// Which discovery methods a blast enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryMethods {
    /// SSDP multicast search.
    pub ssdp: bool,
    /// mDNS/DNS-SD browsing.
    pub mdns: bool,
    /// TCP subnet port scan.
    pub port_scan: bool,
}

impl Default for DiscoveryMethods {
    fn default() -> Self {
        Self {
            ssdp: true,
            mdns: true,
            port_scan: true,
        }
    }
}

impl DiscoveryMethods {
    /// Returns true when no method is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.ssdp || self.mdns || self.port_scan)
    }
}

/// Per-method raw candidate counts.
///
/// Counts every candidate a discoverer produced, including duplicates of
/// renderers another method already found; the per-method sum therefore
/// exceeds the unique device total by exactly the number of duplicate-source
/// hits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCounts {
    /// Candidates produced by SSDP.
    pub ssdp: u32,
    /// Candidates produced by mDNS.
    pub mdns: u32,
    /// Candidates produced by the port scan.
    pub port_scan: u32,
}

impl MethodCounts {
    /// Sum across methods.
    #[must_use]
    pub fn sum(&self) -> u32 {
        self.ssdp + self.mdns + self.port_scan
    }
}

/// Shared atomic counters behind [`MethodCounts`].
#[derive(Debug, Default)]
pub struct MethodCounters {
    ssdp: AtomicU32,
    mdns: AtomicU32,
    port_scan: AtomicU32,
}

impl MethodCounters {
    /// Records one raw candidate from `source`.
    pub fn record(&self, source: DiscoverySource) {
        let counter = match source {
            DiscoverySource::Ssdp => &self.ssdp,
            DiscoverySource::Mdns => &self.mdns,
            DiscoverySource::PortScan => &self.port_scan,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counts.
    #[must_use]
    pub fn snapshot(&self) -> MethodCounts {
        MethodCounts {
            ssdp: self.ssdp.load(Ordering::Relaxed),
            mdns: self.mdns.load(Ordering::Relaxed),
            port_scan: self.port_scan.load(Ordering::Relaxed),
        }
    }
}

/// Options for one discovery window.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Wall-clock budget; the stream completes when it elapses.
    pub timeout: Duration,
    /// Enabled methods.
    pub methods: DiscoveryMethods,
    /// Serve cached results when the network signature is unchanged.
    pub use_cache: bool,
    /// How long cached results stay valid.
    pub cache_ttl: Duration,
    /// Port scan: emit one renderer per open port instead of per host.
    pub emit_all_open_ports: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
            methods: DiscoveryMethods::default(),
            use_cache: false,
            cache_ttl: Duration::from_millis(DEFAULT_DISCOVERY_CACHE_TTL_MS),
            emit_all_open_ports: false,
        }
    }
}

/// The dedup table for one blast: merged renderers keyed by `ip:port`.
///
/// Owned by the orchestrator; the bus merge task is its single writer while
/// a discovery window is open.
pub type DedupTable = Arc<parking_lot::Mutex<HashMap<String, Renderer>>>;

/// A running discovery window: the deduplicated renderer stream plus the
/// merged table behind it.
pub struct DiscoverySession {
    /// Each renderer exactly once, as soon as it is first seen.
    pub renderers: ReceiverStream<Renderer>,
    /// Merged records; keeps absorbing metadata after a renderer was emitted.
    pub table: DedupTable,
}

/// Cached result of a completed discovery window.
struct CachedScan {
    at: Instant,
    renderers: Vec<Renderer>,
}

/// Composes the discoverers into one deduplicated renderer stream.
pub struct DiscoveryBus {
    client: Client,
    mdns_daemon: parking_lot::Mutex<Option<Arc<ServiceDaemon>>>,
    cache: DashMap<NetworkSignature, CachedScan>,
}

impl DiscoveryBus {
    /// Creates a bus sharing the pipeline's HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            mdns_daemon: parking_lot::Mutex::new(None),
            cache: DashMap::new(),
        }
    }

    /// Drops all cached scans (called on network-signature changes).
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// Returns the shared mDNS daemon, creating it on first use.
    fn mdns_daemon(&self) -> Option<Arc<ServiceDaemon>> {
        let mut slot = self.mdns_daemon.lock();
        if slot.is_none() {
            match MdnsDiscoverer::create_daemon() {
                Ok(daemon) => *slot = Some(Arc::new(daemon)),
                Err(e) => {
                    log::warn!("[Discovery] mDNS daemon unavailable: {}", e);
                    return None;
                }
            }
        }
        slot.clone()
    }

    /// Builds the standard discoverer set for the enabled methods.
    fn build_discoverers(
        &self,
        primary_ip: Ipv4Addr,
        opts: &DiscoveryOptions,
    ) -> Vec<Arc<dyn Discoverer>> {
        let mut discoverers: Vec<Arc<dyn Discoverer>> = Vec::new();
        if opts.methods.ssdp {
            discoverers.push(Arc::new(SsdpDiscoverer::new(self.client.clone())));
        }
        if opts.methods.mdns {
            if let Some(daemon) = self.mdns_daemon() {
                discoverers.push(Arc::new(MdnsDiscoverer::new(daemon)));
            }
        }
        if opts.methods.port_scan {
            discoverers.push(Arc::new(PortScanDiscoverer::new(
                primary_ip,
                opts.emit_all_open_ports,
            )));
        }
        discoverers
    }

    /// Starts a discovery window with the standard discoverers.
    ///
    /// `table` is the orchestrator-owned dedup table for this blast;
    /// `counters` accumulate raw per-method candidates across the blast
    /// (including pipeline retries).
    pub fn discover(
        self: &Arc<Self>,
        primary_ip: Ipv4Addr,
        signature: NetworkSignature,
        opts: &DiscoveryOptions,
        table: DedupTable,
        counters: Arc<MethodCounters>,
        cancel: CancellationToken,
    ) -> DiscoverySession {
        if opts.use_cache {
            if let Some(entry) = self.cache.get(&signature) {
                if entry.at.elapsed() < opts.cache_ttl {
                    log::info!(
                        "[Discovery] Serving {} renderer(s) from cache for {}",
                        entry.renderers.len(),
                        signature
                    );
                    return Self::replay_cached(entry.renderers.clone(), table, counters);
                }
            }
        }

        let discoverers = self.build_discoverers(primary_ip, opts);
        self.discover_with(discoverers, signature, opts, table, counters, cancel)
    }

    /// Emits previously-cached renderers as a session.
    fn replay_cached(
        renderers: Vec<Renderer>,
        table: DedupTable,
        counters: Arc<MethodCounters>,
    ) -> DiscoverySession {
        let (out_tx, out_rx) = mpsc::channel(64);
        let replay_table = Arc::clone(&table);
        tokio::spawn(async move {
            for renderer in renderers {
                counters.record(renderer.source);
                replay_table
                    .lock()
                    .insert(renderer.id.clone(), renderer.clone());
                if out_tx.send(renderer).await.is_err() {
                    break;
                }
            }
        });
        DiscoverySession {
            renderers: ReceiverStream::new(out_rx),
            table,
        }
    }

    /// Starts a discovery window over an explicit discoverer set.
    ///
    /// This is the composition point: candidates from all producers funnel
    /// through one channel into the merge task, which owns all writes to the
    /// dedup table for the duration of the window.
    pub fn discover_with(
        self: &Arc<Self>,
        discoverers: Vec<Arc<dyn Discoverer>>,
        signature: NetworkSignature,
        opts: &DiscoveryOptions,
        table: DedupTable,
        counters: Arc<MethodCounters>,
        cancel: CancellationToken,
    ) -> DiscoverySession {
        let window = opts.timeout;
        let (cand_tx, mut cand_rx) = mpsc::channel::<Renderer>(64);
        let (out_tx, out_rx) = mpsc::channel::<Renderer>(64);
        let child_cancel = cancel.child_token();

        for discoverer in discoverers {
            let tx = cand_tx.clone();
            let child = child_cancel.clone();
            tokio::spawn(async move {
                let source = discoverer.source();
                if let Err(e) = discoverer.discover(window, tx, child).await {
                    // Setup failures degrade discovery; they never fail it.
                    log::warn!("[Discovery] {} discoverer failed: {}", source, e);
                }
            });
        }
        drop(cand_tx);

        let bus = Arc::clone(self);
        let store_cache = opts.use_cache;
        let merge_table = Arc::clone(&table);
        tokio::spawn(async move {
            let started = Instant::now();
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                let candidate = tokio::select! {
                    () = &mut deadline => break,
                    () = cancel.cancelled() => break,
                    cand = cand_rx.recv() => match cand {
                        Some(c) => c,
                        None => break, // all discoverers finished early
                    },
                };

                counters.record(candidate.source);
                let emit = {
                    let mut table = merge_table.lock();
                    match table.entry(candidate.id.clone()) {
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            slot.insert(candidate.clone());
                            Some(candidate)
                        }
                        std::collections::hash_map::Entry::Occupied(mut slot) => {
                            // Same ip:port from a second source: merge, do
                            // not re-emit.
                            slot.get_mut().merge_from(candidate);
                            None
                        }
                    }
                };
                if let Some(renderer) = emit {
                    log::info!(
                        "[Discovery] {} via {}: {} ({:?})",
                        renderer.id,
                        renderer.source,
                        renderer.friendly_name,
                        renderer.kind
                    );
                    if out_tx.send(renderer).await.is_err() {
                        break; // consumer gone
                    }
                }
            }

            child_cancel.cancel();
            let final_renderers: Vec<Renderer> =
                merge_table.lock().values().cloned().collect();
            log::info!(
                "[Discovery] Window closed after {}ms: {} unique renderer(s)",
                started.elapsed().as_millis(),
                final_renderers.len()
            );
            if store_cache && !final_renderers.is_empty() {
                bus.cache.insert(
                    signature,
                    CachedScan {
                        at: Instant::now(),
                        renderers: final_renderers,
                    },
                );
            }
        });

        DiscoverySession {
            renderers: ReceiverStream::new(out_rx),
            table,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn new_table() -> DedupTable {
        Arc::new(parking_lot::Mutex::new(HashMap::new()))
    }

    fn short_opts() -> DiscoveryOptions {
        DiscoveryOptions {
            timeout: Duration::from_millis(200),
            ..DiscoveryOptions::default()
        }
    }

    async fn collect(mut session: DiscoverySession) -> Vec<Renderer> {
        use futures::StreamExt;
        let mut out = Vec::new();
        while let Some(r) = session.renderers.next().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn duplicate_sources_merge_without_reemission() {
        let bus = Arc::new(DiscoveryBus::new(Client::new()));
        let counters = Arc::new(MethodCounters::default());
        let table = new_table();

        let ssdp = ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos_renderer(DiscoverySource::Ssdp)],
        );
        let mut scan = ScriptedDiscoverer::new(
            DiscoverySource::PortScan,
            vec![sonos_renderer(DiscoverySource::PortScan)],
        );
        // Port scan arrives second.
        scan.delay = Duration::from_millis(50);

        let session = bus.discover_with(
            vec![Arc::new(ssdp), Arc::new(scan)],
            test_signature(),
            &short_opts(),
            Arc::clone(&table),
            Arc::clone(&counters),
            CancellationToken::new(),
        );

        let emitted = collect(session).await;
        assert_eq!(emitted.len(), 1, "one unique renderer");
        assert_eq!(emitted[0].source, DiscoverySource::Ssdp);

        let counts = counters.snapshot();
        assert_eq!(counts.ssdp, 1);
        assert_eq!(counts.port_scan, 1);
        assert_eq!(counts.sum(), 2);

        let table = table.lock();
        assert_eq!(table.len(), 1);
        let merged = &table["192.168.4.152:1400"];
        assert_eq!(merged.friendly_name, "Living Room");
        assert_eq!(merged.metadata["manufacturer"], "Sonos, Inc.");
    }

    #[tokio::test]
    async fn empty_network_completes_without_error() {
        let bus = Arc::new(DiscoveryBus::new(Client::new()));
        let session = bus.discover_with(
            vec![Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::Ssdp,
                vec![],
            ))],
            test_signature(),
            &short_opts(),
            new_table(),
            Arc::new(MethodCounters::default()),
            CancellationToken::new(),
        );
        let emitted = collect(session).await;
        assert!(emitted.is_empty());
    }

    #[tokio::test]
    async fn cache_replays_without_running_discoverers() {
        let bus = Arc::new(DiscoveryBus::new(Client::new()));
        let counters = Arc::new(MethodCounters::default());
        let opts = DiscoveryOptions {
            use_cache: true,
            ..short_opts()
        };

        let scripted = ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos_renderer(DiscoverySource::Ssdp)],
        );
        let calls = Arc::clone(&scripted.calls);

        // First window populates the cache.
        let session = bus.discover_with(
            vec![Arc::new(scripted)],
            test_signature(),
            &opts,
            new_table(),
            Arc::clone(&counters),
            CancellationToken::new(),
        );
        assert_eq!(collect(session).await.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second window is served from cache; discover() builds real
        // discoverers only on a miss, so a hit emits without scanning.
        let table = new_table();
        let session = bus.discover(
            Ipv4Addr::new(192, 168, 4, 77),
            test_signature(),
            &opts,
            Arc::clone(&table),
            Arc::clone(&counters),
            CancellationToken::new(),
        );
        let replayed = collect(session).await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(table.lock().len(), 1);
        assert_eq!(counters.snapshot().ssdp, 2);
    }

    #[tokio::test]
    async fn invalidated_cache_is_not_served() {
        let bus = Arc::new(DiscoveryBus::new(Client::new()));
        let opts = DiscoveryOptions {
            use_cache: true,
            ..short_opts()
        };

        let session = bus.discover_with(
            vec![Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::Ssdp,
                vec![sonos_renderer(DiscoverySource::Ssdp)],
            ))],
            test_signature(),
            &opts,
            new_table(),
            Arc::new(MethodCounters::default()),
            CancellationToken::new(),
        );
        assert_eq!(collect(session).await.len(), 1);

        bus.invalidate_cache();
        assert!(bus.cache.is_empty());
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let bus = Arc::new(DiscoveryBus::new(Client::new()));
        let mut slow = ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos_renderer(DiscoverySource::Ssdp)],
        );
        slow.delay = Duration::from_secs(10);

        let cancel = CancellationToken::new();
        let opts = DiscoveryOptions {
            timeout: Duration::from_secs(30),
            ..DiscoveryOptions::default()
        };
        let session = bus.discover_with(
            vec![Arc::new(slow)],
            test_signature(),
            &opts,
            new_table(),
            Arc::new(MethodCounters::default()),
            cancel.clone(),
        );

        cancel.cancel();
        let emitted = collect(session).await;
        assert!(emitted.is_empty());
    }
}
