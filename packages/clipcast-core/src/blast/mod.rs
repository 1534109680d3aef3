//! Blast orchestration.
//!
//! The orchestrator sequences the full pipeline — start the clip server,
//! open a discovery window, fan control tasks out over discovered renderers
//! — and publishes live progress:
//!
//! - `metrics` - stages, snapshots, per-device outcomes
//!
//! The pipeline is fan-in/fan-out rather than two sequential phases: control
//! tasks start as soon as a renderer is emitted and the fan-out semaphore has
//! capacity. A single pipeline task owns all metrics/outcome state; control
//! tasks report over a channel. Network-signature changes mid-blast abort
//! the discovery window and retry the pipeline with exponential backoff.

pub mod metrics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::context::{NetworkContext, NetworkSignature};
use crate::control::{ControlClient, ControlError, PushFailure};
use crate::discovery::{
    DedupTable, Discoverer, DiscoveryBus, DiscoveryMethods, DiscoveryOptions, MethodCounters,
    Renderer,
};
use crate::error::{BlastError, BlastResult};
use crate::events::{MetricsEvent, MetricsSink, OutcomeEvent, RendererEvent, StageEvent};
use crate::protocol_constants::{
    DEFAULT_DISCOVERY_CACHE_TTL_MS, DEFAULT_DISCOVERY_TIMEOUT_MS, DEFAULT_FANOUT_PARALLELISM,
    NETWORK_CHANGE_BACKOFF_MS,
};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::server::{ClipConfig, ClipServer};
use crate::utils::now_millis;

pub use metrics::{BlastStage, DeviceOutcome, Metrics, OutcomeError};

/// Tunable options for one blast operation.
#[derive(Debug, Clone)]
pub struct BlastConfig {
    /// Wall-clock budget for the discovery window.
    pub discovery_timeout_ms: u64,
    /// Per-SOAP-call timeout.
    pub soap_timeout_ms: u64,
    /// Concurrent control tasks.
    pub fanout_parallelism: usize,
    /// Enabled discovery methods.
    pub discovery_methods: DiscoveryMethods,
    /// Serve cached discovery results on an unchanged network.
    pub enable_discovery_cache: bool,
    /// TTL for cached discovery results.
    pub discovery_cache_ttl_ms: u64,
    /// Port scan: emit one renderer per open port instead of per host.
    pub emit_all_open_ports: bool,
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            soap_timeout_ms: 5000,
            fanout_parallelism: DEFAULT_FANOUT_PARALLELISM,
            discovery_methods: DiscoveryMethods::default(),
            enable_discovery_cache: false,
            discovery_cache_ttl_ms: DEFAULT_DISCOVERY_CACHE_TTL_MS,
            emit_all_open_ports: false,
        }
    }
}

impl BlastConfig {
    fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            timeout: Duration::from_millis(self.discovery_timeout_ms),
            methods: self.discovery_methods,
            use_cache: self.enable_discovery_cache,
            cache_ttl: Duration::from_millis(self.discovery_cache_ttl_ms),
            emit_all_open_ports: self.emit_all_open_ports,
        }
    }
}

/// Resolves when the spawned blast pipeline reaches a terminal state.
pub type BlastCompletion = oneshot::Receiver<BlastResult<Metrics>>;

enum RunState {
    Idle,
    Running { cancel: CancellationToken },
}

struct Inner {
    network: NetworkContext,
    http: Client,
    bus: Arc<DiscoveryBus>,
    server: ClipServer,
    sink: Arc<dyn MetricsSink>,
    spawner: TokioSpawner,
    state: parking_lot::Mutex<RunState>,
    last_metrics: Arc<RwLock<Metrics>>,
    signature_tx: watch::Sender<Option<NetworkSignature>>,
    discoverers_override: parking_lot::RwLock<Option<Vec<Arc<dyn Discoverer>>>>,
}

/// Drives the full blast pipeline and publishes progress.
///
/// The orchestrator is a long-lived actor: `start`/`discover_only` spawn one
/// pipeline task, `stop` cancels it cooperatively, and `on_network_change`
/// feeds the recovery path. Calling `start` while a blast is in progress is
/// rejected with [`BlastError::Busy`]; `stop` when idle is a no-op.
pub struct BlastOrchestrator {
    inner: Arc<Inner>,
}

impl BlastOrchestrator {
    /// Creates an idle orchestrator.
    #[must_use]
    pub fn new(
        network: NetworkContext,
        http: Client,
        sink: Arc<dyn MetricsSink>,
        spawner: TokioSpawner,
    ) -> Self {
        let bus = Arc::new(DiscoveryBus::new(http.clone()));
        let server = ClipServer::new(network.clone(), http.clone());
        let (signature_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                network,
                http,
                bus,
                server,
                sink,
                spawner,
                state: parking_lot::Mutex::new(RunState::Idle),
                last_metrics: Arc::new(RwLock::new(Metrics::default())),
                signature_tx,
                discoverers_override: parking_lot::RwLock::new(None),
            }),
        }
    }

    /// Creates an orchestrator with its own HTTP client.
    ///
    /// Convenience for embedders that have no client to share.
    #[must_use]
    pub fn with_default_client(
        network: NetworkContext,
        sink: Arc<dyn MetricsSink>,
        spawner: TokioSpawner,
    ) -> Self {
        Self::new(network, Client::new(), sink, spawner)
    }

    /// Replaces the standard discoverer set.
    ///
    /// Embedders use this to plug in additional producers; tests use it to
    /// script discovery.
    pub fn set_discoverers(&self, discoverers: Vec<Arc<dyn Discoverer>>) {
        *self.inner.discoverers_override.write() = Some(discoverers);
    }

    /// Starts a full blast for `clip`.
    ///
    /// # Errors
    ///
    /// Returns [`BlastError::Busy`] when a blast is already in progress.
    pub fn start(&self, clip: ClipConfig, cfg: BlastConfig) -> BlastResult<BlastCompletion> {
        self.launch(Some(clip), cfg)
    }

    /// Runs discovery only: no clip server, no control fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`BlastError::Busy`] when a blast is already in progress.
    pub fn discover_only(&self, cfg: BlastConfig) -> BlastResult<BlastCompletion> {
        self.launch(None, cfg)
    }

    fn launch(&self, clip: Option<ClipConfig>, cfg: BlastConfig) -> BlastResult<BlastCompletion> {
        let cancel = {
            let mut state = self.inner.state.lock();
            if matches!(*state, RunState::Running { .. }) {
                return Err(BlastError::Busy);
            }
            let cancel = CancellationToken::new();
            *state = RunState::Running {
                cancel: cancel.clone(),
            };
            cancel
        };

        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner
            .spawner
            .spawn(run_pipeline(inner, clip, cfg, cancel, done_tx));
        Ok(done_rx)
    }

    /// Requests cooperative cancellation of the running blast.
    ///
    /// In-flight requests complete or time out normally; cancelled control
    /// tasks record a `cancelled` outcome. No-op when idle.
    pub fn stop(&self) {
        if let RunState::Running { cancel } = &*self.inner.state.lock() {
            log::info!("[Blast] Stop requested");
            cancel.cancel();
        }
    }

    /// Feeds a network-signature change into the pipeline.
    ///
    /// Always invalidates the discovery cache. When a blast is in progress
    /// and the signature actually differs, the pipeline aborts its discovery
    /// window and retries with exponential backoff.
    pub fn on_network_change(&self, signature: NetworkSignature) {
        log::info!("[Blast] Network change reported: {}", signature);
        self.inner.bus.invalidate_cache();
        self.inner.signature_tx.send_replace(Some(signature));
    }

    /// Last published metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.inner.last_metrics.read().clone()
    }

    /// Whether no blast is currently running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(*self.inner.state.lock(), RunState::Idle)
    }
}

enum Interrupt {
    NetworkChanged,
    Fatal(BlastError),
}

/// The single pipeline task for one blast operation.
async fn run_pipeline(
    inner: Arc<Inner>,
    clip: Option<ClipConfig>,
    cfg: BlastConfig,
    cancel: CancellationToken,
    done: oneshot::Sender<BlastResult<Metrics>>,
) {
    let blast_id = uuid::Uuid::new_v4().to_string();
    log::info!(
        "[Blast] {} starting ({})",
        blast_id,
        if clip.is_some() { "full" } else { "discover-only" }
    );

    let mut rec = Recorder::new(
        blast_id,
        Arc::clone(&inner.sink),
        Arc::clone(&inner.last_metrics),
    );
    let counters = Arc::new(MethodCounters::default());
    rec.attach_counters(Arc::clone(&counters));
    let table: DedupTable = Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let mut sig_rx = inner.signature_tx.subscribe();
    // A change reported while idle belongs to no blast; start fresh.
    let _ = sig_rx.borrow_and_update();

    let result = async {
        let mut attempt: usize = 0;
        loop {
            let outcome = run_once(
                &inner,
                clip.as_ref(),
                &cfg,
                &mut rec,
                &table,
                &counters,
                &cancel,
                &mut sig_rx,
                attempt,
            )
            .await;

            match outcome {
                Ok(()) => {
                    rec.finalize(&table);
                    return Ok(rec.snapshot());
                }
                Err(Interrupt::Fatal(e)) => return Err(e),
                Err(Interrupt::NetworkChanged) => {
                    if attempt >= NETWORK_CHANGE_BACKOFF_MS.len() {
                        return Err(BlastError::NetworkChangeRetryExhausted {
                            attempts: attempt as u32,
                        });
                    }
                    let backoff = Duration::from_millis(NETWORK_CHANGE_BACKOFF_MS[attempt]);
                    attempt += 1;
                    log::warn!(
                        "[Blast] Network changed; retrying pipeline (attempt {}) in {:?}",
                        attempt,
                        backoff
                    );
                    inner.bus.invalidate_cache();
                    tokio::select! {
                        () = cancel.cancelled() => {
                            rec.finalize(&table);
                            return Ok(rec.snapshot());
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
    .await;

    inner.server.stop();
    if let Err(ref e) = result {
        log::error!("[Blast] {} failed: {}", rec.blast_id, e);
        rec.fail();
    } else {
        log::info!("[Blast] {} finished", rec.blast_id);
    }
    *inner.state.lock() = RunState::Idle;
    let _ = done.send(result);
}

/// Spawns control tasks gated by the fan-out semaphore.
struct ControlSpawner {
    control: Arc<ControlClient>,
    fanout: Arc<Semaphore>,
    outcome_tx: mpsc::Sender<DeviceOutcome>,
    cancel: CancellationToken,
    clip_url: String,
}

impl ControlSpawner {
    fn spawn(&self, renderer: Renderer) {
        let control = Arc::clone(&self.control);
        let fanout = Arc::clone(&self.fanout);
        let outcome_tx = self.outcome_tx.clone();
        let cancel = self.cancel.clone();
        let clip_url = self.clip_url.clone();

        tokio::spawn(async move {
            let id = renderer.id.clone();

            let permit = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = outcome_tx.send(DeviceOutcome::cancelled(&id)).await;
                    return;
                }
                permit = fanout.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                let _ = outcome_tx.send(DeviceOutcome::cancelled(&id)).await;
                return;
            };

            let started = Instant::now();
            let result = tokio::select! {
                () = cancel.cancelled() => Err(PushFailure {
                    set_uri_ok: false,
                    error: ControlError::Cancelled,
                }),
                r = control.push_clip(&renderer, &clip_url) => r,
            };
            let latency_ms = started.elapsed().as_millis() as u32;

            let outcome = match result {
                Ok(()) => DeviceOutcome::success(&id, latency_ms),
                Err(failure) => match failure.error {
                    ControlError::Cancelled => DeviceOutcome::cancelled(&id),
                    ControlError::Unsupported(_) => DeviceOutcome::unsupported(&id, &failure.error),
                    _ => DeviceOutcome::failed(&id, latency_ms, failure.set_uri_ok, &failure.error),
                },
            };
            let _ = outcome_tx.send(outcome).await;
        });
    }
}

/// One pipeline attempt: server + discovery window + control fan-out.
#[allow(clippy::too_many_arguments)]
async fn run_once(
    inner: &Arc<Inner>,
    clip: Option<&ClipConfig>,
    cfg: &BlastConfig,
    rec: &mut Recorder,
    table: &DedupTable,
    counters: &Arc<MethodCounters>,
    cancel: &CancellationToken,
    sig_rx: &mut watch::Receiver<Option<NetworkSignature>>,
    attempt: usize,
) -> Result<(), Interrupt> {
    let attempt_cancel = cancel.child_token();

    // Server phase (skipped for discover-only).
    let clip_url = match clip {
        Some(config) => {
            rec.set_stage(BlastStage::HttpStarting);
            if inner.server.is_running() {
                // Rebind after a network change: the advertise IP moved.
                inner.server.stop();
            }
            let started = Instant::now();
            inner
                .server
                .start(config.clone())
                .await
                .map_err(|e| Interrupt::Fatal(BlastError::from(e)))?;
            rec.set_http_startup(started.elapsed());
            Some(inner.network.clip_url())
        }
        None => None,
    };

    let signature = inner
        .network
        .current_signature()
        .map_err(|e| Interrupt::Fatal(BlastError::from(e)))?;
    let primary_ip = inner.network.get_local_ip();

    rec.set_stage(BlastStage::Discovering);
    let discovery_started = Instant::now();
    let opts = cfg.discovery_options();
    let override_set = inner.discoverers_override.read().clone();
    let mut session = match override_set {
        Some(set) => inner.bus.discover_with(
            set,
            signature.clone(),
            &opts,
            Arc::clone(table),
            Arc::clone(counters),
            attempt_cancel.clone(),
        ),
        None => inner.bus.discover(
            primary_ip,
            signature.clone(),
            &opts,
            Arc::clone(table),
            Arc::clone(counters),
            attempt_cancel.clone(),
        ),
    };

    let (outcome_tx, mut outcome_rx) = mpsc::channel::<DeviceOutcome>(64);
    let spawner = clip_url.as_ref().map(|url| ControlSpawner {
        control: Arc::new(ControlClient::with_timeout(
            inner.http.clone(),
            Duration::from_millis(cfg.soap_timeout_ms),
        )),
        fanout: Arc::new(Semaphore::new(cfg.fanout_parallelism.max(1))),
        outcome_tx: outcome_tx.clone(),
        cancel: attempt_cancel.clone(),
        clip_url: url.clone(),
    });

    // After a network-change retry, renderers that never completed get
    // re-queued; discovery will re-find and silently merge them.
    if attempt > 0 {
        if let Some(spawner) = &spawner {
            let replay: Vec<Renderer> = {
                let table = table.lock();
                table
                    .values()
                    .filter(|r| r.is_controllable() && !rec.has_succeeded(&r.id))
                    .cloned()
                    .collect()
            };
            for renderer in replay {
                rec.set_stage(BlastStage::Blasting);
                log::info!("[Blast] Re-queueing {} after network change", renderer.id);
                spawner.spawn(renderer);
            }
        }
    }

    // Fan-in/fan-out: renderers in, outcomes out, until the window closes.
    let mut network_changed = false;
    loop {
        tokio::select! {
            maybe = session.renderers.next() => match maybe {
                None => break, // discovery window closed
                Some(renderer) => {
                    rec.record_renderer(&renderer);
                    match &spawner {
                        None => {} // discover-only: report, never control
                        Some(spawner) => {
                            if renderer.is_controllable() {
                                rec.set_stage(BlastStage::Blasting);
                                spawner.spawn(renderer);
                            } else {
                                rec.record_outcome(DeviceOutcome::unsupported(
                                    &renderer.id,
                                    &ControlError::Unsupported(renderer.kind),
                                ));
                            }
                        }
                    }
                }
            },
            Some(outcome) = outcome_rx.recv() => rec.record_outcome(outcome),
            changed = sig_rx.changed() => {
                if changed.is_ok() {
                    let reported = sig_rx.borrow_and_update().clone();
                    if let Some(reported) = reported {
                        if reported != signature {
                            log::warn!(
                                "[Blast] Network signature changed: {} -> {}",
                                signature,
                                reported
                            );
                            network_changed = true;
                            break;
                        }
                    }
                }
            },
            () = cancel.cancelled() => break,
        }
    }

    if network_changed || cancel.is_cancelled() {
        attempt_cancel.cancel();
    }
    rec.add_discovery_elapsed(discovery_started.elapsed());
    if !network_changed {
        rec.set_stage(BlastStage::Completing);
    }

    // Drain in-flight control tasks; each observes cancellation at its next
    // suspension point and reports its own outcome.
    drop(spawner);
    drop(outcome_tx);
    while let Some(outcome) = outcome_rx.recv().await {
        rec.record_outcome(outcome);
    }

    if network_changed {
        return Err(Interrupt::NetworkChanged);
    }
    Ok(())
}

/// Single-writer metrics/outcome state for one blast.
///
/// Owned by the pipeline task; every mutation publishes a fresh snapshot to
/// the sink and the shared last-metrics slot.
struct Recorder {
    blast_id: String,
    started: Instant,
    metrics: Metrics,
    outcomes: Vec<DeviceOutcome>,
    succeeded: HashSet<String>,
    sink: Arc<dyn MetricsSink>,
    shared: Arc<RwLock<Metrics>>,
    counters: Option<Arc<MethodCounters>>,
}

impl Recorder {
    fn new(blast_id: String, sink: Arc<dyn MetricsSink>, shared: Arc<RwLock<Metrics>>) -> Self {
        let mut rec = Self {
            blast_id,
            started: Instant::now(),
            metrics: Metrics::default(),
            outcomes: Vec::new(),
            succeeded: HashSet::new(),
            sink,
            shared,
            counters: None,
        };
        rec.publish();
        rec
    }

    fn snapshot(&self) -> Metrics {
        self.metrics.clone()
    }

    fn publish(&mut self) {
        if let Some(counters) = &self.counters {
            self.metrics.devices_by_method = counters.snapshot();
        }
        self.metrics.blast_elapsed_ms = self.started.elapsed().as_millis() as u64;
        *self.shared.write() = self.metrics.clone();
        self.sink.emit_metrics(MetricsEvent::Snapshot {
            blast_id: self.blast_id.clone(),
            metrics: self.metrics.clone(),
            timestamp: now_millis(),
        });
    }

    fn set_stage(&mut self, stage: BlastStage) {
        // Stage ordinals never decrease within a blast.
        if stage.ordinal() < self.metrics.stage.ordinal() || stage == self.metrics.stage {
            return;
        }
        log::info!("[Blast] {} stage: {}", self.blast_id, stage);
        self.metrics.stage = stage;
        self.sink.emit_stage(StageEvent::Changed {
            blast_id: self.blast_id.clone(),
            stage,
            timestamp: now_millis(),
        });
        self.publish();
    }

    fn set_http_startup(&mut self, elapsed: Duration) {
        self.metrics.http_startup_ms = elapsed.as_millis() as u64;
        self.publish();
    }

    fn add_discovery_elapsed(&mut self, elapsed: Duration) {
        self.metrics.discovery_elapsed_ms += elapsed.as_millis() as u64;
        self.publish();
    }

    fn record_renderer(&mut self, renderer: &Renderer) {
        self.metrics.devices_found_total += 1;
        self.sink.emit_renderer(RendererEvent::Discovered {
            renderer: renderer.clone(),
            timestamp: now_millis(),
        });
        self.publish();
    }

    fn record_outcome(&mut self, outcome: DeviceOutcome) {
        if outcome.is_success() {
            self.metrics.connections_attempted += 1;
            self.metrics.successes += 1;
            self.succeeded.insert(outcome.renderer_id.clone());
            self.metrics
                .per_device_latency_ms
                .insert(outcome.renderer_id.clone(), outcome.latency_ms);
        } else if outcome.is_failure() {
            self.metrics.connections_attempted += 1;
            self.metrics.failures += 1;
            self.metrics
                .per_device_latency_ms
                .insert(outcome.renderer_id.clone(), outcome.latency_ms);
        }
        self.sink.emit_outcome(OutcomeEvent::Recorded {
            outcome: outcome.clone(),
            timestamp: now_millis(),
        });
        self.outcomes.push(outcome);
        self.publish();
    }

    fn has_succeeded(&self, renderer_id: &str) -> bool {
        self.succeeded.contains(renderer_id)
    }

    fn attach_counters(&mut self, counters: Arc<MethodCounters>) {
        self.counters = Some(counters);
    }

    fn finalize(&mut self, table: &DedupTable) {
        {
            let table = table.lock();
            self.metrics.devices_found_total = table.len() as u32;
            self.metrics.success_rate_by_manufacturer =
                metrics::success_rates_by_manufacturer(&self.outcomes, &table);
        }
        if self.metrics.devices_found_total == 0 {
            log::warn!("[Blast] {} found no renderers", self.blast_id);
        }
        self.set_stage(BlastStage::Completed);
    }

    fn fail(&mut self) {
        self.set_stage(BlastStage::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;

    use crate::discovery::test_support::ScriptedDiscoverer;
    use crate::discovery::{DiscoverySource, RendererKind};
    use crate::events::{BlastEvent, BroadcastEventBridge};

    /// Recorded SOAP posts against the mock renderer.
    type Recorded = Arc<parking_lot::Mutex<Vec<(String, String)>>>;

    #[derive(Clone)]
    struct MockState {
        recorded: Recorded,
        fail_play_status: Option<u16>,
    }

    async fn control_handler(
        State(state): State<MockState>,
        headers: HeaderMap,
        body: String,
    ) -> (StatusCode, String) {
        let action = headers
            .get("SOAPAction")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let is_play = action.contains("#Play");
        state.recorded.lock().push((action, body));
        if is_play {
            if let Some(status) = state.fail_play_status {
                return (StatusCode::from_u16(status).unwrap(), "fault".to_string());
            }
        }
        (StatusCode::OK, "<s:Envelope/>".to_string())
    }

    async fn start_mock_renderer(fail_play_status: Option<u16>) -> (u16, Recorded) {
        let recorded: Recorded = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let state = MockState {
            recorded: Arc::clone(&recorded),
            fail_play_status,
        };
        let app = Router::new()
            .route("/MediaRenderer/AVTransport/Control", post(control_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (port, recorded)
    }

    fn sonos(port: u16) -> Renderer {
        let mut r = Renderer::new(Ipv4Addr::new(127, 0, 0, 1), port, DiscoverySource::Ssdp);
        r.kind = RendererKind::Sonos;
        r.friendly_name = "Living Room".into();
        r.control_path = "/MediaRenderer/AVTransport/Control".into();
        r.metadata
            .insert("manufacturer".into(), "Sonos, Inc.".into());
        r
    }

    fn chromecast(port: u16, source: DiscoverySource) -> Renderer {
        let mut r = Renderer::new(Ipv4Addr::new(127, 0, 0, 1), port, source);
        r.kind = RendererKind::Chromecast;
        r.friendly_name = "Kitchen display".into();
        r.control_path = "/setup/eureka_info".into();
        r
    }

    fn orchestrator(sink: Arc<dyn MetricsSink>) -> BlastOrchestrator {
        BlastOrchestrator::new(
            NetworkContext::for_test(),
            Client::new(),
            sink,
            TokioSpawner::current(),
        )
    }

    fn fast_cfg() -> BlastConfig {
        BlastConfig {
            discovery_timeout_ms: 300,
            ..BlastConfig::default()
        }
    }

    fn test_clip() -> ClipConfig {
        ClipConfig::local(Bytes::from_static(b"blast-clip"), "audio/mpeg")
    }

    #[tokio::test]
    async fn happy_path_single_sonos() {
        let (port, recorded) = start_mock_renderer(None).await;
        let bridge = Arc::new(BroadcastEventBridge::default());
        let mut events = bridge.subscribe();

        let orch = orchestrator(bridge);
        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos(port)],
        ))]);

        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();

        assert_eq!(metrics.stage, BlastStage::Completed);
        assert_eq!(metrics.devices_found_total, 1);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.connections_attempted, 1);
        assert_eq!(metrics.success_rate_by_manufacturer["Sonos, Inc."], 1.0);
        assert!(metrics.per_device_latency_ms.contains_key(&format!(
            "127.0.0.1:{}",
            port
        )));
        assert!(orch.is_idle());

        // The renderer was pointed at the clip endpoint.
        let posts = recorded.lock();
        assert_eq!(posts.len(), 2);
        assert!(posts[0].1.contains("/media/current</CurrentURI>"));

        // Stage ordinals in the event stream never decrease.
        let mut last = 0u8;
        while let Ok(event) = events.try_recv() {
            if let BlastEvent::Stage(StageEvent::Changed { stage, .. }) = event {
                assert!(stage.ordinal() >= last, "stage went backwards");
                last = stage.ordinal();
            }
        }
        assert_eq!(last, BlastStage::Completed.ordinal());
    }

    #[tokio::test]
    async fn heterogeneous_lan_skips_chromecast() {
        let (port, _recorded) = start_mock_renderer(None).await;
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));

        // SSDP reports a Sonos and a Chromecast; the port scan re-reports
        // the same Chromecast.
        let cast_port = 8008;
        orch.set_discoverers(vec![
            Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::Ssdp,
                vec![sonos(port), chromecast(cast_port, DiscoverySource::Ssdp)],
            )),
            Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::PortScan,
                vec![chromecast(cast_port, DiscoverySource::PortScan)],
            )),
        ]);

        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();

        assert_eq!(metrics.devices_found_total, 2);
        assert_eq!(metrics.connections_attempted, 1);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 0);
        // Duplicate-source hit shows up in the per-method counts.
        assert_eq!(metrics.devices_by_method.ssdp, 2);
        assert_eq!(metrics.devices_by_method.port_scan, 1);
        assert!(metrics.devices_by_method.sum() > metrics.devices_found_total);
    }

    #[tokio::test]
    async fn discover_only_never_binds_or_controls() {
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));
        orch.set_discoverers(vec![
            Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::Ssdp,
                vec![sonos(1400), chromecast(8008, DiscoverySource::Ssdp)],
            )),
            Arc::new(ScriptedDiscoverer::new(
                DiscoverySource::Mdns,
                vec![chromecast(8009, DiscoverySource::Mdns)],
            )),
        ]);

        let done = orch.discover_only(fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();

        assert_eq!(metrics.stage, BlastStage::Completed);
        assert_eq!(metrics.devices_found_total, 3);
        assert_eq!(metrics.connections_attempted, 0);
        assert_eq!(metrics.successes, 0);
        assert_eq!(metrics.http_startup_ms, 0, "server never started");
        assert_eq!(orch.inner.network.get_port(), 0, "no port bound");
    }

    #[tokio::test]
    async fn soap_fault_on_play_is_nonfatal() {
        let (port, _recorded) = start_mock_renderer(Some(500)).await;
        let bridge = Arc::new(BroadcastEventBridge::default());
        let mut events = bridge.subscribe();

        let orch = orchestrator(bridge);
        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos(port)],
        ))]);

        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();

        assert_eq!(metrics.stage, BlastStage::Completed, "fault is per-device");
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.successes, 0);

        let mut saw_outcome = false;
        while let Ok(event) = events.try_recv() {
            if let BlastEvent::Outcome(OutcomeEvent::Recorded { outcome, .. }) = event {
                saw_outcome = true;
                assert!(outcome.set_uri_ok);
                assert!(!outcome.play_ok);
                assert_eq!(outcome.error.as_ref().unwrap().kind, "soap_fault");
            }
        }
        assert!(saw_outcome);
    }

    #[tokio::test]
    async fn zero_devices_is_completed_not_failed() {
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));
        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![],
        ))]);

        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();
        assert_eq!(metrics.stage, BlastStage::Completed);
        assert_eq!(metrics.devices_found_total, 0);
    }

    #[tokio::test]
    async fn concurrent_start_is_rejected_and_stop_when_idle_is_noop() {
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));
        orch.stop(); // idle: no-op

        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![],
        ))]);
        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let busy = orch.start(test_clip(), fast_cfg());
        assert!(matches!(busy, Err(BlastError::Busy)));
        let _ = done.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restart_after_completion_works_twice() {
        let (port, _recorded) = start_mock_renderer(None).await;
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));
        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos(port)],
        ))]);

        for _ in 0..2 {
            let done = orch.start(test_clip(), fast_cfg()).unwrap();
            orch.stop(); // cooperative; pipeline still terminates cleanly
            let metrics = done.await.unwrap().unwrap();
            assert_eq!(metrics.stage, BlastStage::Completed);
            assert!(orch.is_idle());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_change_retries_discovery() {
        let orch = orchestrator(Arc::new(crate::events::NoopMetricsSink));

        let mut slow = ScriptedDiscoverer::new(DiscoverySource::Ssdp, vec![sonos(1400)]);
        slow.delay = Duration::from_millis(500);
        let calls = Arc::clone(&slow.calls);
        orch.set_discoverers(vec![Arc::new(slow)]);

        let cfg = BlastConfig {
            discovery_timeout_ms: 2000,
            ..BlastConfig::default()
        };
        let done = orch.discover_only(cfg).unwrap();

        // Report a different attachment while the first window is open.
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.on_network_change(NetworkSignature {
            primary_ipv4: Ipv4Addr::new(10, 9, 8, 7),
            iface_name: "wlan1".into(),
            ssid: Some("OtherNet".into()),
        });

        let metrics = done.await.unwrap().unwrap();
        assert_eq!(metrics.stage, BlastStage::Completed);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            2,
            "discovery ran a second window after the change"
        );
        assert_eq!(metrics.devices_found_total, 1);
    }

    #[tokio::test]
    async fn outcome_partition_covers_all_outcomes() {
        let (port, _recorded) = start_mock_renderer(None).await;
        let bridge = Arc::new(BroadcastEventBridge::default());
        let mut events = bridge.subscribe();

        let orch = orchestrator(bridge);
        orch.set_discoverers(vec![Arc::new(ScriptedDiscoverer::new(
            DiscoverySource::Ssdp,
            vec![sonos(port), chromecast(8008, DiscoverySource::Ssdp)],
        ))]);

        let done = orch.start(test_clip(), fast_cfg()).unwrap();
        let metrics = done.await.unwrap().unwrap();

        let mut successes = 0u32;
        let mut failures = 0u32;
        let mut unsupported = 0u32;
        let mut cancelled = 0u32;
        let mut total = 0u32;
        while let Ok(event) = events.try_recv() {
            if let BlastEvent::Outcome(OutcomeEvent::Recorded { outcome, .. }) = event {
                total += 1;
                if outcome.is_success() {
                    successes += 1;
                } else if outcome.is_unsupported() {
                    unsupported += 1;
                } else if outcome.is_cancelled() {
                    cancelled += 1;
                } else {
                    failures += 1;
                }
            }
        }
        assert_eq!(successes + failures + unsupported + cancelled, total);
        assert_eq!(successes, metrics.successes);
        assert_eq!(failures, metrics.failures);
        assert_eq!(unsupported, 1);
    }
}
