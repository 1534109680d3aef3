//! Clipcast Server - Standalone headless blaster.
//!
//! This binary drives one blast operation from the command line: serve the
//! given clip, discover every renderer on the LAN, and push the clip to each
//! of them. With `--discover-only` it just lists what it finds.

mod config;
mod resolver;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clipcast_core::events::{OutcomeEvent, RendererEvent, StageEvent};
use clipcast_core::{
    BlastEvent, BlastOrchestrator, BroadcastEventBridge, LocalIpDetector, MetricsSink,
    NetworkContext, TokioSpawner,
};
use tokio::signal;

use crate::config::ServerConfig;

/// Clipcast Server - blast an audio clip to every renderer on the LAN.
#[derive(Parser, Debug)]
#[command(name = "clipcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Clip to blast: a local audio file or an http(s) stream URL.
    /// Not required with --discover-only.
    clip: Option<String>,

    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CLIPCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Content type override for the clip.
    #[arg(short, long)]
    mime: Option<String>,

    /// Only discover and list renderers; do not serve or play anything.
    #[arg(long)]
    discover_only: bool,

    /// Discovery window in milliseconds (overrides config file).
    #[arg(short = 't', long, env = "CLIPCAST_DISCOVERY_TIMEOUT_MS")]
    discovery_timeout_ms: Option<u64>,

    /// Concurrent control tasks (overrides config file).
    #[arg(short = 'f', long, env = "CLIPCAST_FANOUT")]
    fanout: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Clipcast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(ms) = args.discovery_timeout_ms {
        config.discovery_timeout_ms = ms;
    }
    if let Some(n) = args.fanout {
        config.fanout_parallelism = n;
    }
    let blast_config = config.to_blast_config();

    let network = NetworkContext::new(LocalIpDetector::arc()).context(
        "Failed to detect a LAN interface. Clipcast needs a non-loopback \
         IPv4 address that renderers can reach.",
    )?;

    let bridge = Arc::new(BroadcastEventBridge::default());
    let mut events = bridge.subscribe();
    let orchestrator = BlastOrchestrator::with_default_client(
        network,
        Arc::clone(&bridge) as Arc<dyn MetricsSink>,
        TokioSpawner::current(),
    );

    // Progress printer: one line per discovery and per outcome.
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BlastEvent::Renderer(RendererEvent::Discovered { renderer, .. }) => {
                    log::info!(
                        "Found {} at {} ({:?}, via {})",
                        renderer.friendly_name,
                        renderer.id,
                        renderer.kind,
                        renderer.source
                    );
                }
                BlastEvent::Outcome(OutcomeEvent::Recorded { outcome, .. }) => {
                    if outcome.is_success() {
                        log::info!("{}: playing ({}ms)", outcome.renderer_id, outcome.latency_ms);
                    } else if let Some(error) = &outcome.error {
                        log::warn!("{}: {} ({})", outcome.renderer_id, error.message, error.kind);
                    }
                }
                BlastEvent::Stage(StageEvent::Changed { stage, .. }) => {
                    log::debug!("stage: {}", stage);
                }
                BlastEvent::Metrics(_) => {} // coalesced into the final summary
            }
        }
    });

    let completion = if args.discover_only {
        orchestrator
            .discover_only(blast_config)
            .context("Failed to start discovery")?
    } else {
        let clip_arg = args
            .clip
            .as_deref()
            .context("A clip file or URL is required (or pass --discover-only)")?;
        let clip = resolver::resolve_clip(clip_arg, args.mime.as_deref())?;
        orchestrator
            .start(clip, blast_config)
            .context("Failed to start blast")?
    };

    // Run until the pipeline finishes or the user interrupts it.
    let result = tokio::select! {
        result = completion => result.context("Pipeline task dropped")?,
        () = shutdown_signal() => {
            log::info!("Shutdown signal received, stopping...");
            orchestrator.stop();
            // stop() is cooperative; the pipeline still reports its metrics.
            orchestrator_wait(&orchestrator).await;
            printer.abort();
            return Ok(());
        }
    };
    printer.abort();

    let metrics = result.context("Blast failed")?;
    log::info!(
        "Done: {} renderer(s), {} ok, {} failed, discovery {}ms, total {}ms",
        metrics.devices_found_total,
        metrics.successes,
        metrics.failures,
        metrics.discovery_elapsed_ms,
        metrics.blast_elapsed_ms
    );
    for (manufacturer, rate) in &metrics.success_rate_by_manufacturer {
        log::info!("  {}: {:.0}% success", manufacturer, rate * 100.0);
    }
    Ok(())
}

/// Polls until the orchestrator returns to idle after a stop request.
async fn orchestrator_wait(orchestrator: &BlastOrchestrator) {
    while !orchestrator.is_idle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
