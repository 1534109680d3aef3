//! Event system for blast progress communication.
//!
//! This module provides:
//! - [`MetricsSink`] trait for the orchestrator to publish progress
//! - Event types for the control plane between the core and its embedder
//!
//! The transport (CLI printer, GUI bridge, rules engine) subscribes through
//! [`BroadcastEventBridge`]; the core pushes on every field change and
//! consumers are expected to coalesce.

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{LoggingMetricsSink, MetricsSink, NoopMetricsSink};

use serde::Serialize;

use crate::blast::metrics::{BlastStage, DeviceOutcome, Metrics};
use crate::discovery::Renderer;

/// Events broadcast to blast consumers.
///
/// Each category carries its own payload; every event is timestamped at
/// emission with a Unix-milliseconds clock.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BlastEvent {
    /// Pipeline stage transitions.
    Stage(StageEvent),

    /// Full metrics snapshots.
    Metrics(MetricsEvent),

    /// Renderers as they are first seen.
    Renderer(RendererEvent),

    /// Per-device terminal outcomes.
    Outcome(OutcomeEvent),
}

/// Pipeline stage transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StageEvent {
    /// The orchestrator moved to a new stage.
    Changed {
        /// Identifier of the blast run.
        #[serde(rename = "blastId")]
        blast_id: String,
        /// New stage.
        stage: BlastStage,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Metrics snapshot publication.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MetricsEvent {
    /// A field changed; the full snapshot is republished.
    Snapshot {
        /// Identifier of the blast run.
        #[serde(rename = "blastId")]
        blast_id: String,
        /// The snapshot.
        metrics: Metrics,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Renderer discovery notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RendererEvent {
    /// A renderer was emitted by the discovery bus (first sighting only).
    Discovered {
        /// The discovered renderer.
        renderer: Renderer,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Per-device outcome notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutcomeEvent {
    /// A control task finished (success, failure, unsupported or cancelled).
    Recorded {
        /// The outcome record.
        outcome: DeviceOutcome,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

// From implementations for converting inner events to BlastEvent
impl From<StageEvent> for BlastEvent {
    fn from(event: StageEvent) -> Self {
        BlastEvent::Stage(event)
    }
}

impl From<MetricsEvent> for BlastEvent {
    fn from(event: MetricsEvent) -> Self {
        BlastEvent::Metrics(event)
    }
}

impl From<RendererEvent> for BlastEvent {
    fn from(event: RendererEvent) -> Self {
        BlastEvent::Renderer(event)
    }
}

impl From<OutcomeEvent> for BlastEvent {
    fn from(event: OutcomeEvent) -> Self {
        BlastEvent::Outcome(event)
    }
}
