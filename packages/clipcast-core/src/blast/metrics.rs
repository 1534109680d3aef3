//! Blast progress metrics and per-device outcomes.
//!
//! A [`Metrics`] snapshot is published whenever any sub-stage advances;
//! consumers coalesce. Mutation is single-writer: only the orchestrator task
//! touches the live snapshot, everyone else sees published copies.

use std::collections::HashMap;

use serde::Serialize;

use crate::control::ControlError;
use crate::discovery::{MethodCounts, Renderer};
use crate::error::ErrorCode;

/// Pipeline stage of a blast operation.
///
/// Ordinals are monotonically non-decreasing within a blast; `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BlastStage {
    /// Nothing running.
    Idle,
    /// Binding the clip server.
    HttpStarting,
    /// Discovery window open.
    Discovering,
    /// Control fan-out in flight (notional; overlaps discovery).
    Blasting,
    /// Discovery closed, draining control tasks.
    Completing,
    /// Terminal: pipeline finished (zero devices is still Completed).
    Completed,
    /// Terminal: a fatal error aborted the pipeline.
    Failed,
}

impl BlastStage {
    /// Position in the stage ordering, for monotonicity checks.
    #[must_use]
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::HttpStarting => 1,
            Self::Discovering => 2,
            Self::Blasting => 3,
            Self::Completing => 4,
            Self::Completed => 5,
            Self::Failed => 6,
        }
    }

    /// Whether the stage ends the operation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BlastStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::HttpStarting => "http-starting",
            Self::Discovering => "discovering",
            Self::Blasting => "blasting",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Structured error attached to a failed outcome.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeError {
    /// Stable machine-readable code (see [`ErrorCode`]).
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl From<&ControlError> for OutcomeError {
    fn from(err: &ControlError) -> Self {
        Self {
            kind: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Terminal record for one renderer within a blast.
///
/// Produced by exactly one control task and never mutated after publication.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOutcome {
    /// Renderer this outcome belongs to.
    pub renderer_id: String,
    /// Whether a control sequence was attempted at all.
    pub attempted: bool,
    /// SetAVTransportURI succeeded.
    pub set_uri_ok: bool,
    /// Play succeeded.
    pub play_ok: bool,
    /// Wall-clock duration of the control attempt.
    pub latency_ms: u32,
    /// Error detail when anything short of full success happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl DeviceOutcome {
    /// A fully successful control sequence.
    #[must_use]
    pub fn success(renderer_id: impl Into<String>, latency_ms: u32) -> Self {
        Self {
            renderer_id: renderer_id.into(),
            attempted: true,
            set_uri_ok: true,
            play_ok: true,
            latency_ms,
            error: None,
        }
    }

    /// A control sequence that failed at some step.
    ///
    /// `set_uri_ok` distinguishes a Play-step fault from a SetURI-step fault.
    #[must_use]
    pub fn failed(
        renderer_id: impl Into<String>,
        latency_ms: u32,
        set_uri_ok: bool,
        error: &ControlError,
    ) -> Self {
        Self {
            renderer_id: renderer_id.into(),
            attempted: true,
            set_uri_ok,
            play_ok: false,
            latency_ms,
            error: Some(OutcomeError::from(error)),
        }
    }

    /// A renderer skipped because its kind has no AVTransport service.
    #[must_use]
    pub fn unsupported(renderer_id: impl Into<String>, error: &ControlError) -> Self {
        Self {
            renderer_id: renderer_id.into(),
            attempted: false,
            set_uri_ok: false,
            play_ok: false,
            latency_ms: 0,
            error: Some(OutcomeError::from(error)),
        }
    }

    /// A control task cancelled by cooperative stop.
    #[must_use]
    pub fn cancelled(renderer_id: impl Into<String>) -> Self {
        Self {
            renderer_id: renderer_id.into(),
            attempted: true,
            set_uri_ok: false,
            play_ok: false,
            latency_ms: 0,
            error: Some(OutcomeError::from(&ControlError::Cancelled)),
        }
    }

    /// Full success: both steps acknowledged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.set_uri_ok && self.play_ok
    }

    /// Whether this outcome carries the given error code.
    fn has_kind(&self, kind: &str) -> bool {
        self.error.as_ref().is_some_and(|e| e.kind == kind)
    }

    /// Skipped as not UPnP-controllable.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        self.has_kind("unsupported")
    }

    /// Cancelled by cooperative stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.has_kind("cancelled")
    }

    /// Attempted and finished with an error (excludes unsupported/cancelled).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_unsupported() && !self.is_cancelled()
    }
}

/// Live snapshot of a blast's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Current pipeline stage.
    pub stage: BlastStage,
    /// How long the clip server took to bind.
    pub http_startup_ms: u64,
    /// Elapsed discovery time (live while Discovering, final afterwards).
    pub discovery_elapsed_ms: u64,
    /// Total elapsed blast time.
    pub blast_elapsed_ms: u64,
    /// Unique renderers in the dedup table.
    pub devices_found_total: u32,
    /// Raw per-method candidate counts (duplicates included).
    pub devices_by_method: MethodCounts,
    /// Control sequences started (controllable, not cancelled).
    pub connections_attempted: u32,
    /// Fully successful control sequences.
    pub successes: u32,
    /// Attempted control sequences that failed.
    pub failures: u32,
    /// Per-renderer control latency.
    pub per_device_latency_ms: HashMap<String, u32>,
    /// Success ratio per manufacturer, in [0, 1].
    pub success_rate_by_manufacturer: HashMap<String, f32>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            stage: BlastStage::Idle,
            http_startup_ms: 0,
            discovery_elapsed_ms: 0,
            blast_elapsed_ms: 0,
            devices_found_total: 0,
            devices_by_method: MethodCounts::default(),
            connections_attempted: 0,
            successes: 0,
            failures: 0,
            per_device_latency_ms: HashMap::new(),
            success_rate_by_manufacturer: HashMap::new(),
        }
    }
}

/// Manufacturer bucket used when a renderer carries no metadata.
const UNKNOWN_MANUFACTURER: &str = "Unknown";

/// Computes per-manufacturer success rates from outcomes.
///
/// Only attempted, non-cancelled outcomes count toward a manufacturer's
/// denominator; unsupported and cancelled devices say nothing about whether
/// the vendor's AVTransport works.
#[must_use]
pub fn success_rates_by_manufacturer(
    outcomes: &[DeviceOutcome],
    renderers: &HashMap<String, Renderer>,
) -> HashMap<String, f32> {
    let mut attempts: HashMap<String, (u32, u32)> = HashMap::new();

    for outcome in outcomes {
        if !outcome.attempted || outcome.is_cancelled() {
            continue;
        }
        let manufacturer = renderers
            .get(&outcome.renderer_id)
            .and_then(|r| r.metadata.get("manufacturer"))
            .cloned()
            .unwrap_or_else(|| UNKNOWN_MANUFACTURER.to_string());
        let entry = attempts.entry(manufacturer).or_insert((0, 0));
        entry.1 += 1;
        if outcome.is_success() {
            entry.0 += 1;
        }
    }

    attempts
        .into_iter()
        .map(|(manufacturer, (ok, total))| (manufacturer, ok as f32 / total as f32))
        .collect()
}
