//! Metrics sink abstraction for decoupling the orchestrator from transport.
//!
//! The orchestrator depends on the [`MetricsSink`] trait rather than a
//! concrete channel, enabling testing and alternative delivery (CLI printer,
//! GUI bridge, rules engine).

use super::{MetricsEvent, OutcomeEvent, RendererEvent, StageEvent};

/// Trait for publishing blast progress without knowledge of transport.
pub trait MetricsSink: Send + Sync {
    /// Publishes a stage transition.
    fn emit_stage(&self, event: StageEvent);

    /// Publishes a metrics snapshot.
    fn emit_metrics(&self, event: MetricsEvent);

    /// Publishes a renderer first-sighting.
    fn emit_renderer(&self, event: RendererEvent);

    /// Publishes a per-device outcome.
    fn emit_outcome(&self, event: OutcomeEvent);
}

/// No-op sink for embedders that poll final state instead.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn emit_stage(&self, _event: StageEvent) {
        // No-op
    }

    fn emit_metrics(&self, _event: MetricsEvent) {
        // No-op
    }

    fn emit_renderer(&self, _event: RendererEvent) {
        // No-op
    }

    fn emit_outcome(&self, _event: OutcomeEvent) {
        // No-op
    }
}

/// Logging sink for debugging and development.
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn emit_stage(&self, event: StageEvent) {
        tracing::debug!(?event, "stage_event");
    }

    fn emit_metrics(&self, event: MetricsEvent) {
        tracing::debug!(?event, "metrics_event");
    }

    fn emit_renderer(&self, event: RendererEvent) {
        tracing::debug!(?event, "renderer_event");
    }

    fn emit_outcome(&self, event: OutcomeEvent) {
        tracing::debug!(?event, "outcome_event");
    }
}
