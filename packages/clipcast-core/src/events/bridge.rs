//! Bridge implementation that maps blast events to broadcast transport.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between the
//! orchestrator and whatever embeds it, mapping typed events to a
//! `tokio::sync::broadcast` channel consumers subscribe to. This is the
//! typed control-plane channel between the core and its trigger source.

use tokio::sync::broadcast;

use super::emitter::MetricsSink;
use super::{BlastEvent, MetricsEvent, OutcomeEvent, RendererEvent, StageEvent};
use crate::protocol_constants::EVENT_CHANNEL_CAPACITY;

/// Bridges blast events to a broadcast channel.
///
/// Implements [`MetricsSink`] by forwarding events to a channel; slow or
/// absent consumers never block the pipeline (the channel drops the oldest
/// events on overflow).
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BlastEvent>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BlastEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBridge {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

/// Generates a [`MetricsSink`] method that sends to the broadcast channel.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Err(e) = self.tx.send(BlastEvent::$variant(event)) {
                log::trace!("[EventBridge] No broadcast receivers: {}", e);
            }
        }
    };
}

impl MetricsSink for BroadcastEventBridge {
    impl_emit!(emit_stage, StageEvent, Stage);
    impl_emit!(emit_metrics, MetricsEvent, Metrics);
    impl_emit!(emit_renderer, RendererEvent, Renderer);
    impl_emit!(emit_outcome, OutcomeEvent, Outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blast::metrics::BlastStage;

    #[tokio::test]
    async fn bridge_delivers_events_to_subscribers() {
        let bridge = BroadcastEventBridge::new(8);
        let mut rx = bridge.subscribe();

        bridge.emit_stage(StageEvent::Changed {
            blast_id: "b1".into(),
            stage: BlastStage::HttpStarting,
            timestamp: 42,
        });

        match rx.recv().await.unwrap() {
            BlastEvent::Stage(StageEvent::Changed { stage, .. }) => {
                assert_eq!(stage, BlastStage::HttpStarting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bridge = BroadcastEventBridge::default();
        bridge.emit_stage(StageEvent::Changed {
            blast_id: "b1".into(),
            stage: BlastStage::Completed,
            timestamp: 0,
        });
    }
}
