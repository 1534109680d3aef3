//! AVTransport control client.
//!
//! This module handles the HTTP transport for SOAP actions. For the envelope
//! bytes themselves, see `soap.rs`.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;

use super::soap::AvAction;
use super::{ControlError, ControlResult};
use crate::discovery::Renderer;
use crate::protocol_constants::{PROBE_TIMEOUT, SOAP_INTER_CALL_DELAY, SOAP_TIMEOUT};
use crate::utils::extract_xml_text;

/// Maximum response-body bytes kept in a `SoapFault` snippet.
const FAULT_SNIPPET_LEN: usize = 200;

/// A failed push attempt, annotated with how far the sequence got.
#[derive(Debug)]
pub struct PushFailure {
    /// Whether SetAVTransportURI had already been acknowledged.
    pub set_uri_ok: bool,
    /// The error that stopped the sequence.
    pub error: ControlError,
}

impl PushFailure {
    fn before_set_uri(error: ControlError) -> Self {
        Self {
            set_uri_ok: false,
            error,
        }
    }
}

/// Client for the two-step UPnP AVTransport control sequence.
///
/// A per-client async mutex serializes the SetAVTransportURI/Play pair so
/// calls against different targets never interleave on the wire; some
/// renderers share transport state behind one control endpoint.
pub struct ControlClient {
    http: Client,
    soap_timeout: Duration,
    call_lock: Mutex<()>,
}

impl ControlClient {
    /// Creates a control client sharing the pipeline's HTTP client.
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self::with_timeout(http, SOAP_TIMEOUT)
    }

    /// Creates a control client with an explicit per-call timeout.
    #[must_use]
    pub fn with_timeout(http: Client, soap_timeout: Duration) -> Self {
        Self {
            http,
            soap_timeout,
            call_lock: Mutex::new(()),
        }
    }

    /// Pushes the clip URL to a renderer and starts playback.
    ///
    /// Performs SetAVTransportURI, waits 200ms, then Play. Skips
    /// non-controllable kinds with `Unsupported` and unreachable hosts with
    /// `Unreachable` before any SOAP traffic. Failures report whether the
    /// SetURI step had already succeeded.
    pub async fn push_clip(&self, renderer: &Renderer, clip_url: &str) -> Result<(), PushFailure> {
        if !renderer.is_controllable() {
            return Err(PushFailure::before_set_uri(ControlError::Unsupported(
                renderer.kind,
            )));
        }
        self.ensure_reachable(renderer)
            .await
            .map_err(PushFailure::before_set_uri)?;

        let _guard = self.call_lock.lock().await;
        self.send_action(
            renderer,
            &AvAction::SetUri {
                uri: clip_url.to_string(),
            },
        )
        .await
        .map_err(PushFailure::before_set_uri)?;
        tokio::time::sleep(SOAP_INTER_CALL_DELAY).await;
        self.send_action(renderer, &AvAction::Play)
            .await
            .map_err(|error| PushFailure {
                set_uri_ok: true,
                error,
            })?;
        Ok(())
    }

    /// Stops playback on a renderer.
    pub async fn stop(&self, renderer: &Renderer) -> ControlResult<()> {
        if !renderer.is_controllable() {
            return Err(ControlError::Unsupported(renderer.kind));
        }
        self.ensure_reachable(renderer).await?;

        let _guard = self.call_lock.lock().await;
        self.send_action(renderer, &AvAction::Stop).await
    }

    /// Classifies reachability with a bounded TCP connect.
    ///
    /// A successful connect is sufficient; Sonos answers probes with 403 and
    /// Chromecast with 404, so HTTP status is deliberately not consulted.
    async fn ensure_reachable(&self, renderer: &Renderer) -> ControlResult<()> {
        if crate::utils::tcp_reachable(renderer.ip, renderer.port, PROBE_TIMEOUT).await {
            Ok(())
        } else {
            Err(ControlError::Unreachable(renderer.id.clone()))
        }
    }

    /// Posts one SOAP action and maps the response.
    async fn send_action(&self, renderer: &Renderer, action: &AvAction) -> ControlResult<()> {
        let url = renderer.control_url();
        let body = action.envelope();

        log::info!(
            "[SOAP] {} -> {} (body: {} bytes)",
            action.name(),
            url,
            body.len()
        );
        log::debug!("[SOAP] Request body: {}", body);

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", action.soap_action_header())
            .body(body)
            .timeout(self.soap_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ControlError::Timeout(action.name())
                } else {
                    ControlError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        log::info!(
            "[SOAP] {} on {} completed in {:?}: {}",
            action.name(),
            renderer.id,
            started.elapsed(),
            status
        );

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Some(fault) = extract_xml_text(&text, "faultstring") {
                log::warn!("[SOAP] {} fault from {}: {}", action.name(), renderer.id, fault);
            }
            return Err(ControlError::SoapFault {
                status: status.as_u16(),
                body_snippet: text.chars().take(FAULT_SNIPPET_LEN).collect(),
            });
        }
        Ok(())
    }
}
