//! UPnP AVTransport control.
//!
//! Executes the two-step SetAVTransportURI → Play sequence (and Stop)
//! against discovered renderers:
//!
//! - `soap` - byte-exact SOAP envelope construction
//! - `client` - HTTP transport, reachability probing, fault mapping

pub mod client;
pub mod soap;

use thiserror::Error;

use crate::discovery::RendererKind;

pub use client::{ControlClient, PushFailure};
pub use soap::AvAction;

/// Errors from a control attempt against one renderer.
///
/// All of these are recorded in the per-device outcome and never fail the
/// blast.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The renderer's kind has no AVTransport service.
    #[error("renderer kind {0:?} is not UPnP-controllable")]
    Unsupported(RendererKind),

    /// TCP connect to the control port failed (refused/unreachable/timeout).
    #[error("renderer unreachable: {0}")]
    Unreachable(String),

    /// The renderer answered a SOAP post with a non-success status.
    #[error("SOAP fault: HTTP {status}: {body_snippet}")]
    SoapFault {
        /// HTTP status code of the response.
        status: u16,
        /// Leading bytes of the response body for diagnostics.
        body_snippet: String,
    },

    /// A SOAP post exceeded its wall-clock budget.
    #[error("SOAP {0} timed out")]
    Timeout(&'static str),

    /// The HTTP request failed below the protocol level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The control task was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,
}

/// Convenient Result alias for control operations.
pub type ControlResult<T> = Result<T, ControlError>;
