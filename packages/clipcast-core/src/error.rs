//! Centralized error types for the Clipcast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps every error to a stable machine-readable code via [`ErrorCode`]
//! - Separates fatal pipeline errors from per-device/per-probe degradations

use thiserror::Error;

use crate::context::NetworkError;
use crate::control::ControlError;
use crate::discovery::DiscoveryError;
use crate::server::ServerError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths (logs, event sinks, outcome records).
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for ServerError {
    fn code(&self) -> &'static str {
        match self {
            Self::BindFailed(_) => "bind_failed",
            Self::NoInterface(_) => "no_interface",
            Self::Internal(_) => "server_internal",
        }
    }
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind(_) => "socket_bind_failed",
            Self::NoInterfaces => "no_network_interfaces",
            Self::MdnsDaemon(_) => "mdns_daemon_failed",
            Self::XmlFetch(_) => "xml_fetch_failed",
            Self::XmlParse(_) => "xml_parse_failed",
        }
    }
}

impl ErrorCode for ControlError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported",
            Self::Unreachable(_) => "tcp_unreachable",
            Self::SoapFault { .. } => "soap_fault",
            Self::Timeout(_) => "soap_timeout",
            Self::Transport(_) => "transport_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl ErrorCode for NetworkError {
    fn code(&self) -> &'static str {
        match self {
            Self::Detection(_) => "ip_detection_failed",
            Self::NoInterface => "no_interface",
        }
    }
}

/// Fatal errors for a blast operation.
///
/// Anything that does not appear here is recorded per device or per probe
/// and never fails the pipeline.
#[derive(Debug, Error)]
pub enum BlastError {
    /// The clip server could not bind a listener.
    #[error("Clip server bind failed: {0}")]
    BindFailed(String),

    /// No non-loopback IPv4 interface exists on the host.
    #[error("No non-loopback IPv4 interface available")]
    NoInterface,

    /// A blast is already in progress; concurrent starts are rejected.
    #[error("A blast is already in progress")]
    Busy,

    /// The pipeline was retried after network changes until the budget ran out.
    #[error("Network change retries exhausted after {attempts} attempts")]
    NetworkChangeRetryExhausted {
        /// Number of retry rounds performed.
        attempts: u32,
    },

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlastError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BindFailed(_) => "bind_failed",
            Self::NoInterface => "no_interface",
            Self::Busy => "blast_in_progress",
            Self::NetworkChangeRetryExhausted { .. } => "network_change_retry_exhausted",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<ServerError> for BlastError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::NoInterface(_) => Self::NoInterface,
            ServerError::BindFailed(e) => Self::BindFailed(e.to_string()),
            ServerError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<NetworkError> for BlastError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NoInterface => Self::NoInterface,
            NetworkError::Detection(msg) => Self::BindFailed(msg),
        }
    }
}

/// Convenient Result alias for blast operations.
pub type BlastResult<T> = Result<T, BlastError>;
