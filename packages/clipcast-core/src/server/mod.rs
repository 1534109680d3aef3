//! Embedded single-clip HTTP server.
//!
//! Serves exactly one stable URL, `http://<iface-ip>:<port>/media/current`,
//! backed by whatever clip is currently configured. The clip can be
//! hot-swapped at any time without closing the socket: handlers take an
//! `Arc` snapshot of the configuration at request start, so in-flight
//! responses finish with the clip they began with and later requests see the
//! replacement.
//!
//! - `routes` - the axum router, range handling, and remote proxying

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::{NetworkContext, NetworkError};

/// The clip currently being served.
#[derive(Clone)]
pub enum ClipConfig {
    /// A finite local byte source.
    Local {
        /// Clip body.
        bytes: Bytes,
        /// Content type sent to renderers.
        mime: String,
        /// Body length in bytes.
        length: u64,
    },
    /// A remote stream proxied through the clip endpoint.
    Remote {
        /// Upstream URL, opened on first request.
        url: String,
        /// Content type to advertise when upstream supplies none.
        mime_hint: Option<String>,
    },
}

impl ClipConfig {
    /// Builds a local clip from bytes, deriving the length.
    #[must_use]
    pub fn local(bytes: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        let bytes = bytes.into();
        let length = bytes.len() as u64;
        Self::Local {
            bytes,
            mime: mime.into(),
            length,
        }
    }

    /// Builds a remote clip.
    #[must_use]
    pub fn remote(url: impl Into<String>, mime_hint: Option<String>) -> Self {
        Self::Remote {
            url: url.into(),
            mime_hint,
        }
    }
}

impl std::fmt::Debug for ClipConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { mime, length, .. } => f
                .debug_struct("Local")
                .field("mime", mime)
                .field("length", length)
                .finish(),
            Self::Remote { url, mime_hint } => f
                .debug_struct("Remote")
                .field("url", url)
                .field("mime_hint", mime_hint)
                .finish(),
        }
    }
}

/// Errors from starting the clip server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No listener could be bound.
    #[error("failed to bind listener: {0}")]
    BindFailed(#[from] std::io::Error),

    /// No usable non-loopback IPv4 interface exists.
    #[error("no usable interface: {0}")]
    NoInterface(#[from] NetworkError),

    /// Invariant violation.
    #[error("internal server error: {0}")]
    Internal(String),
}

/// Convenient Result alias for clip server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Single-endpoint HTTP server with hot-swap.
pub struct ClipServer {
    network: NetworkContext,
    http: Client,
    current: Arc<RwLock<Arc<ClipConfig>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl ClipServer {
    /// Creates a stopped clip server.
    #[must_use]
    pub fn new(network: NetworkContext, http: Client) -> Self {
        Self {
            network,
            http,
            current: Arc::new(RwLock::new(Arc::new(ClipConfig::local(
                Bytes::new(),
                "application/octet-stream",
            )))),
            shutdown: Mutex::new(None),
        }
    }

    /// Starts serving `config` and returns the base URL.
    ///
    /// Binds `0.0.0.0` on an OS-chosen ephemeral port and advertises the
    /// primary non-loopback IPv4 address. Fails with `BindFailed` when no
    /// port can be obtained and `NoInterface` when no suitable address
    /// exists; both are fatal to the current blast.
    pub async fn start(&self, config: ClipConfig) -> ServerResult<String> {
        if self.shutdown.lock().is_some() {
            return Err(ServerError::Internal("clip server already running".into()));
        }

        *self.current.write() = Arc::new(config);

        // Refresh the advertise address before binding; the interface may
        // have changed since the context was created.
        self.network.current_signature()?;

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        self.network.set_port(port);

        let token = CancellationToken::new();
        let app = routes::router(routes::ClipState {
            current: Arc::clone(&self.current),
            http: self.http.clone(),
        });
        let serve_token = token.clone();
        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(serve_token.cancelled_owned())
            .await;
            if let Err(e) = result {
                log::error!("[ClipServer] Serve loop ended with error: {}", e);
            }
        });
        *self.shutdown.lock() = Some(token);

        let base_url = self.network.url_builder().base_url();
        log::info!("[ClipServer] Serving at {}{}", base_url, crate::protocol_constants::CLIP_PATH);
        Ok(base_url)
    }

    /// Atomically replaces the served clip.
    ///
    /// Never interrupts an in-flight response: requests already being served
    /// hold their own snapshot of the previous clip.
    pub fn swap(&self, config: ClipConfig) {
        log::info!("[ClipServer] Hot-swap to {:?}", config);
        *self.current.write() = Arc::new(config);
    }

    /// Stops the listener. Idempotent; a stopped server is a no-op.
    pub fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            log::info!("[ClipServer] Stopping");
            token.cancel();
        }
    }

    /// Whether the listener is currently bound.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }
}

impl Drop for ClipServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::CLIP_PATH;

    fn test_server() -> ClipServer {
        ClipServer::new(NetworkContext::for_test(), Client::new())
    }

    #[tokio::test]
    async fn start_serves_local_clip_and_stop_is_idempotent() {
        let server = test_server();
        let base = server
            .start(ClipConfig::local(&b"clip-a-bytes"[..], "audio/mpeg"))
            .await
            .unwrap();
        assert!(base.starts_with("http://127.0.0.1:"));
        assert!(server.is_running());

        let url = format!("{}{}", base, CLIP_PATH);
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "audio/mpeg"
        );
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"clip-a-bytes");

        server.stop();
        assert!(!server.is_running());
        server.stop(); // idempotent
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let server = test_server();
        server
            .start(ClipConfig::local(&b"x"[..], "audio/wav"))
            .await
            .unwrap();
        let err = server
            .start(ClipConfig::local(&b"y"[..], "audio/wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Internal(_)));
    }

    #[tokio::test]
    async fn swap_changes_body_for_subsequent_requests() {
        let server = test_server();
        let base = server
            .start(ClipConfig::local(&b"first clip"[..], "audio/mpeg"))
            .await
            .unwrap();
        let url = format!("{}{}", base, CLIP_PATH);

        let before = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
        assert_eq!(before.as_ref(), b"first clip");

        server.swap(ClipConfig::local(&b"second clip"[..], "audio/mpeg"));
        server.swap(ClipConfig::local(&b"third clip"[..], "audio/mpeg"));

        let after = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
        assert_eq!(after.as_ref(), b"third clip", "newest swap wins");
    }

    #[tokio::test]
    async fn url_path_is_stable_across_swaps() {
        let server = test_server();
        let base = server
            .start(ClipConfig::local(&b"a"[..], "audio/mpeg"))
            .await
            .unwrap();
        server.swap(ClipConfig::local(&b"b"[..], "audio/mpeg"));
        // The URL is derived from context state, not the swap.
        assert!(format!("{}{}", base, CLIP_PATH).ends_with("/media/current"));
    }

    #[tokio::test]
    async fn remote_clip_is_proxied() {
        // Upstream server with a fixed payload.
        let upstream = axum::Router::new().route(
            "/stream.mp3",
            axum::routing::get(|| async {
                (
                    [("content-type", "audio/mpeg")],
                    Bytes::from_static(b"remote-stream-bytes"),
                )
            }),
        );
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream).await.unwrap();
        });

        let server = test_server();
        let base = server
            .start(ClipConfig::remote(
                format!("http://127.0.0.1:{}/stream.mp3", upstream_port),
                None,
            ))
            .await
            .unwrap();

        let url = format!("{}{}", base, CLIP_PATH);
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "audio/mpeg"
        );
        assert_eq!(
            response.bytes().await.unwrap().as_ref(),
            b"remote-stream-bytes"
        );
    }
}
