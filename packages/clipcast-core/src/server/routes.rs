//! Clip endpoint route handlers.
//!
//! One stable path, two methods. Local clips are served from memory with
//! byte-range support (renderers commonly probe with a range request before
//! committing to a Play); remote clips are stream-proxied from upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::TryStreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use tower_http::trace::TraceLayer;

use super::ClipConfig;
use crate::protocol_constants::CLIP_PATH;

/// Shared state behind the clip routes.
#[derive(Clone)]
pub struct ClipState {
    /// Copy-on-write handle to the current clip; handlers snapshot it once.
    pub current: Arc<RwLock<Arc<ClipConfig>>>,
    /// Client for remote proxying.
    pub http: Client,
}

/// Creates the clip router.
///
/// Unknown paths fall through to axum's 404; other methods on the clip path
/// get the router's automatic 405.
pub fn router(state: ClipState) -> Router {
    Router::new()
        .route(CLIP_PATH, get(serve_clip))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A parsed `Range` header (single range only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `bytes=a-b`
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n` (last n bytes)
    Suffix(u64),
}

/// Parses a `Range` header value. Multi-range requests are not supported and
/// parse as None (served as a full 200, which is legal).
fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        ("", "") => None,
        ("", suffix) => suffix.parse().ok().map(RangeSpec::Suffix),
        (from, "") => from.parse().ok().map(RangeSpec::From),
        (from, to) => {
            let from: u64 = from.parse().ok()?;
            let to: u64 = to.parse().ok()?;
            Some(RangeSpec::FromTo(from, to))
        }
    }
}

/// Resolves a range against a known body length.
///
/// Returns the inclusive byte window, or None when unsatisfiable.
fn resolve_range(spec: RangeSpec, length: u64) -> Option<(u64, u64)> {
    if length == 0 {
        return None;
    }
    let last = length - 1;
    match spec {
        RangeSpec::FromTo(a, b) => (a <= b && a < length).then(|| (a, b.min(last))),
        RangeSpec::From(a) => (a < length).then(|| (a, last)),
        RangeSpec::Suffix(n) => {
            let n = n.min(length);
            (n > 0).then(|| (length - n, last))
        }
    }
}

/// GET/HEAD handler for the clip path.
async fn serve_clip(
    State(state): State<ClipState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    // Snapshot once: everything below serves this clip even if a hot-swap
    // lands mid-response.
    let clip = state.current.read().clone();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = match clip.as_ref() {
        ClipConfig::Local {
            bytes,
            mime,
            length,
        } => serve_local(&method, range.as_deref(), bytes, mime, *length),
        ClipConfig::Remote { url, mime_hint } => {
            serve_remote(&state.http, &method, range.as_deref(), url, mime_hint.as_deref()).await
        }
    };

    log::info!(
        "[ClipServer] {} {} from {} -> {}{}",
        method,
        CLIP_PATH,
        remote_addr.ip(),
        response.status(),
        range.map(|r| format!(" ({})", r)).unwrap_or_default()
    );
    response
}

/// Serves a local clip from memory, honoring single byte ranges.
fn serve_local(
    method: &Method,
    range: Option<&str>,
    bytes: &Bytes,
    mime: &str,
    length: u64,
) -> Response {
    let base = Response::builder()
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes");

    match range.and_then(parse_range) {
        Some(spec) => match resolve_range(spec, length) {
            Some((start, end)) => {
                let body = if *method == Method::HEAD {
                    Body::empty()
                } else {
                    Body::from(bytes.slice(start as usize..=end as usize))
                };
                base.status(StatusCode::PARTIAL_CONTENT)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, length),
                    )
                    .header(header::CONTENT_LENGTH, end - start + 1)
                    .body(body)
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            None => base
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", length))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        },
        None => {
            let body = if *method == Method::HEAD {
                Body::empty()
            } else {
                Body::from(bytes.clone())
            };
            base.status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, length)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Stream-proxies a remote clip.
///
/// Opens the upstream on each request, relays Content-Type/Content-Length
/// (and Content-Range for upstream 206s). On upstream failure mid-stream the
/// body is truncated rather than replaced by a synthesized error; the
/// renderer already received a success status line.
async fn serve_remote(
    http: &Client,
    method: &Method,
    range: Option<&str>,
    url: &str,
    mime_hint: Option<&str>,
) -> Response {
    let mut request = http.get(url);
    if let Some(range) = range {
        request = request.header(header::RANGE, range);
    }

    let upstream = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            log::warn!("[ClipServer] Upstream {} unreachable: {}", url, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = match upstream.status().as_u16() {
        206 => StatusCode::PARTIAL_CONTENT,
        s if (200..300).contains(&s) => StatusCode::OK,
        s => {
            log::warn!("[ClipServer] Upstream {} returned {}", url, s);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut builder = Response::builder().status(status);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| mime_hint.map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    builder = builder.header(header::CONTENT_TYPE, content_type);

    for relay in [header::CONTENT_LENGTH, header::CONTENT_RANGE] {
        if let Some(value) = upstream.headers().get(&relay) {
            builder = builder.header(relay, value.clone());
        }
    }

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(
            upstream
                .bytes_stream()
                .map_err(|e| std::io::Error::other(e.to_string())),
        )
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NetworkContext;
    use crate::server::ClipServer;

    #[test]
    fn parse_range_forms() {
        assert_eq!(parse_range("bytes=0-499"), Some(RangeSpec::FromTo(0, 499)));
        assert_eq!(parse_range("bytes=500-"), Some(RangeSpec::From(500)));
        assert_eq!(parse_range("bytes=-200"), Some(RangeSpec::Suffix(200)));
        assert_eq!(parse_range("bytes=0-0"), Some(RangeSpec::FromTo(0, 0)));
    }

    #[test]
    fn parse_range_rejects_garbage() {
        assert_eq!(parse_range("bits=0-1"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
        assert_eq!(parse_range("bytes=-"), None);
        // Multi-range served as full body instead.
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
    }

    #[test]
    fn resolve_range_clamps_and_rejects() {
        assert_eq!(resolve_range(RangeSpec::FromTo(0, 499), 1000), Some((0, 499)));
        // End clamped to the last byte.
        assert_eq!(resolve_range(RangeSpec::FromTo(900, 2000), 1000), Some((900, 999)));
        assert_eq!(resolve_range(RangeSpec::From(250), 1000), Some((250, 999)));
        assert_eq!(resolve_range(RangeSpec::Suffix(100), 1000), Some((900, 999)));
        // Start past the end is unsatisfiable.
        assert_eq!(resolve_range(RangeSpec::FromTo(1000, 1001), 1000), None);
        assert_eq!(resolve_range(RangeSpec::From(1000), 1000), None);
        assert_eq!(resolve_range(RangeSpec::Suffix(0), 1000), None);
    }

    async fn start_test_server(clip: ClipConfig) -> String {
        let server = ClipServer::new(NetworkContext::for_test(), Client::new());
        let base = server.start(clip).await.unwrap();
        // Leak so the server outlives the helper; tests run in one process.
        std::mem::forget(server);
        format!("{}{}", base, CLIP_PATH)
    }

    #[tokio::test]
    async fn range_request_gets_206_with_content_range() {
        let url = start_test_server(ClipConfig::local(
            Bytes::from_static(b"0123456789"),
            "audio/wav",
        ))
        .await;

        let client = Client::new();
        let response = client
            .get(&url)
            .header("Range", "bytes=2-5")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 206);
        assert_eq!(
            response.headers().get("content-range").unwrap(),
            "bytes 2-5/10"
        );
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"2345");
    }

    #[tokio::test]
    async fn unsatisfiable_range_gets_416() {
        let url = start_test_server(ClipConfig::local(
            Bytes::from_static(b"0123456789"),
            "audio/wav",
        ))
        .await;

        let client = Client::new();
        let response = client
            .get(&url)
            .header("Range", "bytes=50-60")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 416);
        assert_eq!(
            response.headers().get("content-range").unwrap(),
            "bytes */10"
        );
    }

    #[tokio::test]
    async fn full_get_advertises_accept_ranges() {
        let url = start_test_server(ClipConfig::local(
            Bytes::from_static(b"0123456789"),
            "audio/mpeg",
        ))
        .await;

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
        assert_eq!(response.headers().get("content-length").unwrap(), "10");
    }

    #[tokio::test]
    async fn head_returns_headers_without_body() {
        let url = start_test_server(ClipConfig::local(
            Bytes::from_static(b"0123456789"),
            "audio/mpeg",
        ))
        .await;

        let client = Client::new();
        let response = client.head(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers().get("content-length").unwrap(), "10");
        assert!(response.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_path_is_404_and_unknown_method_is_405() {
        let url = start_test_server(ClipConfig::local(Bytes::from_static(b"x"), "audio/wav")).await;
        let base = url.trim_end_matches(CLIP_PATH).to_string();

        let client = Client::new();
        let missing = client
            .get(format!("{}/media/other", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let posted = client.post(&url).body("x").send().await.unwrap();
        assert_eq!(posted.status().as_u16(), 405);
    }
}
