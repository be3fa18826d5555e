//! HTTP plumbing and the direct/proxied route selection.
//!
//! [`HttpTransport`] is the seam between the client and the network; the
//! production implementation is [`ReqwestTransport`]. [`TransportSelector`]
//! builds device URLs for a [`TransportMode`] and performs the one-shot
//! fallback from `Direct` to `Proxied`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;

use crate::error::TransportError;
use crate::protocol::{
    join_url, CONNECT_PATH, PROXY_PREFIX, READINGS_PATH, TUNNEL_WARNING_HEADER,
    TUNNEL_WARNING_VALUE,
};
use crate::types::TransportMode;

// ── HttpTransport ─────────────────────────────────────────────────────────────

/// JSON-over-HTTP with bearer authentication.
///
/// Implementations must attach `Authorization: Bearer <token>` and the tunnel
/// interstitial header to every request, and must report a body that is not
/// JSON as [`TransportError::InvalidResponseBody`] rather than a network error.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get_json(&self, url: &str, token: &str) -> Result<Value, TransportError>;

    async fn post_json(&self, url: &str, token: &str, body: &Value)
        -> Result<Value, TransportError>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::NetworkUnreachable(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Wrap a preconfigured client (proxy, TLS roots, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> Result<Value, TransportError> {
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::NetworkUnreachable(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::NetworkUnreachable(format!(
                "{url}: HTTP {}",
                status.as_u16()
            )));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::NetworkUnreachable(format!("{url}: {e}")))?;
        serde_json::from_str(&text).map_err(|e| {
            debug!("{url}: body is not JSON ({e}): {:.120}", text);
            TransportError::invalid_json()
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(&self, url: &str, token: &str) -> Result<Value, TransportError> {
        let req = self
            .client
            .get(url)
            .bearer_auth(token)
            .header(TUNNEL_WARNING_HEADER, TUNNEL_WARNING_VALUE);
        self.send(req, url).await
    }

    async fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &Value,
    ) -> Result<Value, TransportError> {
        let req = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(TUNNEL_WARNING_HEADER, TUNNEL_WARNING_VALUE)
            .json(body);
        self.send(req, url).await
    }
}

// ── Device requests ───────────────────────────────────────────────────────────

/// The two device endpoints the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Handshake probe.
    Connect,
    /// Live sensor snapshot.
    Readings,
}

impl DeviceRequest {
    pub fn path(self) -> &'static str {
        match self {
            DeviceRequest::Connect => CONNECT_PATH,
            DeviceRequest::Readings => READINGS_PATH,
        }
    }
}

/// Base URLs for both routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Device on the local network, e.g. `http://192.168.4.1`.
    pub device_base: String,
    /// Backend that hosts both the reading sink and the `/esp32` relay.
    pub backend_base: String,
}

impl Endpoints {
    /// URL of `request` when routed through `mode`.
    ///
    /// ```
    /// # use pulse_sync::transport::{DeviceRequest, Endpoints};
    /// # use pulse_sync::types::TransportMode;
    /// let e = Endpoints {
    ///     device_base: "http://192.168.4.1".into(),
    ///     backend_base: "https://api.example.com".into(),
    /// };
    /// assert_eq!(e.device_url(TransportMode::Direct, DeviceRequest::Readings),
    ///            "http://192.168.4.1/readings");
    /// assert_eq!(e.device_url(TransportMode::Proxied, DeviceRequest::Readings),
    ///            "https://api.example.com/esp32/readings");
    /// ```
    pub fn device_url(&self, mode: TransportMode, request: DeviceRequest) -> String {
        match mode {
            TransportMode::Direct => join_url(&self.device_base, request.path()),
            TransportMode::Proxied => {
                let relay = join_url(&self.backend_base, PROXY_PREFIX);
                join_url(&relay, request.path())
            }
        }
    }

    /// URL of a backend resource (not relayed).
    pub fn backend_url(&self, path: &str) -> String {
        join_url(&self.backend_base, path)
    }
}

// ── TransportSelector ─────────────────────────────────────────────────────────

/// Result of a device request together with the route the session should use
/// from now on.
///
/// The selector never stores the mode itself; the caller commits
/// [`Fetched::mode`] once the call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub result: Result<Value, TransportError>,
    pub mode: TransportMode,
}

/// Issues device requests with a single `Direct` → `Proxied` fallback.
#[derive(Clone)]
pub struct TransportSelector {
    http: Arc<dyn HttpTransport>,
    endpoints: Endpoints,
}

impl TransportSelector {
    pub fn new(http: Arc<dyn HttpTransport>, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Fetch `request` starting on `mode`.
    ///
    /// A failure on `Direct` switches to `Proxied` and retries exactly once;
    /// the returned mode is then `Proxied` whether or not the retry worked,
    /// so later calls skip the direct timeout. A failure on `Proxied` is
    /// returned as is.
    pub async fn fetch_raw(&self, mode: TransportMode, request: DeviceRequest, token: &str) -> Fetched {
        let url = self.endpoints.device_url(mode, request);
        debug!("GET {url} ({mode})");
        let first = self.http.get_json(&url, token).await;

        match (first, mode) {
            (Ok(body), _) => Fetched { result: Ok(body), mode },
            (Err(e), TransportMode::Proxied) => Fetched { result: Err(e), mode },
            (Err(e), TransportMode::Direct) => {
                warn!("Direct {} failed ({e}); falling back to proxied", request.path());
                let url = self.endpoints.device_url(TransportMode::Proxied, request);
                let result = self.http.get_json(&url, token).await;
                match &result {
                    Ok(_) => info!("Proxied {} succeeded; staying proxied", request.path()),
                    Err(e) => warn!("Proxied {} failed too: {e}", request.path()),
                }
                Fetched { result, mode: TransportMode::Proxied }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn selector(http: Arc<ScriptedTransport>) -> TransportSelector {
        TransportSelector::new(
            http,
            Endpoints {
                device_base: "http://device".into(),
                backend_base: "http://backend/".into(),
            },
        )
    }

    #[test]
    fn proxied_urls_go_through_the_relay() {
        let e = Endpoints {
            device_base: "http://device/".into(),
            backend_base: "http://backend/".into(),
        };
        assert_eq!(e.device_url(TransportMode::Direct, DeviceRequest::Connect), "http://device/connect");
        assert_eq!(
            e.device_url(TransportMode::Proxied, DeviceRequest::Connect),
            "http://backend/esp32/connect"
        );
        assert_eq!(e.backend_url("/sensor-readings"), "http://backend/sensor-readings");
    }

    #[tokio::test]
    async fn direct_success_keeps_direct() {
        let http = Arc::new(ScriptedTransport::new());
        http.push_get("http://device/readings", Ok(json!({ "bpm": 70 })));

        let fetched = selector(http.clone()).fetch_raw(TransportMode::Direct, DeviceRequest::Readings, "t").await;
        assert_eq!(fetched.mode, TransportMode::Direct);
        assert_eq!(fetched.result, Ok(json!({ "bpm": 70 })));
        assert_eq!(http.get_urls(), vec!["http://device/readings"]);
    }

    #[tokio::test]
    async fn direct_failure_falls_back_once_and_sticks() {
        let http = Arc::new(ScriptedTransport::new());
        http.push_get(
            "http://device/readings",
            Err(TransportError::NetworkUnreachable("refused".into())),
        );
        http.push_get("http://backend/esp32/readings", Ok(json!({ "spo2": 97 })));
        http.push_get("http://backend/esp32/readings", Ok(json!({ "spo2": 96 })));
        let selector = selector(http.clone());

        let first = selector.fetch_raw(TransportMode::Direct, DeviceRequest::Readings, "t").await;
        assert_eq!(first.result, Ok(json!({ "spo2": 97 })));
        assert_eq!(first.mode, TransportMode::Proxied);

        let second = selector.fetch_raw(first.mode, DeviceRequest::Readings, "t").await;
        assert_eq!(second.result, Ok(json!({ "spo2": 96 })));
        assert_eq!(
            http.get_urls(),
            vec![
                "http://device/readings",
                "http://backend/esp32/readings",
                "http://backend/esp32/readings",
            ]
        );
    }

    #[tokio::test]
    async fn both_routes_failing_returns_the_retry_error() {
        let http = Arc::new(ScriptedTransport::new());
        http.push_get("http://device/connect", Err(TransportError::invalid_json()));
        http.push_get(
            "http://backend/esp32/connect",
            Err(TransportError::NetworkUnreachable("HTTP 502".into())),
        );

        let fetched = selector(http.clone()).fetch_raw(TransportMode::Direct, DeviceRequest::Connect, "t").await;
        assert_eq!(fetched.mode, TransportMode::Proxied);
        assert_eq!(fetched.result, Err(TransportError::NetworkUnreachable("HTTP 502".into())));
        assert_eq!(http.get_urls().len(), 2);
    }

    #[tokio::test]
    async fn proxied_failure_does_not_retry() {
        let http = Arc::new(ScriptedTransport::new());
        http.push_get(
            "http://backend/esp32/readings",
            Err(TransportError::NetworkUnreachable("timeout".into())),
        );

        let fetched = selector(http.clone()).fetch_raw(TransportMode::Proxied, DeviceRequest::Readings, "t").await;
        assert!(fetched.result.is_err());
        assert_eq!(http.get_urls().len(), 1);
    }

    #[tokio::test]
    async fn token_is_passed_through() {
        let http = Arc::new(ScriptedTransport::new());
        http.push_get("http://device/readings", Ok(json!({})));
        selector(http.clone()).fetch_raw(TransportMode::Direct, DeviceRequest::Readings, "secret").await;
        assert_eq!(http.tokens(), vec!["secret"]);
    }

    // ── ReqwestTransport against a local socket ──────────────────────────────

    mod reqwest_transport {
        use super::*;
        use pretty_assertions::assert_eq;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::task::JoinHandle;

        fn transport() -> ReqwestTransport {
            let client = reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap();
            ReqwestTransport::with_client(client)
        }

        /// Reads one request (headers plus `Content-Length` body) and returns
        /// it lowercased.
        async fn read_request(socket: &mut TcpStream) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_ascii_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let body_len = text[..end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        return text;
                    }
                }
            }
            String::from_utf8_lossy(&buf).to_ascii_lowercase()
        }

        /// Serves a single canned response; the handle yields the request.
        async fn serve_once(
            status: &'static str,
            content_type: &'static str,
            body: &'static str,
        ) -> (String, JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
                request
            });
            (format!("http://{addr}"), server)
        }

        #[tokio::test]
        async fn get_sends_bearer_and_tunnel_headers() {
            let (base, server) =
                serve_once("200 OK", "application/json", r#"{"bpm":71}"#).await;

            let body = transport().get_json(&format!("{base}/readings"), "tok-1").await;
            assert_eq!(body, Ok(json!({ "bpm": 71 })));

            let request = server.await.unwrap();
            assert!(request.starts_with("get /readings http/1.1"));
            assert!(request.contains("authorization: bearer tok-1"));
            assert!(request.contains("ngrok-skip-browser-warning: true"));
        }

        #[tokio::test]
        async fn post_sends_the_json_body() {
            let (base, server) =
                serve_once("201 Created", "application/json", r#"{"reading_id":4}"#).await;

            let reply = transport()
                .post_json(&format!("{base}/sensor-readings"), "tok-2", &json!({ "spo2": 97.0 }))
                .await;
            assert_eq!(reply, Ok(json!({ "reading_id": 4 })));

            let request = server.await.unwrap();
            assert!(request.starts_with("post /sensor-readings http/1.1"));
            assert!(request.contains("authorization: bearer tok-2"));
            assert!(request.contains("ngrok-skip-browser-warning: true"));
            assert!(request.contains("content-type: application/json"));
            assert!(request.ends_with(r#"{"spo2":97.0}"#));
        }

        #[tokio::test]
        async fn html_body_is_invalid_json() {
            let (base, server) =
                serve_once("200 OK", "text/html", "<html>tunnel warning</html>").await;

            let body = transport().get_json(&format!("{base}/readings"), "t").await;
            assert_eq!(body, Err(TransportError::invalid_json()));
            server.await.unwrap();
        }

        #[tokio::test]
        async fn error_status_is_unreachable() {
            let (base, server) =
                serve_once("502 Bad Gateway", "application/json", r#"{"detail":"down"}"#).await;

            let body = transport().get_json(&format!("{base}/readings"), "t").await;
            assert!(matches!(
                body,
                Err(TransportError::NetworkUnreachable(ref msg)) if msg.contains("HTTP 502")
            ));
            server.await.unwrap();
        }

        #[tokio::test]
        async fn refused_connection_is_unreachable() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let body = transport().get_json(&format!("http://{addr}/readings"), "t").await;
            assert!(matches!(body, Err(TransportError::NetworkUnreachable(_))));
        }
    }
}
