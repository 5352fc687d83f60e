//! Reverse tunnel client — a local TCP listener bridged to a gateway over
//! WebSocket.
//!
//! Lets a TCP-only viewer reach a host behind the gateway: the client
//! listens locally and, for each accepted connection, dials the gateway's
//! `/vnc[/host[/port]]` endpoint as a WebSocket and relays bytes both ways
//! with the same engine the gateway itself uses (no magic sniffing here —
//! this side is relaying, not validating a server).
//!
//! Three phases, re-entered on failure when a retry interval is configured
//! (negative = fail fast):
//!
//! 1. **Detect** — if the supplied address names a scheme, probe it as-is;
//!    otherwise try `https://` then `http://`, each with a bounded-timeout
//!    GET expecting 200. The first success wins; if neither succeeds the
//!    most recent probe error surfaces.
//! 2. **Health-check** — GET the fully formed tunnel URL. A 401 is an
//!    authoritative policy denial whose body is surfaced verbatim (and
//!    preserved verbatim across retries); any other non-2xx is a generic
//!    connectivity error.
//! 3. **Serve** — accept loop on the local listener. Transient accept
//!    errors back off briefly and continue; anything else is fatal. Each
//!    session is isolated: its failure never touches the listener or
//!    sibling sessions.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::ready;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::{redirect, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::relay;
use crate::util::normalize_listen_addr;

/// Bound on each scheme-detection probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on the health-check GET (it runs policy evaluation, possibly DNS,
/// on the gateway side).
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a transient accept error before listening again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Options for `vncgate tunnel`.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// The gateway in `[http[s]://]hostname[:port]` form.
    pub proxy: String,
    /// Target host to request (requires arbitrary hosts on the gateway).
    pub target_host: Option<String>,
    /// Target port to request (requires arbitrary ports on the gateway).
    pub target_port: Option<String>,
    /// Local address to listen for viewer connections on.
    pub listen: String,
    /// Seconds between retries of detection/health-check failures;
    /// negative = fail fast.
    pub retry: i64,
}

/// Why the tunnel client failed.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The gateway's policy refused the destination; the body it sent is
    /// preserved verbatim.
    #[error("gateway: {0}")]
    Denied(String),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("listen {addr}: {source}")]
    Listen { addr: String, source: io::Error },
    #[error("accept: {0}")]
    Accept(io::Error),
}

/// Run the tunnel client until a fatal error. Detection and health-check
/// failures loop on the retry interval when one is configured.
pub async fn run(opts: TunnelOptions) -> Result<(), TunnelError> {
    let url = loop {
        match resolve_tunnel_url(&opts).await {
            Ok(url) => break url,
            Err(e) if opts.retry >= 0 => {
                let secs = u64::try_from(opts.retry).unwrap_or(0);
                warn!("{e}, retrying after {secs}s");
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            Err(e) => return Err(e),
        }
    };

    serve(&opts.listen, &url).await
}

/// Phases 1 and 2: detect the scheme, then health-check the tunnel URL.
async fn resolve_tunnel_url(opts: &TunnelOptions) -> Result<String, TunnelError> {
    let base = detect(&opts.proxy).await?;
    let url = tunnel_url(
        &base,
        opts.target_host.as_deref(),
        opts.target_port.as_deref(),
    );
    info!("testing connection to {url}");
    check(&url).await?;
    Ok(url)
}

/// Detect the gateway's base URL, probing `https` before `http` when no
/// scheme was given.
async fn detect(proxy: &str) -> Result<String, TunnelError> {
    let client = probe_client()?;

    if proxy.contains("://") {
        info!("testing connection to {proxy}");
        probe(&client, proxy).await?;
        return Ok(proxy.trim_end_matches('/').to_string());
    }

    info!("no protocol specified, autodetecting");
    let https = format!("https://{proxy}");
    match probe(&client, &https).await {
        Ok(()) => Ok(https),
        Err(e) => {
            warn!("proto https: {e}");
            let http = format!("http://{proxy}");
            match probe(&client, &http).await {
                Ok(()) => Ok(http),
                Err(e) => {
                    warn!("proto http: {e}");
                    Err(e)
                }
            }
        }
    }
}

/// Liveness probe: bounded-timeout GET expecting exactly 200.
async fn probe(client: &reqwest::Client, url: &str) -> Result<(), TunnelError> {
    let resp = client.get(url).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(TunnelError::Status(resp.status()));
    }
    Ok(())
}

/// Client for detection probes: short timeout, and redirects are only
/// followed within the same scheme — a cross-scheme bounce would defeat
/// autodetection.
fn probe_client() -> Result<reqwest::Client, TunnelError> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > 10 {
                return attempt.error("too many redirects");
            }
            let scheme_changed = attempt
                .previous()
                .last()
                .is_some_and(|prev| prev.scheme() != attempt.url().scheme());
            if scheme_changed {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .build()?;
    Ok(client)
}

/// Health-check the tunnel URL. 401 is an authoritative denial carrying the
/// policy's reason; other non-2xx statuses are connectivity errors.
async fn check(url: &str) -> Result<(), TunnelError> {
    let client = reqwest::Client::builder().timeout(CHECK_TIMEOUT).build()?;
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TunnelError::Denied(resp.text().await?));
    }
    if !status.is_success() {
        return Err(TunnelError::Status(status));
    }
    Ok(())
}

/// Build the tunnel URL from the detected base and the optional target.
fn tunnel_url(base: &str, host: Option<&str>, port: Option<&str>) -> String {
    let mut url = format!("{base}/vnc");
    if let Some(host) = host {
        url.push('/');
        url.push_str(host);
        if let Some(port) = port {
            url.push('/');
            url.push_str(port);
        }
    }
    url
}

/// Rewrite the health-checked URL for the WebSocket dial
/// (`http` → `ws`, `https` → `wss`).
fn ws_scheme(url: &str) -> String {
    url.replacen("http", "ws", 1)
}

/// Accept errors that warrant a brief pause and another accept rather than
/// tearing the listener down.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Phase 3: the accept loop. Runs until a non-transient accept error.
async fn serve(listen: &str, url: &str) -> Result<(), TunnelError> {
    let listen = normalize_listen_addr(listen);
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|source| TunnelError::Listen {
            addr: listen.clone(),
            source,
        })?;
    info!("listening on {listen} => {url}");

    let ws_url = ws_scheme(url);
    let mut id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                id += 1;
                info!("accepted connection {id} from {peer}");
                let ws_url = ws_url.clone();
                tokio::spawn(async move {
                    session(id, conn, &ws_url).await;
                    info!("connection {id} closed");
                });
            }
            Err(e) if is_transient(&e) => {
                warn!("temporary accept error: {e}, trying again in 100ms");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => return Err(TunnelError::Accept(e)),
        }
    }
}

type WsTransport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One relayed session: dial the gateway WebSocket, then pure byte relay
/// until either side hangs up.
async fn session(id: u64, conn: TcpStream, ws_url: &str) {
    let request = match ws_url.into_client_request() {
        Ok(mut request) => {
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
            request
        }
        Err(e) => {
            warn!("connection {id}: bad gateway url: {e}");
            return;
        }
    };

    let ws = match connect_async(request).await {
        Ok((ws, _response)) => ws,
        // Dropping `conn` closes the viewer's connection
        Err(e) => {
            warn!("connection {id}: dial gateway websocket: {e}, closing connection");
            return;
        }
    };

    let (ws_sink, ws_stream) = ws.split();
    let (tcp_rd, tcp_wr) = conn.into_split();
    let outcome = relay::run_duplex(
        gateway_stream(ws_stream),
        gateway_sink(ws_sink),
        tcp_rd,
        tcp_wr,
    )
    .await;

    if let Some(e) = outcome.error {
        warn!("connection {id}: {e}");
    }
}

/// Adapt gateway WebSocket messages into a byte stream; ends at the
/// gateway's close frame.
fn gateway_stream(
    stream: SplitStream<WsTransport>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
    stream
        .take_while(|msg| ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text.to_string()))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        })
}

/// Adapt the gateway WebSocket sink into a byte sink; every chunk becomes
/// one binary frame.
fn gateway_sink(
    sink: SplitSink<WsTransport, Message>,
) -> impl Sink<Bytes, Error = io::Error> + Send + Unpin + 'static {
    sink.sink_map_err(io::Error::other)
        .with(|data: Bytes| ready(Ok::<Message, io::Error>(Message::Binary(data))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_http(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn tunnel_url_composition() {
        assert_eq!(tunnel_url("http://gw", None, None), "http://gw/vnc");
        assert_eq!(
            tunnel_url("http://gw", Some("host"), None),
            "http://gw/vnc/host"
        );
        assert_eq!(
            tunnel_url("http://gw", Some("host"), Some("5901")),
            "http://gw/vnc/host/5901"
        );
    }

    #[test]
    fn ws_scheme_rewrite() {
        assert_eq!(ws_scheme("http://gw/vnc"), "ws://gw/vnc");
        assert_eq!(ws_scheme("https://gw/vnc/host"), "wss://gw/vnc/host");
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[tokio::test]
    async fn check_passes_on_ok() {
        let base = spawn_http(Router::new().route("/vnc", get(|| async { "ready" }))).await;
        check(&format!("{base}/vnc")).await.unwrap();
    }

    #[tokio::test]
    async fn check_surfaces_denial_body_verbatim() {
        let base = spawn_http(Router::new().route(
            "/vnc/{host}",
            get(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    "host is not part of options",
                )
            }),
        ))
        .await;
        let err = check(&format!("{base}/vnc/test")).await.unwrap_err();
        assert_eq!(err.to_string(), "gateway: host is not part of options");
    }

    #[tokio::test]
    async fn check_treats_other_statuses_as_connectivity_errors() {
        let base = spawn_http(Router::new().route(
            "/vnc",
            get(|| async { axum::http::StatusCode::BAD_GATEWAY }),
        ))
        .await;
        let err = check(&format!("{base}/vnc")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Status(s) if s == StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn detect_keeps_explicit_scheme() {
        let base = spawn_http(Router::new().route("/", get(|| async { "index" }))).await;
        assert_eq!(detect(&base).await.unwrap(), base);
    }

    #[tokio::test]
    async fn detect_falls_back_to_http() {
        let base = spawn_http(Router::new().route("/", get(|| async { "index" }))).await;
        let hostport = base.trim_start_matches("http://").to_string();
        assert_eq!(detect(&hostport).await.unwrap(), format!("http://{hostport}"));
    }

    #[tokio::test]
    async fn detect_surfaces_probe_error_on_bad_status() {
        let base = spawn_http(Router::new().route(
            "/",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let err = detect(&base).await.unwrap_err();
        assert!(matches!(err, TunnelError::Status(_)));
    }
}
