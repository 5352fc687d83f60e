//! The `/vnc` tunnel endpoints.
//!
//! `GET /vnc`, `/vnc/{host}`, `/vnc/{host}/{port}` — resolve the requested
//! destination against the [`AddressPolicy`](crate::policy::AddressPolicy),
//! then upgrade to a WebSocket that transparently proxies binary frames to
//! the destination's TCP socket.
//!
//! - Denials answer `401` with the human-readable reason as the body; no
//!   dial is attempted.
//! - Authorized responses carry the resolved destination in the
//!   `X-Target-Addr` header for surrounding middleware/diagnostics.
//! - A plain GET (no upgrade) that passes authorization answers `200` — the
//!   reverse tunnel health-checks the endpoint this way before dialing.
//! - Path segments are validated against the route contract (hostname
//!   characters or an IPv6 literal; digits for the port); anything else is
//!   a 404, not a policy decision.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::bridge;
use crate::AppState;

/// Response header naming the resolved destination.
const TARGET_ADDR_HEADER: &str = "x-target-addr";

type Upgrade = Result<WebSocketUpgrade, WebSocketUpgradeRejection>;

/// `GET /vnc` — connect to the default destination.
pub async fn vnc_default(State(state): State<AppState>, ws: Upgrade) -> Response {
    serve(state, ws.ok(), None, None).await
}

/// `GET /vnc/{host}` — explicit host, default port.
pub async fn vnc_host(
    State(state): State<AppState>,
    Path(host): Path<String>,
    ws: Upgrade,
) -> Response {
    serve(state, ws.ok(), Some(host), None).await
}

/// `GET /vnc/{host}/{port}` — explicit host and port.
pub async fn vnc_host_port(
    State(state): State<AppState>,
    Path((host, port)): Path<(String, String)>,
    ws: Upgrade,
) -> Response {
    serve(state, ws.ok(), Some(host), Some(port)).await
}

async fn serve(
    state: AppState,
    upgrade: Option<WebSocketUpgrade>,
    host: Option<String>,
    port: Option<String>,
) -> Response {
    if !host.as_deref().is_none_or(valid_host_segment)
        || !port.as_deref().is_none_or(valid_port_segment)
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let addr = match state
        .policy
        .authorize(host.as_deref(), port.as_deref())
        .await
    {
        Ok(addr) => addr,
        Err(deny) => {
            debug!(
                "connect {}:{} disabled: {deny}",
                host.as_deref().unwrap_or_default(),
                port.as_deref().unwrap_or_default()
            );
            return (StatusCode::UNAUTHORIZED, deny.to_string()).into_response();
        }
    };

    debug!("connect {addr}");

    let mut response = match upgrade {
        Some(ws) => {
            let target = addr.clone();
            ws.protocols(["binary"]).on_upgrade(move |socket| async move {
                match bridge::run(socket, &target, bridge::RFB_MAGIC).await {
                    Ok(()) => debug!("session {target} closed"),
                    Err(e) => warn!("{e}"),
                }
            })
        }
        // Plain GET that passed authorization — the health-check path
        None => StatusCode::OK.into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&addr) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TARGET_ADDR_HEADER), value);
    }
    response
}

/// The route contract for the host segment: hostname characters
/// (`[a-zA-Z0-9_.-]`) or a literal IPv6 address.
fn valid_host_segment(host: &str) -> bool {
    !host.is_empty()
        && (host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
            || host.parse::<std::net::Ipv6Addr>().is_ok())
}

/// The route contract for the port segment: digits forming a valid port.
fn valid_port_segment(port: &str) -> bool {
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && port.parse::<u16>().is_ok()
}
