//! HTTP surface: landing page, health probe, and the `/vnc` tunnel
//! endpoints, assembled into the application router.

pub mod health;
pub mod index;
pub mod vnc;

use axum::http::header::{HeaderValue, CACHE_CONTROL, SERVER};
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the gateway router.
///
/// Unmatched paths fall through to the bundled browser client directory when
/// `server.novnc_dir` is configured. Every response carries the `Server`
/// identity and `Cache-Control: no-cache` (the client app must not be cached
/// across gateway upgrades).
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(index::index))
        .route("/api/health", get(health::health))
        .route("/vnc", get(vnc::vnc_default))
        .route("/vnc/{host}", get(vnc::vnc_host))
        .route("/vnc/{host}/{port}", get(vnc::vnc_host_port));

    if let Some(dir) = &state.config.server.novnc_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(SetResponseHeaderLayer::overriding(
        SERVER,
        HeaderValue::from_static("vncgate"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    ))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
