//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::policy::AddressPolicy;

/// State passed to every handler via Axum's `State` extractor.
///
/// Everything here is configured once at startup and only read afterwards,
/// so concurrent sessions share it without locking.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Destination access-control policy built from validated configuration.
    pub policy: Arc<AddressPolicy>,
    /// Monotonic instant when the server started (for uptime reporting).
    pub start_time: Instant,
}
