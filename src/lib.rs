#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! vncgate library — the WebSocket↔TCP gateway engine and its reverse
//! tunnel client.
//!
//! - `policy` — destination access control (host options, arbitrary-host
//!   toggles, CIDR allow/deny per resolved IP)
//! - `sniff` — sticky magic-prefix verification for dialed destinations
//! - `relay` — shared bidirectional copy engine with synchronized teardown
//! - `bridge` — per-session WebSocket↔TCP bridge for the gateway
//! - `routes` — HTTP surface (landing page, health, `/vnc` endpoints)
//! - `tunnel` — reverse tunnel client (detect, health-check, serve)
//! - `config` — TOML + env-var configuration
//! - `state` — shared application state

pub mod bridge;
pub mod config;
pub mod policy;
pub mod relay;
pub mod routes;
pub mod sniff;
pub mod state;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use policy::AddressPolicy;
pub use state::AppState;
