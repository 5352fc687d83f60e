//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VNCGATE_LISTEN`, `VNCGATE_HOST`,
//!    `VNCGATE_PORT`, `VNCGATE_ARBITRARY_HOSTS`, `VNCGATE_ARBITRARY_PORTS`,
//!    `VNCGATE_HOST_OPTIONS`, `VNCGATE_CIDR_WHITELIST`,
//!    `VNCGATE_CIDR_BLACKLIST`, `VNCGATE_BASIC_UI`, `VNCGATE_NOVNC_DIR`,
//!    plus `PORT` (listen port only, for container platforms)
//! 2. **Config file** — path via `--config <path>`, or `vncgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! basic_ui = false
//! # novnc_dir = "/usr/share/novnc"   # serve the browser client from here
//!
//! [policy]
//! host = "localhost"                 # default destination host
//! port = 5900                        # default destination port
//! arbitrary_hosts = false            # allow connections to other hosts
//! arbitrary_ports = false            # requires arbitrary_hosts
//! host_options = []                  # "name:host:port" entries
//! cidr_whitelist = []                # conflicts with cidr_blacklist
//! cidr_blacklist = []                # conflicts with cidr_whitelist
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Contradictory settings (`arbitrary_ports` without `arbitrary_hosts`, both
//! CIDR lists at once) are rejected when the policy is built at startup, not
//! at request time.

use serde::Deserialize;
use std::path::Path;

use crate::util::{env_flag, env_list, normalize_listen_addr};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`). A bare `:port` is
    /// accepted as shorthand for all interfaces.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Hide connection options from the landing page (default false).
    #[serde(default)]
    pub basic_ui: bool,
    /// Directory with the browser VNC client to serve for non-API paths.
    /// Unset = no static files, unmatched paths return 404.
    pub novnc_dir: Option<String>,
}

/// Destination access-control settings, consumed by
/// [`AddressPolicy::from_config`](crate::policy::AddressPolicy::from_config).
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// The host/ip to connect to by default (default `localhost`).
    #[serde(default = "default_host")]
    pub host: String,
    /// The port to connect to by default (default 5900).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allow connections to hosts other than the default (default false).
    #[serde(default)]
    pub arbitrary_hosts: bool,
    /// Allow connections to arbitrary ports (default false, requires
    /// `arbitrary_hosts`).
    #[serde(default)]
    pub arbitrary_ports: bool,
    /// Named fixed destinations in `name:host:port` form. A non-empty list
    /// switches the gateway into allowlist mode.
    #[serde(default)]
    pub host_options: Vec<String>,
    /// CIDR whitelist applied to resolved destination IPs.
    #[serde(default)]
    pub cidr_whitelist: Vec<String>,
    /// CIDR blacklist applied to resolved destination IPs.
    #[serde(default)]
    pub cidr_blacklist: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A configuration contradiction or parse failure. Fatal at startup: the
/// process reports it and exits with a non-zero status before serving.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("arbitrary-ports requires arbitrary-hosts to be enabled")]
    ArbitraryPortsRequireHosts,
    #[error("only one of cidr blacklist/whitelist can be specified")]
    CidrConflict,
    #[error("error parsing CIDR '{entry}': {source}")]
    Cidr {
        entry: String,
        source: ipnet::AddrParseError,
    },
    #[error("error parsing host option '{0}': must be in name:host:port format")]
    HostOption(String),
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5900
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            basic_ui: false,
            novnc_dir: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            arbitrary_hosts: false,
            arbitrary_ports: false,
            host_options: Vec::new(),
            cidr_whitelist: Vec::new(),
            cidr_blacklist: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            policy: PolicyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `vncgate.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vncgate.toml").exists() {
            let content =
                std::fs::read_to_string("vncgate.toml").expect("Failed to read vncgate.toml");
            toml::from_str(&content).expect("Failed to parse vncgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("PORT") {
            config.server.listen = format!(":{port}");
        }
        if let Ok(listen) = std::env::var("VNCGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(val) = std::env::var("VNCGATE_BASIC_UI") {
            config.server.basic_ui = env_flag(&val);
        }
        if let Ok(dir) = std::env::var("VNCGATE_NOVNC_DIR") {
            config.server.novnc_dir = Some(dir);
        }
        if let Ok(host) = std::env::var("VNCGATE_HOST") {
            config.policy.host = host;
        }
        if let Ok(port) = std::env::var("VNCGATE_PORT") {
            match port.parse() {
                Ok(p) => config.policy.port = p,
                Err(_) => panic!("Failed to parse VNCGATE_PORT value {port:?}"),
            }
        }
        if let Ok(val) = std::env::var("VNCGATE_ARBITRARY_HOSTS") {
            config.policy.arbitrary_hosts = env_flag(&val);
        }
        if let Ok(val) = std::env::var("VNCGATE_ARBITRARY_PORTS") {
            config.policy.arbitrary_ports = env_flag(&val);
        }
        if let Ok(val) = std::env::var("VNCGATE_HOST_OPTIONS") {
            config.policy.host_options = env_list(&val);
        }
        if let Ok(val) = std::env::var("VNCGATE_CIDR_WHITELIST") {
            config.policy.cidr_whitelist = env_list(&val);
        }
        if let Ok(val) = std::env::var("VNCGATE_CIDR_BLACKLIST") {
            config.policy.cidr_blacklist = env_list(&val);
        }

        config.server.listen = normalize_listen_addr(&config.server.listen);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.policy.host, "localhost");
        assert_eq!(config.policy.port, 5900);
        assert!(!config.policy.arbitrary_hosts);
        assert!(config.policy.host_options.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_full_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = ":9000"
            basic_ui = true

            [policy]
            host = "10.0.0.5"
            port = 5901
            arbitrary_hosts = true
            arbitrary_ports = true
            host_options = ["office:10.0.0.5:5900"]
            cidr_whitelist = ["10.0.0.0/24"]

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, ":9000");
        assert!(config.server.basic_ui);
        assert_eq!(config.policy.port, 5901);
        assert_eq!(config.policy.host_options, vec!["office:10.0.0.5:5900"]);
        assert_eq!(config.policy.cidr_whitelist, vec!["10.0.0.0/24"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str("[policy]\nhost = \"vnc.internal\"\n").unwrap();
        assert_eq!(config.policy.host, "vnc.internal");
        assert_eq!(config.policy.port, 5900);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }
}
