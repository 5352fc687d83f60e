//! Destination access control.
//!
//! The gateway decides per request whether a destination `(host, port)` may
//! be dialed. Three modes, in order of precedence:
//!
//! - **Named allowlist** — a non-empty [`HostOption`] list restricts hosts
//!   and ports to values appearing in the list. Host membership and port
//!   membership are independent scans: with options `{a,1}` and `{b,2}` the
//!   pair `(a,2)` is allowed. This mirrors the long-standing behavior of the
//!   option list and is pinned by a test below.
//! - **Arbitrary toggles** — with no options configured, explicit hosts and
//!   ports are only accepted when `arbitrary_hosts` / `arbitrary_ports` are
//!   enabled. An absent segment always falls back to the default.
//! - **CIDR filter** — independent of the above, an optional whitelist or
//!   blacklist checked against every IP address the destination resolves to.
//!   A single failing IP denies the whole hostname; a resolution failure is
//!   a denial, never a silent allow.
//!
//! The policy is built once from validated configuration at startup and then
//! only read, so handlers share it behind an `Arc` without locking.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::config::{ConfigError, PolicyConfig};

/// Upper bound on DNS resolution during CIDR evaluation. A lookup that takes
/// longer is treated like any other resolution failure (a denial).
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// A named, fixed destination pair from the `policy.host_options` list.
#[derive(Debug, Clone)]
pub struct HostOption {
    pub name: String,
    pub host: String,
    pub port: String,
}

/// Whether the CIDR list admits or rejects matching addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrMode {
    Whitelist,
    Blacklist,
}

/// An ordered CIDR list plus its mode. Only built when the list is
/// non-empty; an absent filter means "always allow".
#[derive(Debug, Clone)]
pub struct CidrFilter {
    networks: Vec<IpNet>,
    mode: CidrMode,
}

impl CidrFilter {
    /// Check one IP against the list.
    fn check_ip(&self, ip: IpAddr) -> Result<(), String> {
        let matched = self.networks.iter().find(|net| net.contains(&ip));
        match (matched, self.mode) {
            (None, CidrMode::Whitelist) => {
                Err(format!("ip {ip} does not match any whitelisted cidr"))
            }
            (Some(net), CidrMode::Blacklist) => {
                Err(format!("ip {ip} matches blacklisted cidr {net}"))
            }
            _ => Ok(()),
        }
    }

    /// Resolve `host` and check every resulting IP. All must pass.
    pub async fn check_host(&self, host: &str) -> Result<(), String> {
        for ip in resolve_ips(host).await? {
            self.check_ip(ip)?;
        }
        Ok(())
    }
}

/// Resolve a hostname (or IP literal) to its address set, bounded by
/// [`DNS_TIMEOUT`].
async fn resolve_ips(host: &str) -> Result<Vec<IpAddr>, String> {
    match timeout(DNS_TIMEOUT, lookup_host((host, 0u16))).await {
        Ok(Ok(addrs)) => {
            let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            if ips.is_empty() {
                Err(format!("lookup {host}: no addresses"))
            } else {
                Ok(ips)
            }
        }
        Ok(Err(e)) => Err(format!("lookup {host}: {e}")),
        Err(_) => Err(format!(
            "lookup {host}: timed out after {}s",
            DNS_TIMEOUT.as_secs()
        )),
    }
}

/// Why a destination was refused. The `Display` text doubles as the 401
/// response body, so the wording is part of the wire contract.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("host is not part of options")]
    HostNotInOptions,
    #[error("--arbitrary-hosts disabled")]
    ArbitraryHostsDisabled,
    #[error("port is not part of options")]
    PortNotInOptions,
    #[error("--arbitrary-ports disabled")]
    ArbitraryPortsDisabled,
    /// CIDR rejection or resolution failure for an otherwise acceptable pair.
    #[error("connect {target} not allowed: {reason}")]
    NotAllowed { target: String, reason: String },
}

/// The gateway's destination policy, built once at startup.
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    default_host: String,
    default_port: u16,
    arbitrary_hosts: bool,
    arbitrary_ports: bool,
    host_options: Vec<HostOption>,
    cidr: Option<CidrFilter>,
}

impl AddressPolicy {
    /// Build and validate a policy from configuration.
    ///
    /// # Errors
    ///
    /// - `arbitrary_ports` without `arbitrary_hosts`
    /// - both a CIDR whitelist and blacklist
    /// - a malformed `name:host:port` option or CIDR entry
    pub fn from_config(cfg: &PolicyConfig) -> Result<Self, ConfigError> {
        if cfg.arbitrary_ports && !cfg.arbitrary_hosts {
            return Err(ConfigError::ArbitraryPortsRequireHosts);
        }
        if !cfg.cidr_whitelist.is_empty() && !cfg.cidr_blacklist.is_empty() {
            return Err(ConfigError::CidrConflict);
        }

        let host_options = cfg
            .host_options
            .iter()
            .map(|raw| parse_host_option(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let cidr = if !cfg.cidr_whitelist.is_empty() {
            Some(CidrFilter {
                networks: parse_cidr_list(&cfg.cidr_whitelist)?,
                mode: CidrMode::Whitelist,
            })
        } else if !cfg.cidr_blacklist.is_empty() {
            Some(CidrFilter {
                networks: parse_cidr_list(&cfg.cidr_blacklist)?,
                mode: CidrMode::Blacklist,
            })
        } else {
            None
        };

        Ok(Self {
            default_host: cfg.host.clone(),
            default_port: cfg.port,
            arbitrary_hosts: cfg.arbitrary_hosts,
            arbitrary_ports: cfg.arbitrary_ports,
            host_options,
            cidr,
        })
    }

    /// Decide whether the requested destination may be dialed.
    ///
    /// `None` (or an empty segment) means "use the configured default". On
    /// success returns the canonical dial address: IPv6 literals are
    /// bracketed (`[::1]:5900`), everything else joins as `host:port`.
    pub async fn authorize(
        &self,
        req_host: Option<&str>,
        req_port: Option<&str>,
    ) -> Result<String, PolicyError> {
        let host = match req_host.filter(|h| !h.is_empty()) {
            None => self.default_host.clone(),
            Some(h) => {
                if !self.host_options.is_empty() {
                    if !self.host_options.iter().any(|o| o.host == h) {
                        return Err(PolicyError::HostNotInOptions);
                    }
                } else if !self.arbitrary_hosts {
                    return Err(PolicyError::ArbitraryHostsDisabled);
                }
                h.to_string()
            }
        };

        let port = match req_port.filter(|p| !p.is_empty()) {
            None => self.default_port.to_string(),
            Some(p) => {
                if !self.host_options.is_empty() {
                    if !self.host_options.iter().any(|o| o.port == p) {
                        return Err(PolicyError::PortNotInOptions);
                    }
                } else if !self.arbitrary_ports {
                    return Err(PolicyError::ArbitraryPortsDisabled);
                }
                p.to_string()
            }
        };

        if let Some(filter) = &self.cidr {
            filter
                .check_host(&host)
                .await
                .map_err(|reason| PolicyError::NotAllowed {
                    target: format!("{host}:{port}"),
                    reason,
                })?;
        }

        Ok(canonical_addr(&host, &port))
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn arbitrary_hosts(&self) -> bool {
        self.arbitrary_hosts
    }

    pub fn arbitrary_ports(&self) -> bool {
        self.arbitrary_ports
    }

    pub fn host_options(&self) -> &[HostOption] {
        &self.host_options
    }

    pub fn cidr(&self) -> Option<&CidrFilter> {
        self.cidr.as_ref()
    }
}

/// Join host and port, bracketing IPv6 literals so the result is dialable.
fn canonical_addr(host: &str, port: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

fn parse_host_option(raw: &str) -> Result<HostOption, ConfigError> {
    let mut parts = raw.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(host), Some(port)) if !host.is_empty() && !port.is_empty() => {
            Ok(HostOption {
                name: name.to_string(),
                host: host.to_string(),
                port: port.to_string(),
            })
        }
        _ => Err(ConfigError::HostOption(raw.to_string())),
    }
}

fn parse_cidr_list(entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            entry.parse::<IpNet>().map_err(|source| ConfigError::Cidr {
                entry: entry.clone(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cfg: PolicyConfig) -> AddressPolicy {
        AddressPolicy::from_config(&cfg).unwrap()
    }

    fn base_cfg() -> PolicyConfig {
        PolicyConfig::default()
    }

    #[tokio::test]
    async fn default_destination_allowed() {
        let p = policy(base_cfg());
        assert_eq!(p.authorize(None, None).await.unwrap(), "localhost:5900");
    }

    #[tokio::test]
    async fn empty_segments_fall_back_to_defaults() {
        let p = policy(base_cfg());
        assert_eq!(
            p.authorize(Some(""), Some("")).await.unwrap(),
            "localhost:5900"
        );
    }

    #[tokio::test]
    async fn explicit_host_denied_by_default() {
        let p = policy(base_cfg());
        let err = p.authorize(Some("test"), None).await.unwrap_err();
        assert_eq!(err.to_string(), "--arbitrary-hosts disabled");
    }

    #[tokio::test]
    async fn explicit_port_denied_without_arbitrary_ports() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        let p = policy(cfg);
        let err = p.authorize(Some("test"), Some("1234")).await.unwrap_err();
        assert_eq!(err.to_string(), "--arbitrary-ports disabled");
    }

    #[tokio::test]
    async fn arbitrary_host_uses_default_port() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.host = "example.com".to_string();
        cfg.port = 1234;
        let p = policy(cfg);
        assert_eq!(p.authorize(Some("test"), None).await.unwrap(), "test:1234");
    }

    #[tokio::test]
    async fn arbitrary_host_and_port() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.arbitrary_ports = true;
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("test"), Some("3456")).await.unwrap(),
            "test:3456"
        );
    }

    #[tokio::test]
    async fn host_option_member_allowed() {
        let mut cfg = base_cfg();
        cfg.host_options = vec!["dummy:hostoption:5900".to_string()];
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("hostoption"), Some("5900")).await.unwrap(),
            "hostoption:5900"
        );
    }

    #[tokio::test]
    async fn host_option_non_member_denied() {
        let mut cfg = base_cfg();
        // The toggles are irrelevant once options exist
        cfg.arbitrary_hosts = true;
        cfg.arbitrary_ports = true;
        cfg.host_options = vec!["dummy:hostoption:5900".to_string()];
        let p = policy(cfg);
        let err = p.authorize(Some("other"), None).await.unwrap_err();
        assert_eq!(err.to_string(), "host is not part of options");
        let err = p
            .authorize(Some("hostoption"), Some("1234"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "port is not part of options");
    }

    #[tokio::test]
    async fn host_and_port_membership_are_independent() {
        // {a,1} and {b,2} admit the cross pair (a,2). Long-standing option
        // list behavior; do not "fix" without revisiting the wire contract.
        let mut cfg = base_cfg();
        cfg.host_options = vec!["one:hosta:1".to_string(), "two:hostb:2".to_string()];
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("hosta"), Some("2")).await.unwrap(),
            "hosta:2"
        );
    }

    #[tokio::test]
    async fn host_options_allow_member_even_with_toggles_off() {
        let mut cfg = base_cfg();
        cfg.host_options = vec!["dummy:hostoption:5900".to_string()];
        assert!(!cfg.arbitrary_hosts);
        let p = policy(cfg);
        assert!(p.authorize(Some("hostoption"), None).await.is_ok());
    }

    #[tokio::test]
    async fn cidr_whitelist_allows_listed_ip() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.arbitrary_ports = true;
        cfg.cidr_whitelist = vec!["192.168.0.0/24".to_string(), "10.0.0.0/24".to_string()];
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("10.0.0.1"), None).await.unwrap(),
            "10.0.0.1:5900"
        );
    }

    #[tokio::test]
    async fn cidr_whitelist_denies_unlisted_ip() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_whitelist = vec!["192.168.0.0/24".to_string(), "10.0.0.0/24".to_string()];
        let p = policy(cfg);
        let err = p.authorize(Some("127.0.0.1"), None).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("connect 127.0.0.1:5900 not allowed:"), "{msg}");
        assert!(msg.contains("does not match any whitelisted cidr"), "{msg}");
    }

    #[tokio::test]
    async fn cidr_blacklist_denies_listed_ip() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_blacklist = vec!["192.168.0.0/24".to_string(), "10.0.0.0/24".to_string()];
        let p = policy(cfg);
        let err = p.authorize(Some("10.0.0.1"), None).await.unwrap_err();
        assert!(
            err.to_string().contains("matches blacklisted cidr 10.0.0.0/24"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn cidr_blacklist_allows_unlisted_ip() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_blacklist = vec!["192.168.0.0/24".to_string(), "10.0.0.0/24".to_string()];
        let p = policy(cfg);
        assert!(p.authorize(Some("127.0.0.1"), None).await.is_ok());
    }

    #[tokio::test]
    async fn cidr_applies_to_ipv6() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_whitelist = vec!["a:b:c:d:a:b:c:d/120".to_string()];
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("a:b:c:d:a:b:c:d"), None).await.unwrap(),
            "[a:b:c:d:a:b:c:d]:5900"
        );
        assert!(p.authorize(Some("a:b:c:d:a:b:d:d"), None).await.is_err());
    }

    #[tokio::test]
    async fn ipv6_literal_is_bracketed() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.arbitrary_ports = true;
        let p = policy(cfg);
        assert_eq!(
            p.authorize(Some("::1"), Some("5900")).await.unwrap(),
            "[::1]:5900"
        );
    }

    #[test]
    fn config_rejects_arbitrary_ports_without_hosts() {
        let mut cfg = base_cfg();
        cfg.arbitrary_ports = true;
        let err = AddressPolicy::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("requires arbitrary-hosts"));
    }

    #[test]
    fn config_rejects_both_cidr_lists() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_whitelist = vec!["10.0.0.0/24".to_string()];
        cfg.cidr_blacklist = vec!["192.168.0.0/24".to_string()];
        let err = AddressPolicy::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn config_rejects_bad_cidr() {
        let mut cfg = base_cfg();
        cfg.arbitrary_hosts = true;
        cfg.cidr_whitelist = vec!["192.168.0.0.123.4/24".to_string()];
        let err = AddressPolicy::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("192.168.0.0.123.4/24"));
    }

    #[test]
    fn config_rejects_malformed_host_option() {
        let mut cfg = base_cfg();
        cfg.host_options = vec!["name-only".to_string()];
        assert!(AddressPolicy::from_config(&cfg).is_err());
    }

    #[test]
    fn cidr_list_order_preserved() {
        let entries = vec![
            "127.0.0.0/16".to_string(),
            "192.168.0.0/24".to_string(),
            "a:b:c:d:a:b:c:0/120".to_string(),
        ];
        let nets = parse_cidr_list(&entries).unwrap();
        for (net, entry) in nets.iter().zip(&entries) {
            assert_eq!(&net.to_string(), entry);
        }
    }
}
