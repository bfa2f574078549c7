//! Server configuration.
//!
//! A single [`Config`] is loaded once at start-up (CLI path via `clap`,
//! parsed as TOML) and handed to [`crate::server::Server`] as an
//! `Arc<Config>`. It never mutates after `Server::start` — reconfiguration
//! requires a restart.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub domain: DomainConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub inspect: InspectConfig,
    #[serde(default)]
    pub custom_domains: CustomDomainsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            domain: DomainConfig::default(),
            auth: AuthConfig::default(),
            inspect: InspectConfig::default(),
            custom_domains: CustomDomainsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.tcp_port_range.min > self.server.tcp_port_range.max {
            anyhow::bail!("server.tcp_port_range.min must be <= max");
        }
        if self.server.udp_port_range.min > self.server.udp_port_range.max {
            anyhow::bail!("server.udp_port_range.min must be <= max");
        }
        if self.domain.base.trim().is_empty() {
            anyhow::bail!("domain.base must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

fn default_tcp_range() -> PortRange {
    PortRange { min: 40000, max: 40999 }
}
fn default_udp_range() -> PortRange {
    PortRange { min: 41000, max: 41999 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_tcp_range")]
    pub tcp_port_range: PortRange,
    #[serde(default = "default_udp_range")]
    pub udp_port_range: PortRange,
    #[serde(default = "default_max_control_conns")]
    pub max_control_conns: usize,
    #[serde(default = "default_max_conns_per_ip")]
    pub max_conns_per_ip: usize,
    #[serde(default = "default_accept_rate_global")]
    pub accept_rate_global: u32,
    #[serde(default = "default_accept_rate_per_ip")]
    pub accept_rate_per_ip: u32,
    #[serde(default)]
    pub ip_ban: IpBanConfig,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_yamux_window")]
    pub yamux_window_size: u32,
    #[serde(default = "default_proxy_buffer")]
    pub proxy_buffer_size: usize,
    #[serde(default = "default_tcp_buffer")]
    pub tcp_buffer_size: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests_per_tunnel: usize,
    #[serde(default = "default_http_read_timeout")]
    pub http_read_timeout_secs: u64,
    #[serde(default = "default_http_write_timeout")]
    pub http_write_timeout_secs: u64,
    #[serde(default = "default_http_idle_timeout")]
    pub http_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            tcp_port_range: default_tcp_range(),
            udp_port_range: default_udp_range(),
            max_control_conns: default_max_control_conns(),
            max_conns_per_ip: default_max_conns_per_ip(),
            accept_rate_global: default_accept_rate_global(),
            accept_rate_per_ip: default_accept_rate_per_ip(),
            ip_ban: IpBanConfig::default(),
            compression_enabled: true,
            yamux_window_size: default_yamux_window(),
            proxy_buffer_size: default_proxy_buffer(),
            tcp_buffer_size: default_tcp_buffer(),
            max_concurrent_requests_per_tunnel: default_max_concurrent_requests(),
            http_read_timeout_secs: default_http_read_timeout(),
            http_write_timeout_secs: default_http_write_timeout(),
            http_idle_timeout_secs: default_http_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auth_threshold")]
    pub auth_threshold: u32,
    #[serde(default = "default_auth_window")]
    pub auth_window_secs: u64,
    #[serde(default = "default_flood_threshold")]
    pub flood_threshold: u32,
    #[serde(default = "default_flood_window")]
    pub flood_window_secs: u64,
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,
    #[serde(default = "default_max_ban_duration")]
    pub max_ban_duration_secs: u64,
}

impl Default for IpBanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_threshold: default_auth_threshold(),
            auth_window_secs: default_auth_window(),
            flood_threshold: default_flood_threshold(),
            flood_window_secs: default_flood_window(),
            ban_duration_secs: default_ban_duration(),
            max_ban_duration_secs: default_max_ban_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_min_version")]
    pub min_version: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            https_port: default_https_port(),
            min_version: default_min_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default = "default_base_domain")]
    pub base: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self { base: default_base_domain() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Static bearer tokens accepted unconditionally (legacy mode); maps
    /// token -> user id. Empty by default.
    #[serde(default)]
    pub static_tokens: std::collections::HashMap<String, u64>,
    /// HMAC secret used to validate bearer JWTs, if JWT auth is enabled.
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomDomainsConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_control_port() -> u16 { 7000 }
fn default_http_port() -> u16 { 8080 }
fn default_https_port() -> u16 { 8443 }
fn default_bind_address() -> IpAddr { IpAddr::from([0, 0, 0, 0]) }
fn default_max_control_conns() -> usize { 1000 }
fn default_max_conns_per_ip() -> usize { 50 }
fn default_accept_rate_global() -> u32 { 50 }
fn default_accept_rate_per_ip() -> u32 { 5 }
fn default_yamux_window() -> u32 { 4 * 1024 * 1024 }
fn default_proxy_buffer() -> usize { 32 * 1024 }
fn default_tcp_buffer() -> usize { 256 * 1024 }
fn default_max_concurrent_requests() -> usize { 100 }
fn default_http_read_timeout() -> u64 { 30 }
fn default_http_write_timeout() -> u64 { 30 }
fn default_http_idle_timeout() -> u64 { 120 }
fn default_min_version() -> String { "1.2".to_string() }
fn default_base_domain() -> String { "fxtun.dev".to_string() }
fn default_auth_threshold() -> u32 { 5 }
fn default_auth_window() -> u64 { 300 }
fn default_flood_threshold() -> u32 { 20 }
fn default_flood_window() -> u64 { 10 }
fn default_ban_duration() -> u64 { 3600 }
fn default_max_ban_duration() -> u64 { 86400 }
fn default_max_entries() -> usize { 1000 }
fn default_max_body_size() -> usize { 1024 * 1024 }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut cfg = Config::default();
        cfg.server.tcp_port_range = PortRange { min: 100, max: 10 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_str = r#"
            [domain]
            base = "example.com"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.domain.base, "example.com");
        assert_eq!(cfg.server.control_port, 7000);
    }
}
