//! Process-level gateway settings.
//!
//! These map to an optional TOML / YAML / JSON file plus `SWITCHYARD_*`
//! environment overrides. Every field has a default so that the gateway runs
//! with nothing but a definition file. Durations use humantime notation
//! (`"500ms"`, `"30s"`, `"2m"`).
use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_definition_path() -> String {
    "apis.yaml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Location of the route definition file.
    #[serde(default = "default_definition_path")]
    pub definition_path: String,
    /// Reload the definition when the file changes.
    #[serde(default = "default_true")]
    pub watch: bool,
    /// Settle time after a change event before the definition is reloaded.
    #[serde(default = "default_watch_debounce", with = "duration_str")]
    pub watch_debounce: Duration,
    /// How long in-flight requests may take to drain on shutdown.
    #[serde(default = "default_grace_timeout", with = "duration_str")]
    pub grace_timeout: Duration,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub real_ip: RealIpConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            definition_path: default_definition_path(),
            watch: true,
            watch_debounce: default_watch_debounce(),
            grace_timeout: default_grace_timeout(),
            log: LogConfig::default(),
            transport: TransportConfig::default(),
            real_ip: RealIpConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `switchyard=debug,info`.
    pub level: String,
    pub json: bool,
    /// Attach the span list to JSON records.
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: false,
        }
    }
}

/// Upstream connection pool settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connect timeout.
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// TCP keepalive interval on upstream sockets.
    #[serde(with = "duration_str")]
    pub keep_alive: Duration,
    /// Idle pooled connections are closed after this long.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Deadline for upstream response headers, counted from dispatch. Covers
    /// connection setup and the TLS handshake.
    #[serde(with = "duration_str")]
    pub response_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            keep_alive: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            response_timeout: Duration::from_secs(10),
            max_idle_per_host: 128,
        }
    }
}

/// Client address resolution for requests arriving through proxies.
///
/// When enabled, the client IP is taken from `True-Client-IP`, `X-Real-IP`
/// or the first `X-Forwarded-For` entry, in that order. Headers are only
/// honoured when the connecting peer is listed in `trusted_proxies`; an
/// empty list trusts every peer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RealIpConfig {
    pub enabled: bool,
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RealIpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_proxies: Vec::new(),
        }
    }
}

impl RealIpConfig {
    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.is_empty() || self.trusted_proxies.contains(&peer)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert!(config.watch);
        assert_eq!(config.grace_timeout, Duration::from_secs(30));
        assert_eq!(config.transport.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.transport.max_idle_per_host, 128);
        assert!(config.real_ip.enabled);
        assert!(config.real_ip.trusted_proxies.is_empty());
    }

    #[test]
    fn test_real_ip_trusted_proxies() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"real_ip": {"trusted_proxies": ["10.0.0.1", "::1"]}}"#)
                .unwrap();
        assert!(config.real_ip.enabled);
        assert!(config.real_ip.trusts("10.0.0.1".parse().unwrap()));
        assert!(config.real_ip.trusts("::1".parse().unwrap()));
        assert!(!config.real_ip.trusts("10.0.0.2".parse().unwrap()));
        assert!(RealIpConfig::default().trusts("192.0.2.9".parse().unwrap()));
    }

    #[test]
    fn test_humantime_durations() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"grace_timeout": "1m 30s", "transport": {"response_timeout": "250ms"}}"#,
        )
        .unwrap();
        assert_eq!(config.grace_timeout, Duration::from_secs(90));
        assert_eq!(
            config.transport.response_timeout,
            Duration::from_millis(250)
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.transport.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.watch_debounce, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let result: Result<GatewayConfig, _> =
            serde_json::from_str(r#"{"grace_timeout": "soon"}"#);
        assert!(result.is_err());
    }
}
