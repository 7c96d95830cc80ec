//! Typed configuration loaded from a TOML file.

use std::path::Path;
use std::str::FromStr;

use n0_error::{AnyError, Result, StdResultExt, anyerr};
use serde::{Deserialize, Deserializer};
use tracing::info;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxySection,
}

impl Config {
    /// Loads and parses the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .std_context(format!("failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).std_context(format!("failed to parse {}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// The `[proxy]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    /// Terminate TLS on the listener with a locally issued certificate.
    pub use_https: bool,
    /// Port for the CRL responder; 0 disables it.
    pub crl_port: u16,
    /// PEM certificate chain for the listener; empty selects an ephemeral
    /// self-signed certificate.
    pub cert_file: String,
    /// PEM private key matching `cert_file`.
    pub key_file: String,
    pub load_balancing_strategy: Strategy,
    /// Legacy single upstream, merged ahead of `upstreams`.
    pub upstream: Option<Upstream>,
    pub upstreams: Vec<Upstream>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            port: 8080,
            use_https: false,
            crl_port: 0,
            cert_file: String::new(),
            key_file: String::new(),
            load_balancing_strategy: Strategy::Failover,
            upstream: None,
            upstreams: Vec::new(),
        }
    }
}

impl ProxySection {
    /// The legacy single upstream and the list, merged into one ordered
    /// list. Ordering is authoritative for failover and for the starting
    /// rotation of round-robin.
    pub fn merged_upstreams(&self) -> Vec<Upstream> {
        let mut merged = Vec::with_capacity(self.upstreams.len() + 1);
        if let Some(legacy) = &self.upstream {
            merged.push(legacy.clone());
        }
        merged.extend(self.upstreams.iter().cloned());
        merged
    }
}

/// How the selector walks the enabled upstream list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Always try upstreams in declared order.
    Failover,
    /// Rotate the starting position per connection.
    RoundRobin,
}

impl FromStr for Strategy {
    type Err = AnyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("failover") {
            Ok(Self::Failover)
        } else if s.eq_ignore_ascii_case("roundrobin") {
            Ok(Self::RoundRobin)
        } else {
            Err(anyerr!("unknown load balancing strategy {s:?}"))
        }
    }
}

impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wire protocol spoken to one upstream entry.
///
/// Unrecognized type strings load fine and are carried as
/// [`Other`](Self::Other); they fail each connection attempt at dispatch
/// time rather than preventing startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamKind {
    Socks5,
    Http,
    /// Accepted in configuration; skipped during selection.
    Direct,
    /// Any other configured value, kept verbatim.
    Other(String),
}

impl FromStr for UpstreamKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("socks5") {
            Ok(Self::Socks5)
        } else if s.eq_ignore_ascii_case("http") {
            Ok(Self::Http)
        } else if s.eq_ignore_ascii_case("direct") {
            Ok(Self::Direct)
        } else {
            Ok(Self::Other(s.to_string()))
        }
    }
}

impl<'de> Deserialize<'de> for UpstreamKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One upstream proxy entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Upstream {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: UpstreamKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub process: Option<ProcessConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl Upstream {
    /// Display label, e.g. `socks5://127.0.0.1:1080`.
    pub fn label(&self) -> String {
        let scheme = match &self.kind {
            UpstreamKind::Socks5 => "socks5",
            UpstreamKind::Http => "http",
            UpstreamKind::Direct => "direct",
            UpstreamKind::Other(kind) => kind.as_str(),
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A helper process owned by an upstream entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    pub auto_start: bool,
    /// Executable path; `%NAME%` environment references are expanded at
    /// launch time.
    pub file_name: String,
    /// Whitespace-separated argument string, expanded like `file_name`.
    pub arguments: String,
    pub working_directory: String,
    pub startup_delay_ms: u64,
    pub redirect_output: bool,
    pub auto_restart: bool,
    /// 0 means unlimited.
    pub max_restart_attempts: u32,
    pub restart_delay_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            file_name: String::new(),
            arguments: String::new(),
            working_directory: String::new(),
            startup_delay_ms: 1000,
            redirect_output: true,
            auto_restart: true,
            max_restart_attempts: 5,
            restart_delay_ms: 3000,
        }
    }
}

/// Active TCP health checking for an upstream with a supervised process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            failure_threshold: 3,
        }
    }
}

fn default_true() -> bool {
    true
}
