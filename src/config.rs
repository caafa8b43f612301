//! Configuration module for the subtunnel client
//!
//! This module provides TOML-based configuration parsing and validation.
//! Every section has defaults so an empty file is a valid configuration.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Locations of the external tunneling binaries
///
/// A missing entry unregisters the engine that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryConfig {
    /// Xray core, used for vmess/vless/trojan and as the SOCKS to HTTP converter
    #[serde(default = "default_xray")]
    pub xray: Option<PathBuf>,
    /// Hysteria 2 client
    #[serde(default = "default_hysteria")]
    pub hysteria: Option<PathBuf>,
    /// shadowsocks-libev `ss-local` (or a compatible client)
    #[serde(default = "default_shadowsocks")]
    pub shadowsocks: Option<PathBuf>,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            xray: default_xray(),
            hysteria: default_hysteria(),
            shadowsocks: default_shadowsocks(),
        }
    }
}

/// Local listening ports of the live tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Listen address for all local inbounds
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SOCKS inbound port
    #[serde(default = "default_socks_port")]
    pub socks: u16,
    /// HTTP inbound port (the one the system proxy points at)
    #[serde(default = "default_http_port")]
    pub http: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            socks: default_socks_port(),
            http: default_http_port(),
        }
    }
}

/// Timing of live engine startup and shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Grace delay after which a started process is assumed to be listening
    #[serde(default = "default_ready_grace")]
    pub ready_grace_ms: u64,
    /// Grace delay for the SOCKS to HTTP converter
    #[serde(default = "default_converter_grace")]
    pub converter_grace_ms: u64,
    /// Time between SIGTERM and a forced kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            ready_grace_ms: default_ready_grace(),
            converter_grace_ms: default_converter_grace(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

/// Latency probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Lightweight endpoint requested through the probe instance
    #[serde(default = "default_target_url")]
    pub target_url: String,
    /// Bound on waiting for the readiness marker
    #[serde(default = "default_probe_ready_timeout")]
    pub ready_timeout_ms: u64,
    /// Bound on the HTTP round trip
    #[serde(default = "default_probe_request_timeout")]
    pub request_timeout_ms: u64,
    /// Size of the batch worker pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Lease a distinct ephemeral port per in-flight probe
    #[serde(default = "default_true")]
    pub isolate_ports: bool,
    /// Fixed test ports, used when `isolate_ports` is off
    #[serde(default = "default_xray_test_port")]
    pub xray_port: u16,
    #[serde(default = "default_hysteria_test_port")]
    pub hysteria_port: u16,
    #[serde(default = "default_shadowsocks_test_port")]
    pub shadowsocks_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            ready_timeout_ms: default_probe_ready_timeout(),
            request_timeout_ms: default_probe_request_timeout(),
            concurrency: default_concurrency(),
            isolate_ports: true,
            xray_port: default_xray_test_port(),
            hysteria_port: default_hysteria_test_port(),
            shadowsocks_port: default_shadowsocks_test_port(),
        }
    }
}

/// Readiness markers searched for in child process output
///
/// Markers depend on the binary version, so they are regexes matched
/// case-insensitively against each output line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_xray_markers")]
    pub xray: Vec<String>,
    #[serde(default = "default_hysteria_markers")]
    pub hysteria: Vec<String>,
    #[serde(default = "default_shadowsocks_markers")]
    pub shadowsocks: Vec<String>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            xray: default_xray_markers(),
            hysteria: default_hysteria_markers(),
            shadowsocks: default_shadowsocks_markers(),
        }
    }
}

/// System proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemProxyConfig {
    /// Toggle the OS proxy together with the tunnel
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Host written into the OS proxy settings
    #[serde(default = "default_listen")]
    pub host: String,
}

impl Default for SystemProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_listen(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory for generated engine configuration files
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub binaries: BinaryConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub system_proxy: SystemProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("subtunnel")
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ports.socks == 0 || self.ports.http == 0 {
            return Err(EngineError::Config(
                "Live ports cannot be zero".to_string(),
            ));
        }

        if self.ports.socks == self.ports.http {
            return Err(EngineError::Config(format!(
                "SOCKS and HTTP ports must differ (both {})",
                self.ports.socks
            )));
        }

        let live = [self.ports.socks, self.ports.http];
        for port in [
            self.probe.xray_port,
            self.probe.hysteria_port,
            self.probe.shadowsocks_port,
        ] {
            if port == 0 || live.contains(&port) {
                return Err(EngineError::Config(format!(
                    "Test port {port} must be non-zero and differ from the live ports"
                )));
            }
        }

        if self.probe.concurrency == 0 {
            return Err(EngineError::Config(
                "Probe concurrency must be at least 1".to_string(),
            ));
        }

        if self.probe.ready_timeout_ms == 0 || self.probe.request_timeout_ms == 0 {
            return Err(EngineError::Config(
                "Probe timeouts cannot be zero".to_string(),
            ));
        }

        url::Url::parse(&self.probe.target_url)
            .map_err(|e| EngineError::Config(format!("Invalid probe target URL: {e}")))?;

        for pattern in self
            .readiness
            .xray
            .iter()
            .chain(&self.readiness.hysteria)
            .chain(&self.readiness.shadowsocks)
        {
            regex::Regex::new(pattern)?;
        }

        Ok(())
    }

    /// Ready grace as a duration
    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.startup.ready_grace_ms)
    }

    /// Converter grace as a duration
    pub fn converter_grace(&self) -> Duration {
        Duration::from_millis(self.startup.converter_grace_ms)
    }

    /// Stop escalation timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.startup.stop_timeout_ms)
    }
}

impl FromStr for Config {
    type Err = EngineError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_xray() -> Option<PathBuf> {
    Some(PathBuf::from(if cfg!(windows) { "xray.exe" } else { "xray" }))
}

fn default_hysteria() -> Option<PathBuf> {
    Some(PathBuf::from(if cfg!(windows) { "hysteria.exe" } else { "hysteria" }))
}

fn default_shadowsocks() -> Option<PathBuf> {
    Some(PathBuf::from(if cfg!(windows) { "ss-local.exe" } else { "ss-local" }))
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    10808
}

fn default_http_port() -> u16 {
    10809
}

fn default_ready_grace() -> u64 {
    1000
}

fn default_converter_grace() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    3000
}

fn default_target_url() -> String {
    "http://www.google.com/generate_204".to_string()
}

fn default_probe_ready_timeout() -> u64 {
    4000
}

fn default_probe_request_timeout() -> u64 {
    5000
}

fn default_concurrency() -> usize {
    5
}

fn default_xray_test_port() -> u16 {
    10888
}

fn default_hysteria_test_port() -> u16 {
    10887
}

fn default_shadowsocks_test_port() -> u16 {
    10886
}

fn default_xray_markers() -> Vec<String> {
    vec![r"(?i)\bstarted\b".to_string()]
}

fn default_hysteria_markers() -> Vec<String> {
    vec![r"(?i)client up|connected to server|server listening".to_string()]
}

fn default_shadowsocks_markers() -> Vec<String> {
    vec![r"(?i)listening (at|on)".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}
