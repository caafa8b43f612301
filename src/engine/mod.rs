//! Engine abstraction over the external tunneling binaries
//!
//! Each protocol family is driven by one engine. An engine turns a
//! [`ConnectionProfile`] into a configuration document, launches the binary
//! that consumes it, and can run a throwaway instance on a test port to
//! measure latency.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProfileType, PROBE_FAILED};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

pub mod converter;
pub mod hysteria;
pub mod process;
pub mod shadowsocks;
pub mod xray;

pub use converter::ProtocolConverter;
pub use hysteria::HysteriaEngine;
pub use process::{EngineProcess, EngineProcessSet, LaunchPlan, Readiness};
pub use shadowsocks::ShadowsocksEngine;
pub use xray::XrayEngine;

/// Which configuration an engine should emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    /// SOCKS and HTTP inbounds on the live ports
    Live,
    /// A single SOCKS inbound on the given test port
    Test { socks_port: u16 },
}

/// Engine family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Xray,
    Hysteria,
    Shadowsocks,
}

impl EngineKind {
    /// The family that serves a profile type
    pub fn for_profile(kind: ProfileType) -> Self {
        match kind {
            ProfileType::Vmess | ProfileType::Vless | ProfileType::Trojan => EngineKind::Xray,
            ProfileType::Hysteria2 => EngineKind::Hysteria,
            ProfileType::Shadowsocks => EngineKind::Shadowsocks,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Xray => "xray",
            EngineKind::Hysteria => "hysteria",
            EngineKind::Shadowsocks => "shadowsocks",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency probe timing and target
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub target_url: String,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
    pub concurrency: usize,
    pub isolate_ports: bool,
    pub xray_port: u16,
    pub hysteria_port: u16,
    pub shadowsocks_port: u16,
}

impl ProbeSettings {
    /// Fixed test port of an engine family
    pub fn fixed_port(&self, kind: EngineKind) -> u16 {
        match kind {
            EngineKind::Xray => self.xray_port,
            EngineKind::Hysteria => self.hysteria_port,
            EngineKind::Shadowsocks => self.shadowsocks_port,
        }
    }
}

/// Settings shared by every engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub listen: String,
    pub socks_port: u16,
    pub http_port: u16,
    pub proxy_host: String,
    pub ready_grace: Duration,
    pub converter_grace: Duration,
    pub stop_timeout: Duration,
    pub probe: ProbeSettings,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir(),
            listen: config.ports.listen.clone(),
            socks_port: config.ports.socks,
            http_port: config.ports.http,
            proxy_host: config.system_proxy.host.clone(),
            ready_grace: config.ready_grace(),
            converter_grace: config.converter_grace(),
            stop_timeout: config.stop_timeout(),
            probe: ProbeSettings {
                target_url: config.probe.target_url.clone(),
                ready_timeout: Duration::from_millis(config.probe.ready_timeout_ms),
                request_timeout: Duration::from_millis(config.probe.request_timeout_ms),
                concurrency: config.probe.concurrency,
                isolate_ports: config.probe.isolate_ports,
                xray_port: config.probe.xray_port,
                hysteria_port: config.probe.hysteria_port,
                shadowsocks_port: config.probe.shadowsocks_port,
            },
        }
    }

    /// Directory for probe temp files
    pub fn probe_dir(&self) -> PathBuf {
        self.data_dir.join("probes")
    }
}

/// One engine, tagged by family
#[derive(Debug)]
pub enum Engine {
    Xray(XrayEngine),
    Hysteria(HysteriaEngine),
    Shadowsocks(ShadowsocksEngine),
}

impl Engine {
    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Xray(_) => EngineKind::Xray,
            Engine::Hysteria(_) => EngineKind::Hysteria,
            Engine::Shadowsocks(_) => EngineKind::Shadowsocks,
        }
    }

    fn settings(&self) -> &EngineSettings {
        match self {
            Engine::Xray(e) => e.settings(),
            Engine::Hysteria(e) => e.settings(),
            Engine::Shadowsocks(e) => e.settings(),
        }
    }

    /// Configuration document for `profile`
    ///
    /// Shadowsocks has no document of its own; its value is the flag set
    /// passed on the command line.
    pub fn build_config(&self, profile: &ConnectionProfile, mode: ConfigMode) -> Result<serde_json::Value> {
        let value = match self {
            Engine::Xray(e) => serde_json::to_value(e.build_config(profile, mode)?)?,
            Engine::Hysteria(e) => serde_json::to_value(e.build_config(profile, mode)?)?,
            Engine::Shadowsocks(e) => serde_json::to_value(e.build_config(profile, mode)?)?,
        };
        Ok(value)
    }

    /// Launch the live tunnel for `profile`
    pub async fn start(&self, profile: &ConnectionProfile) -> Result<EngineProcessSet> {
        match self {
            Engine::Xray(e) => e.start(profile).await,
            Engine::Hysteria(e) => e.start(profile).await,
            Engine::Shadowsocks(e) => e.start(profile).await,
        }
    }

    /// Measure latency through a throwaway instance on `socks_port`
    ///
    /// Returns the round trip in milliseconds, or [`PROBE_FAILED`]. The
    /// instance and its temp config are gone when this returns.
    pub async fn test(&self, profile: &ConnectionProfile, socks_port: u16) -> i64 {
        let planned = match self {
            Engine::Xray(e) => e.test_plan(profile, socks_port),
            Engine::Hysteria(e) => e.test_plan(profile, socks_port),
            Engine::Shadowsocks(e) => e.test_plan(profile, socks_port),
        };

        let outcome = match planned {
            Ok((plan, config_file)) => measure(&plan, config_file, self.settings(), socks_port).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ms) => {
                log::info!("Latency of '{}': {} ms", profile.name, ms);
                ms
            }
            Err(e) => {
                log::warn!("Latency test of '{}' failed: {}", profile.name, e);
                PROBE_FAILED
            }
        }
    }
}

/// Engines keyed by family
///
/// A family whose binary is not configured is absent, so its profile types
/// are reported as unsupported.
#[derive(Debug)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Engine>,
    settings: Arc<EngineSettings>,
}

impl EngineRegistry {
    /// Empty registry
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        Self {
            engines: HashMap::new(),
            settings,
        }
    }

    /// Registry with an engine for every configured binary
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = Arc::new(EngineSettings::from_config(config));
        let mut registry = Self::new(settings.clone());

        let converter = match &config.binaries.xray {
            Some(binary) => Some(Arc::new(ProtocolConverter::new(
                binary.clone(),
                compile_markers(&config.readiness.xray)?,
                settings.clone(),
            ))),
            None => None,
        };

        if let Some(binary) = &config.binaries.xray {
            registry.register(Engine::Xray(XrayEngine::new(
                binary.clone(),
                compile_markers(&config.readiness.xray)?,
                settings.clone(),
            )));
        }
        if let Some(binary) = &config.binaries.hysteria {
            registry.register(Engine::Hysteria(HysteriaEngine::new(
                binary.clone(),
                compile_markers(&config.readiness.hysteria)?,
                settings.clone(),
                converter.clone(),
            )));
        }
        if let Some(binary) = &config.binaries.shadowsocks {
            registry.register(Engine::Shadowsocks(ShadowsocksEngine::new(
                binary.clone(),
                compile_markers(&config.readiness.shadowsocks)?,
                settings.clone(),
                converter,
            )));
        }

        log::debug!(
            "Registered engines: {:?}",
            registry.engines.keys().map(EngineKind::as_str).collect::<Vec<_>>()
        );
        Ok(registry)
    }

    /// Add or replace the engine of a family
    pub fn register(&mut self, engine: Engine) {
        self.engines.insert(engine.kind(), engine);
    }

    /// Engine that serves `profile`
    pub fn select(&self, profile: &ConnectionProfile) -> Result<&Engine> {
        let kind = EngineKind::for_profile(profile.kind);
        self.engines.get(&kind).ok_or_else(|| {
            EngineError::UnsupportedProfile(format!("{} (no {} engine configured)", profile.kind, kind))
        })
    }

    pub fn get(&self, kind: EngineKind) -> Option<&Engine> {
        self.engines.get(&kind)
    }

    pub fn settings(&self) -> &Arc<EngineSettings> {
        &self.settings
    }
}

/// Compile readiness markers, case-insensitive
pub fn compile_markers(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(EngineError::from)
        })
        .collect()
}

/// Run a future and report how long it took
pub(crate) async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let started = tokio::time::Instant::now();
    let output = future.await;
    (output, started.elapsed())
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Spawn, wait for readiness, time one request, then tear down
async fn measure(
    plan: &LaunchPlan,
    config_file: Option<NamedTempFile>,
    settings: &EngineSettings,
    socks_port: u16,
) -> Result<i64> {
    let mut process = EngineProcess::spawn(plan)?;
    let outcome = request_through(&mut process, settings, socks_port).await;
    process.kill().await;

    if let Some(file) = config_file {
        if let Err(e) = file.close() {
            log::warn!("Failed to remove probe config: {e}");
        }
    }
    outcome
}

async fn request_through(process: &mut EngineProcess, settings: &EngineSettings, socks_port: u16) -> Result<i64> {
    let probe = &settings.probe;
    match process.wait_ready(probe.ready_timeout).await {
        Readiness::Ready => {}
        Readiness::TimedOut => {
            return Err(EngineError::Timeout(format!(
                "{} gave no readiness marker within {:?}",
                process.name(),
                probe.ready_timeout
            )))
        }
        Readiness::Exited(code) => {
            return Err(EngineError::ProcessExited(format!(
                "{} exited before becoming ready (code {:?})",
                process.name(),
                code
            )))
        }
    }

    let proxy = reqwest::Proxy::all(format!("socks5h://{}", host_port(&settings.listen, socks_port)))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(probe.request_timeout)
        .build()?;

    let (response, elapsed) = timed(client.get(&probe.target_url).send()).await;
    response
        .map_err(|e| EngineError::Network(format!("request through {} failed: {e}", process.name())))?
        .error_for_status()?;
    Ok(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
