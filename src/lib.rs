//! subtunnel - engine subsystem of a proxy subscription client
//!
//! This crate turns subscription payloads into connection profiles and runs
//! them through external tunneling binaries (xray, hysteria, ss-local).
//!
//! ## What This Crate Provides
//! - Subscription decoding and fetching (vmess, vless, trojan, hysteria2, shadowsocks)
//! - Per-engine configuration builders
//! - Supervision of the live process set with cascade teardown
//! - Latency probing through throwaway engine instances
//! - OS system proxy toggling (Windows, macOS, Linux desktops)
//! - Configuration parsing and validation (TOML format)
//!
//! ## What The Host Must Provide
//! - The engine binaries themselves
//! - Any user interface and persistence of subscriptions

pub mod config;
pub mod engine;
pub mod error;
pub mod probe;
pub mod profile;
pub mod subscription;
pub mod supervisor;
pub mod system_proxy;

#[cfg(all(test, unix))]
mod test_support;

pub use config::Config;
pub use engine::{ConfigMode, Engine, EngineKind, EngineRegistry};
pub use error::{EngineError, Result};
pub use probe::{LatencyProbe, ProbeEvent};
pub use profile::{ConnectionProfile, ProbeStatus, ProfileType, Subscription, PROBE_FAILED};
pub use subscription::{fetch_subscription, parse_subscription, ProfileCatalog};
pub use supervisor::{EngineManager, EngineState};
pub use system_proxy::{ProxyEndpoint, SystemProxy};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
