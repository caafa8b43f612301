//! Datagram-tunnel engine (hysteria2)

use super::process::{temp_document, write_document, EngineProcess, EngineProcessSet, LaunchPlan};
use super::{host_port, ConfigMode, EngineSettings, ProtocolConverter};
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProfileType};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Hysteria client configuration document
#[derive(Debug, Clone, Serialize)]
pub struct HysteriaConfig {
    pub server: String,
    pub auth: String,
    pub tls: HysteriaTls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<HysteriaObfs>,
    pub socks5: HysteriaListen,
    pub transport: HysteriaTransport,
}

#[derive(Debug, Clone, Serialize)]
pub struct HysteriaTls {
    pub sni: String,
    pub insecure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HysteriaObfs {
    #[serde(rename = "type")]
    pub kind: String,
    pub salamander: HysteriaSalamander,
}

#[derive(Debug, Clone, Serialize)]
pub struct HysteriaSalamander {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HysteriaListen {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HysteriaTransport {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug)]
pub struct HysteriaEngine {
    binary: PathBuf,
    markers: Vec<Regex>,
    settings: Arc<EngineSettings>,
    converter: Option<Arc<ProtocolConverter>>,
}

impl HysteriaEngine {
    pub fn new(
        binary: PathBuf,
        markers: Vec<Regex>,
        settings: Arc<EngineSettings>,
        converter: Option<Arc<ProtocolConverter>>,
    ) -> Self {
        Self {
            binary,
            markers,
            settings,
            converter,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn build_config(&self, profile: &ConnectionProfile, mode: ConfigMode) -> Result<HysteriaConfig> {
        if profile.kind != ProfileType::Hysteria2 {
            return Err(EngineError::UnsupportedProfile(format!(
                "{} is not served by hysteria",
                profile.kind
            )));
        }
        let auth = profile
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EngineError::Config("hysteria2 profile has no password".to_string()))?;

        let socks_port = match mode {
            ConfigMode::Live => self.settings.socks_port,
            ConfigMode::Test { socks_port } => socks_port,
        };

        let obfs = match (profile.extra("obfs"), profile.extra("obfs-password")) {
            (Some(kind), Some(password)) => Some(HysteriaObfs {
                kind: kind.to_string(),
                salamander: HysteriaSalamander {
                    password: password.to_string(),
                },
            }),
            _ => None,
        };

        Ok(HysteriaConfig {
            server: host_port(&profile.server, profile.port),
            auth,
            tls: HysteriaTls {
                sni: profile.server_name().to_string(),
                insecure: matches!(profile.extra("insecure"), Some("1" | "true")),
            },
            obfs,
            socks5: HysteriaListen {
                listen: host_port(&self.settings.listen, socks_port),
            },
            transport: HysteriaTransport {
                kind: "udp".to_string(),
            },
        })
    }

    pub async fn start(&self, profile: &ConnectionProfile) -> Result<EngineProcessSet> {
        let converter = self.converter.as_ref().ok_or_else(|| {
            EngineError::UnsupportedProfile("hysteria2 needs the xray converter, which is not configured".to_string())
        })?;

        let config = self.build_config(profile, ConfigMode::Live)?;
        let path = self.settings.data_dir.join("hysteria_config.json");
        write_document(&path, &config)?;

        let mut process = EngineProcess::spawn(&self.plan(&path))?;
        process.await_startup(self.settings.ready_grace).await?;
        converter.chain(process).await
    }

    pub(crate) fn test_plan(
        &self,
        profile: &ConnectionProfile,
        socks_port: u16,
    ) -> Result<(LaunchPlan, Option<NamedTempFile>)> {
        let config = self.build_config(profile, ConfigMode::Test { socks_port })?;
        let file = temp_document(&self.settings.probe_dir(), "hysteria-probe-", &config)?;
        let plan = self.plan(file.path());
        Ok((plan, Some(file)))
    }

    fn plan(&self, config_path: &Path) -> LaunchPlan {
        LaunchPlan {
            name: "hysteria",
            program: self.binary.clone(),
            args: vec!["client".into(), "-c".into(), config_path.into()],
            markers: self.markers.clone(),
        }
    }
}
