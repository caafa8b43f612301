//! Multiplexed-stream engine (vmess, vless, trojan) backed by xray

use super::process::{temp_document, write_document, EngineProcess, EngineProcessSet, LaunchPlan};
use super::{ConfigMode, EngineSettings};
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProfileType};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Top-level xray configuration document
#[derive(Debug, Clone, Serialize)]
pub struct XrayConfig {
    pub log: XrayLog,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
pub struct XrayLog {
    pub loglevel: String,
}

impl Default for XrayLog {
    fn default() -> Self {
        Self {
            loglevel: "warning".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub settings: Value,
}

impl Inbound {
    pub fn socks(listen: &str, port: u16) -> Self {
        Self {
            tag: "socks-in".to_string(),
            port,
            listen: listen.to_string(),
            protocol: "socks".to_string(),
            settings: json!({ "auth": "noauth", "udp": true }),
        }
    }

    pub fn http(listen: &str, port: u16) -> Self {
        Self {
            tag: "http-in".to_string(),
            port,
            listen: listen.to_string(),
            protocol: "http".to_string(),
            settings: json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub protocol: String,
    pub settings: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

/// Engine for the xray-served protocols
#[derive(Debug)]
pub struct XrayEngine {
    binary: PathBuf,
    markers: Vec<Regex>,
    settings: Arc<EngineSettings>,
}

impl XrayEngine {
    pub fn new(binary: PathBuf, markers: Vec<Regex>, settings: Arc<EngineSettings>) -> Self {
        Self {
            binary,
            markers,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn build_config(&self, profile: &ConnectionProfile, mode: ConfigMode) -> Result<XrayConfig> {
        let listen = &self.settings.listen;
        let inbounds = match mode {
            ConfigMode::Live => vec![
                Inbound::socks(listen, self.settings.socks_port),
                Inbound::http(listen, self.settings.http_port),
            ],
            ConfigMode::Test { socks_port } => vec![Inbound::socks(listen, socks_port)],
        };

        Ok(XrayConfig {
            log: XrayLog::default(),
            inbounds,
            outbounds: vec![
                Outbound {
                    tag: Some("proxy".to_string()),
                    protocol: profile.kind.as_str().to_string(),
                    settings: outbound_settings(profile)?,
                    stream_settings: Some(stream_settings(profile)),
                },
                Outbound {
                    tag: Some("direct".to_string()),
                    protocol: "freedom".to_string(),
                    settings: json!({}),
                    stream_settings: None,
                },
            ],
        })
    }

    pub async fn start(&self, profile: &ConnectionProfile) -> Result<EngineProcessSet> {
        let config = self.build_config(profile, ConfigMode::Live)?;
        let path = self.settings.data_dir.join("config.json");
        write_document(&path, &config)?;

        let mut process = EngineProcess::spawn(&self.plan(&path))?;
        process.await_startup(self.settings.ready_grace).await?;
        Ok(EngineProcessSet::new(process))
    }

    pub(crate) fn test_plan(
        &self,
        profile: &ConnectionProfile,
        socks_port: u16,
    ) -> Result<(LaunchPlan, Option<NamedTempFile>)> {
        let config = self.build_config(profile, ConfigMode::Test { socks_port })?;
        let file = temp_document(&self.settings.probe_dir(), "xray-probe-", &config)?;
        let plan = self.plan(file.path());
        Ok((plan, Some(file)))
    }

    fn plan(&self, config_path: &Path) -> LaunchPlan {
        LaunchPlan {
            name: "xray",
            program: self.binary.clone(),
            args: vec!["run".into(), "-c".into(), config_path.into()],
            markers: self.markers.clone(),
        }
    }
}

fn outbound_settings(profile: &ConnectionProfile) -> Result<Value> {
    let settings = match profile.kind {
        ProfileType::Vmess => {
            let alter_id = config_field(&profile.config, "aid")
                .and_then(|aid| aid.parse::<u32>().ok())
                .unwrap_or(0);
            let security = config_field(&profile.config, "scy").unwrap_or_else(|| "auto".to_string());
            json!({
                "vnext": [{
                    "address": profile.server,
                    "port": profile.port,
                    "users": [{
                        "id": required(profile.uuid.as_deref(), "vmess uuid")?,
                        "alterId": alter_id,
                        "security": security,
                    }],
                }],
            })
        }
        ProfileType::Vless => {
            let mut user = json!({
                "id": required(profile.uuid.as_deref(), "vless uuid")?,
                "encryption": "none",
            });
            if let Some(flow) = profile.extra("flow") {
                user["flow"] = Value::String(flow.to_string());
            }
            json!({
                "vnext": [{
                    "address": profile.server,
                    "port": profile.port,
                    "users": [user],
                }],
            })
        }
        ProfileType::Trojan => json!({
            "servers": [{
                "address": profile.server,
                "port": profile.port,
                "password": required(profile.password.as_deref(), "trojan password")?,
            }],
        }),
        ProfileType::Shadowsocks | ProfileType::Hysteria2 => {
            return Err(EngineError::UnsupportedProfile(format!(
                "{} is not served by xray",
                profile.kind
            )))
        }
    };
    Ok(settings)
}

fn stream_settings(profile: &ConnectionProfile) -> StreamSettings {
    let network = profile.network.clone().unwrap_or_else(|| "tcp".to_string());
    let security = profile
        .security
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "none".to_string());

    let tls_settings = (security == "tls").then(|| TlsSettings {
        server_name: profile.server_name().to_string(),
        allow_insecure: false,
    });
    let ws_settings = (network == "ws").then(|| WsSettings {
        path: profile.path.clone().unwrap_or_else(|| "/".to_string()),
        headers: profile.host.as_ref().map(|host| json!({ "Host": host })),
    });
    let grpc_settings = (network == "grpc").then(|| GrpcSettings {
        service_name: profile.path.clone().unwrap_or_default(),
    });

    StreamSettings {
        network,
        security,
        tls_settings,
        ws_settings,
        grpc_settings,
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::Config(format!("profile has no {what}")))
}

/// String or number field of the raw link payload
fn config_field(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
