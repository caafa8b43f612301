//! Connection profile and subscription types
//!
//! A profile is the normalized, parse-time description of one remote
//! endpoint. Only `ping` and `status` change after parsing, and only the
//! latency probe writes them.

use ring::digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel latency meaning "probe failed or timed out"
pub const PROBE_FAILED: i64 = -1;

/// Closed set of protocols a profile can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria2,
}

impl ProfileType {
    /// Protocol name as written into engine outbounds
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Vmess => "vmess",
            ProfileType::Vless => "vless",
            ProfileType::Trojan => "trojan",
            ProfileType::Shadowsocks => "shadowsocks",
            ProfileType::Hysteria2 => "hysteria2",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Latency test progress of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Testing,
    Tested,
}

/// One remote proxy endpoint decoded from a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub subscription_name: String,
    #[serde(rename = "type")]
    pub kind: ProfileType,
    pub server: String,
    pub port: u16,

    /// Identity token (vmess/vless)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Shared secret (trojan/hysteria2/shadowsocks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Cipher method (shadowsocks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Raw link payload for protocol-specific extensions
    #[serde(default)]
    pub config: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProbeStatus>,
}

impl ConnectionProfile {
    /// Create a profile with only the routing fields set
    ///
    /// The id is derived from `server`, `port` and the identity credential,
    /// so it is recomputed by [`ConnectionProfile::refresh_id`] once the
    /// credentials are filled in.
    pub fn new(kind: ProfileType, server: impl Into<String>, port: u16) -> Self {
        let server = server.into();
        let mut profile = Self {
            id: String::new(),
            name: format!("{server}:{port}"),
            subscription_name: String::new(),
            kind,
            server,
            port,
            uuid: None,
            password: None,
            method: None,
            network: None,
            security: None,
            sni: None,
            path: None,
            host: None,
            config: serde_json::Value::Null,
            ping: None,
            status: None,
        };
        profile.refresh_id();
        profile
    }

    /// Identity credential used for the id: uuid for vmess/vless, secret otherwise
    pub fn identity(&self) -> &str {
        self.uuid
            .as_deref()
            .or(self.password.as_deref())
            .unwrap_or_default()
    }

    /// Recompute the deterministic id
    pub fn refresh_id(&mut self) {
        self.id = profile_id(&self.server, self.port, self.identity());
    }

    /// SNI to present, falling back to the server address
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.server)
    }

    /// Look up a string field in the raw payload
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }
}

/// Deterministic profile id: truncated SHA-256 over server, port and identity
pub fn profile_id(server: &str, port: u16, identity: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(server.as_bytes());
    ctx.update(b"\n");
    ctx.update(port.to_string().as_bytes());
    ctx.update(b"\n");
    ctx.update(identity.as_bytes());
    hex::encode(&ctx.finish().as_ref()[..8])
}

/// A remote list of profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl Subscription {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
        }
    }
}
