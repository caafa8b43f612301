//! Shadow-cipher engine driven by `ss-local` command-line flags

use super::process::{EngineProcess, EngineProcessSet, LaunchPlan};
use super::{ConfigMode, EngineSettings, ProtocolConverter};
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProfileType};
use regex::Regex;
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Flags passed to `ss-local`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SsLocalArgs {
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub method: String,
    pub local_address: String,
    pub local_port: u16,
}

impl SsLocalArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        [
            "-s".to_string(),
            self.server.clone(),
            "-p".to_string(),
            self.server_port.to_string(),
            "-k".to_string(),
            self.password.clone(),
            "-m".to_string(),
            self.method.clone(),
            "-b".to_string(),
            self.local_address.clone(),
            "-l".to_string(),
            self.local_port.to_string(),
            // verbose output carries the readiness line
            "-v".to_string(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }
}

#[derive(Debug)]
pub struct ShadowsocksEngine {
    binary: PathBuf,
    markers: Vec<Regex>,
    settings: Arc<EngineSettings>,
    converter: Option<Arc<ProtocolConverter>>,
}

impl ShadowsocksEngine {
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

    pub fn build_config(&self, profile: &ConnectionProfile, mode: ConfigMode) -> Result<SsLocalArgs> {
        if profile.kind != ProfileType::Shadowsocks {
            return Err(EngineError::UnsupportedProfile(format!(
                "{} is not served by shadowsocks",
                profile.kind
            )));
        }
        let method = profile
            .method
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| EngineError::Config("shadowsocks profile has no cipher method".to_string()))?;

        Ok(SsLocalArgs {
            server: profile.server.clone(),
            server_port: profile.port,
            password: profile.password.clone().unwrap_or_default(),
            method,
            local_address: self.settings.listen.clone(),
            local_port: match mode {
                ConfigMode::Live => self.settings.socks_port,
                ConfigMode::Test { socks_port } => socks_port,
            },
        })
    }

    pub async fn start(&self, profile: &ConnectionProfile) -> Result<EngineProcessSet> {
        let converter = self.converter.as_ref().ok_or_else(|| {
            EngineError::UnsupportedProfile("shadowsocks needs the xray converter, which is not configured".to_string())
        })?;

        let args = self.build_config(profile, ConfigMode::Live)?;
        let mut process = EngineProcess::spawn(&self.plan(&args))?;
        process.await_startup(self.settings.ready_grace).await?;
        converter.chain(process).await
    }

    pub(crate) fn test_plan(
        &self,
        profile: &ConnectionProfile,
        socks_port: u16,
    ) -> Result<(LaunchPlan, Option<NamedTempFile>)> {
        let args = self.build_config(profile, ConfigMode::Test { socks_port })?;
        Ok((self.plan(&args), None))
    }

    fn plan(&self, args: &SsLocalArgs) -> LaunchPlan {
        LaunchPlan {
            name: "ss-local",
            program: self.binary.clone(),
            args: args.to_args(),
            markers: self.markers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::subscription::parse_link;

    fn engine() -> ShadowsocksEngine {
        let settings = Arc::new(EngineSettings::from_config(&Config::default()));
        ShadowsocksEngine::new(PathBuf::from("ss-local"), vec![], settings, None)
    }

    #[test]
    fn test_args_follow_profile() {
        let profile = parse_link("ss://YWVzLTI1Ni1nY206cHc@ss.example.com:8388#ss").unwrap();
        let args = engine().build_config(&profile, ConfigMode::Test { socks_port: 43000 }).unwrap();
        let argv: Vec<String> = args
            .to_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            argv,
            [
                "-s", "ss.example.com", "-p", "8388", "-k", "pw", "-m", "aes-256-gcm", "-b", "127.0.0.1", "-l",
                "43000", "-v"
            ]
        );

        let live = engine().build_config(&profile, ConfigMode::Live).unwrap();
        assert_eq!(live.local_port, 10808);
    }

    #[test]
    fn test_missing_method_is_config_error() {
        let mut profile = ConnectionProfile::new(ProfileType::Shadowsocks, "ss.example.com", 8388);
        profile.password = Some("pw".to_string());
        assert!(matches!(
            engine().build_config(&profile, ConfigMode::Live),
            Err(EngineError::Config(_))
        ));
    }
}
