//! SOCKS to HTTP converter
//!
//! Hysteria and ss-local only expose SOCKS. The system proxy needs HTTP, so
//! a second xray instance listens on the live HTTP port and forwards to the
//! local SOCKS port.

use super::process::{write_document, EngineProcess, EngineProcessSet, LaunchPlan};
use super::xray::{Inbound, Outbound, XrayConfig, XrayLog};
use super::EngineSettings;
use crate::error::Result;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub struct ProtocolConverter {
    binary: PathBuf,
    markers: Vec<Regex>,
    settings: Arc<EngineSettings>,
}

impl ProtocolConverter {
    pub fn new(binary: PathBuf, markers: Vec<Regex>, settings: Arc<EngineSettings>) -> Self {
        Self {
            binary,
            markers,
            settings,
        }
    }

    /// HTTP inbound on the live HTTP port, SOCKS outbound to `socks_port`
    pub fn build_config(&self, socks_port: u16) -> XrayConfig {
        let listen = &self.settings.listen;
        XrayConfig {
            log: XrayLog::default(),
            inbounds: vec![Inbound::http(listen, self.settings.http_port)],
            outbounds: vec![Outbound {
                tag: None,
                protocol: "socks".to_string(),
                settings: json!({
                    "servers": [{ "address": listen, "port": socks_port }],
                }),
                stream_settings: None,
            }],
        }
    }

    /// Start the converter in front of a SOCKS listener on `socks_port`
    pub async fn start(&self, socks_port: u16) -> Result<EngineProcess> {
        let path = self.settings.data_dir.join("converter_config.json");
        write_document(&path, &self.build_config(socks_port))?;

        let plan = LaunchPlan {
            name: "converter",
            program: self.binary.clone(),
            args: vec!["run".into(), "-c".into(), path.into()],
            markers: self.markers.clone(),
        };
        let mut process = EngineProcess::spawn(&plan)?;
        process.await_startup(self.settings.converter_grace).await?;
        log::info!(
            "Converter up: http {}:{} -> socks {}:{}",
            self.settings.listen,
            self.settings.http_port,
            self.settings.listen,
            socks_port
        );
        Ok(process)
    }

    /// Put the converter in front of an already started SOCKS engine
    ///
    /// If the converter cannot start, the primary is terminated before the
    /// error is returned, so no half-built chain survives.
    pub async fn chain(&self, primary: EngineProcess) -> Result<EngineProcessSet> {
        let mut set = EngineProcessSet::new(primary);
        match self.start(self.settings.socks_port).await {
            Ok(converter) => {
                set.push(converter);
                Ok(set)
            }
            Err(e) => {
                log::error!("Converter failed to start, stopping {:?}: {}", set.names(), e);
                set.shutdown(self.settings.stop_timeout).await;
                Err(e)
            }
        }
    }
}
