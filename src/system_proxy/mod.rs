//! OS-level HTTP proxy toggling
//!
//! Each platform module builds the list of commands that point the desktop
//! proxy settings at the local HTTP inbound (or switch them off). Building
//! is pure; running happens here. Failures are logged and never surface to
//! the caller.

use crate::config::SystemProxyConfig;
use crate::error::{EngineError, Result};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

pub mod linux;
pub mod macos;
pub mod windows;

/// Where the OS proxy should point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Toggle for the OS HTTP proxy
///
/// Implementations are best-effort and absorb their own failures.
pub trait SystemProxy: Send + Sync {
    fn set_system_proxy(&self, endpoint: &ProxyEndpoint);
    fn clear_system_proxy(&self);
}

/// A single external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsCommand {
    pub program: String,
    /// Tried in place of `program` when that is not installed
    pub fallback: Option<String>,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl OsCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            fallback: None,
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_fallback(mut self, program: &str) -> Self {
        self.fallback = Some(program.to_string());
        self
    }

    /// Run to completion and return stdout
    pub fn run(&self) -> Result<String> {
        let child = match (self.spawn(&self.program), &self.fallback) {
            (Err(e), Some(fallback)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[SystemProxy] {} not found, trying {}", self.program, fallback);
                self.spawn(fallback).map(|child| (fallback, child))
            }
            (spawned, _) => spawned.map(|child| (&self.program, child)),
        };
        let (program, mut child) = child.map_err(|e| EngineError::Platform(format!("{}: {e}", self.program)))?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(EngineError::Platform(format!(
                "{} failed ({}): {}",
                self,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        log::debug!("[SystemProxy] Ran {} via {}", self, program);
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, program: &str) -> std::io::Result<Child> {
        let mut command = Command::new(program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        command.spawn()
    }
}

impl std::fmt::Display for OsCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Run commands in order, logging failures and carrying on
pub fn run_all(commands: &[OsCommand]) {
    for command in commands {
        if let Err(e) = command.run() {
            log::warn!("[SystemProxy] {e}");
        }
    }
}

/// Proxy toggling through the host's native configuration tools
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSystemProxy;

impl SystemProxy for OsSystemProxy {
    fn set_system_proxy(&self, endpoint: &ProxyEndpoint) {
        log::info!("[SystemProxy] Setting system proxy to {}:{}", endpoint.host, endpoint.port);
        #[cfg(target_os = "windows")]
        run_all(&windows::enable_commands(endpoint));
        #[cfg(target_os = "macos")]
        match macos::active_network_service() {
            Some(service) => run_all(&macos::enable_commands(&service, endpoint)),
            None => log::warn!("[SystemProxy] Could not find the active network service"),
        }
        #[cfg(target_os = "linux")]
        run_all(&linux::enable_commands(linux::Desktop::detect(), endpoint));
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        log::warn!("[SystemProxy] Platform {} is not supported", std::env::consts::OS);
    }

    fn clear_system_proxy(&self) {
        log::info!("[SystemProxy] Clearing system proxy");
        #[cfg(target_os = "windows")]
        run_all(&windows::disable_commands());
        #[cfg(target_os = "macos")]
        match macos::active_network_service() {
            Some(service) => run_all(&macos::disable_commands(&service)),
            None => log::warn!("[SystemProxy] Could not find the active network service"),
        }
        #[cfg(target_os = "linux")]
        run_all(&linux::disable_commands(linux::Desktop::detect()));
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        log::warn!("[SystemProxy] Platform {} is not supported", std::env::consts::OS);
    }
}

/// Leaves the OS settings alone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn set_system_proxy(&self, endpoint: &ProxyEndpoint) {
        log::debug!("[SystemProxy] Disabled, not pointing at {}:{}", endpoint.host, endpoint.port);
    }

    fn clear_system_proxy(&self) {
        log::debug!("[SystemProxy] Disabled, nothing to clear");
    }
}

/// System proxy implementation selected by configuration
pub fn from_config(config: &SystemProxyConfig) -> Arc<dyn SystemProxy> {
    if config.enabled {
        Arc::new(OsSystemProxy)
    } else {
        Arc::new(NoopSystemProxy)
    }
}
