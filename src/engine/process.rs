//! Child process plumbing shared by the engines
//!
//! Every engine binary is spawned with piped output. Two background tasks
//! drain stdout and stderr line by line, log each line, and flip a readiness
//! flag the first time a line matches one of the engine's markers.

use crate::error::{EngineError, Result};
use regex::Regex;
use serde::Serialize;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// How to launch one engine binary
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub markers: Vec<Regex>,
}

/// Outcome of waiting for a process to become usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A readiness marker appeared on stdout or stderr
    Ready,
    /// Neither a marker nor an exit within the wait
    TimedOut,
    /// The process exited first (exit code if it had one)
    Exited(Option<i32>),
}

/// One running engine binary
#[derive(Debug)]
pub struct EngineProcess {
    name: &'static str,
    child: Child,
    pid: Option<u32>,
    ready: watch::Receiver<bool>,
}

impl EngineProcess {
    /// Spawn the binary described by `plan`
    pub fn spawn(plan: &LaunchPlan) -> Result<Self> {
        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Spawn(format!("{} ({}): {e}", plan.name, plan.program.display()))
            })?;

        let pid = child.id();
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_output(plan.name, stdout, plan.markers.clone(), ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_output(plan.name, stderr, plan.markers.clone(), ready_tx));
        }

        log::info!("Spawned {} (pid {})", plan.name, display_pid(pid));
        Ok(Self {
            name: plan.name,
            child,
            pid,
            ready: ready_rx,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pid at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for a readiness marker, an exit, or `timeout`, whichever comes first
    pub async fn wait_ready(&mut self, timeout: Duration) -> Readiness {
        let mut ready = self.ready.clone();
        let marker = async move {
            if ready.wait_for(|seen| *seen).await.is_err() {
                // Both output streams closed without a marker
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            _ = marker => Readiness::Ready,
            status = self.child.wait() => Readiness::Exited(status.ok().and_then(|s| s.code())),
            _ = tokio::time::sleep(timeout) => Readiness::TimedOut,
        }
    }

    /// Soft startup contract: a marker or an elapsed grace both count as started
    pub async fn await_startup(&mut self, grace: Duration) -> Result<()> {
        match self.wait_ready(grace).await {
            Readiness::Ready => {
                log::debug!("{} reported ready", self.name);
                Ok(())
            }
            Readiness::TimedOut => {
                log::debug!("{} gave no readiness marker within {:?}, assuming started", self.name, grace);
                Ok(())
            }
            Readiness::Exited(code) => Err(EngineError::ProcessExited(format!(
                "{} exited during startup (code {})",
                self.name,
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ))),
        }
    }

    /// Wait for the process to exit on its own
    pub async fn wait_exit(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    /// Graceful termination: SIGTERM, then a forced kill after `grace`
    ///
    /// Returns once the process has been reaped.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            log::debug!("{} already exited ({status})", self.name);
            return;
        }

        if !send_sigterm(self.child.id()) {
            self.kill().await;
            return;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => log::info!("{} (pid {}) stopped ({status})", self.name, display_pid(self.pid)),
            _ => {
                log::warn!("{} did not exit within {:?}, killing it", self.name, grace);
                self.kill().await;
            }
        }
    }

    /// Force-kill and reap
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            log::debug!("Kill of {} failed: {e}", self.name);
        }
    }
}

/// Ordered, non-empty group of processes forming one logical tunnel
#[derive(Debug)]
pub struct EngineProcessSet {
    processes: Vec<EngineProcess>,
}

impl EngineProcessSet {
    pub fn new(primary: EngineProcess) -> Self {
        Self {
            processes: vec![primary],
        }
    }

    pub fn push(&mut self, process: EngineProcess) {
        self.processes.push(process);
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(EngineProcess::pid).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processes.iter().map(EngineProcess::name).collect()
    }

    /// Terminate every member, used when a chain fails half-way
    pub async fn shutdown(mut self, grace: Duration) {
        futures::future::join_all(self.processes.iter_mut().map(|p| p.terminate(grace))).await;
    }

    pub fn into_processes(self) -> Vec<EngineProcess> {
        self.processes
    }
}

/// Write a live configuration document to a fixed path
pub fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(document)?)?;
    log::debug!("Wrote engine config {}", path.display());
    Ok(())
}

/// Write a probe configuration document to a uniquely named temp file
///
/// The file is removed when the returned handle is dropped or closed.
pub fn temp_document<T: Serialize>(dir: &Path, prefix: &str, document: &T) -> Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile_in(dir)?;
    file.write_all(&serde_json::to_vec(document)?)?;
    file.flush()?;
    Ok(file)
}

async fn scan_output<R>(name: &'static str, stream: R, markers: Vec<Regex>, ready: Arc<watch::Sender<bool>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                log::debug!("[{name}] {line}");
                if !*ready.borrow() && markers.iter().any(|m| m.is_match(line)) {
                    ready.send_replace(true);
                }
            }
            Err(e) => {
                log::debug!("[{name}] output closed: {e}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) -> bool {
    false
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "?".to_string(), |p| p.to_string())
}
