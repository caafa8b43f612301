//! Fakes for exercising engines without the real binaries

use crate::config::Config;
use crate::engine::EngineRegistry;
use crate::system_proxy::{ProxyEndpoint, SystemProxy};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Shell scripts standing in for xray, hysteria and ss-local
///
/// Each script appends its pid to `<name>.pids` before doing anything else.
/// By default every binary prints its readiness marker and stays up.
pub struct FakeBinaries {
    dir: TempDir,
}

impl FakeBinaries {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let bins = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(bins.data_dir()).unwrap();
        bins.ready("xray", "Xray 1.8.4 started");
        bins.ready("hysteria", "client up");
        bins.ready("ss-local", "listening at 127.0.0.1");
        bins
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Configuration pointing every engine at the fakes
    pub fn config(&self, tweak: impl FnOnce(&mut Config)) -> Config {
        let mut config = Config::default();
        config.data_dir = Some(self.data_dir());
        config.binaries.xray = Some(self.path("xray"));
        config.binaries.hysteria = Some(self.path("hysteria"));
        config.binaries.shadowsocks = Some(self.path("ss-local"));
        config.startup.ready_grace_ms = 1000;
        config.startup.converter_grace_ms = 1000;
        config.startup.stop_timeout_ms = 2000;
        config.probe.ready_timeout_ms = 3000;
        config.probe.request_timeout_ms = 3000;
        tweak(&mut config);
        config
    }

    pub fn registry(&self, tweak: impl FnOnce(&mut Config)) -> EngineRegistry {
        EngineRegistry::from_config(&self.config(tweak)).unwrap()
    }

    /// Prints `marker`, then stays up
    pub fn ready(&self, name: &str, marker: &str) {
        self.script(name, &format!("echo '{marker}'\nexec sleep 30\n"));
    }

    /// Never prints anything
    pub fn silent(&self, name: &str) {
        self.script(name, "exec sleep 30\n");
    }

    /// Exits with an error straight away
    pub fn crashing(&self, name: &str) {
        self.script(name, "echo 'fatal: bad config' >&2\nexit 3\n");
    }

    /// Prints `marker`, then exits after `secs`
    pub fn dies_after(&self, name: &str, marker: &str, secs: u32) {
        self.script(name, &format!("echo '{marker}'\nsleep {secs}\nexit 1\n"));
    }

    /// Pids recorded by every run of `name`
    pub fn pids(&self, name: &str) -> Vec<u32> {
        std::fs::read_to_string(self.pid_file(name))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    fn pid_file(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.pids"))
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.path(name);
        let text = format!("#!/bin/sh\necho $$ >> '{}'\n{body}", self.pid_file(name).display());
        write_executable(&path, &text);
    }
}

fn write_executable(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Whether a process with `pid` exists
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Counts system proxy toggles
#[derive(Debug, Default)]
pub struct RecordingProxy {
    sets: AtomicUsize,
    clears: AtomicUsize,
}

impl RecordingProxy {
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl SystemProxy for RecordingProxy {
    fn set_system_proxy(&self, _endpoint: &ProxyEndpoint) {
        self.sets.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_system_proxy(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Minimal SOCKS5 server that answers every HTTP request with 204
pub async fn spawn_socks_responder() -> (u16, JoinHandle<()>) {
    spawn_delayed_socks_responder(Duration::ZERO).await
}

/// Like [`spawn_socks_responder`], holding each response back for `delay`
pub async fn spawn_delayed_socks_responder(delay: Duration) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = serve_socks(&mut stream, delay).await;
            });
        }
    });
    (port, handle)
}

async fn serve_socks(stream: &mut TcpStream, delay: Duration) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let address_len = match request[3] {
        1 => 4,
        4 => 16,
        _ => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
    };
    let mut rest = vec![0u8; address_len + 2];
    stream.read_exact(&mut rest).await?;
    stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    tokio::time::sleep(delay).await;
    stream
        .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    stream.shutdown().await
}
