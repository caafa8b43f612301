//! Live tunnel supervision
//!
//! At most one process set is live. Every member gets a watcher task that
//! owns its child. If any member exits on its own, the watcher schedules a
//! teardown of the whole set, so a half-alive chain never survives. Stop
//! requests and unexpected exits race on a shared flag, and whichever flips
//! it first does the teardown.

use crate::config::Config;
use crate::engine::{EngineProcess, EngineProcessSet, EngineRegistry};
use crate::error::Result;
use crate::probe::{LatencyProbe, ProbeEvent};
use crate::profile::ConnectionProfile;
use crate::system_proxy::{ProxyEndpoint, SystemProxy};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle of the live tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct Member {
    name: &'static str,
    pid: Option<u32>,
    stop: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

struct ActiveTunnel {
    id: u64,
    profile_name: String,
    members: Vec<Member>,
    tearing_down: Arc<AtomicBool>,
}

impl ActiveTunnel {
    async fn shutdown(self) {
        self.tearing_down.store(true, Ordering::SeqCst);
        let mut watchers = Vec::with_capacity(self.members.len());
        for member in self.members {
            log::debug!("Stopping {} (pid {:?})", member.name, member.pid);
            // An already finished watcher has dropped its receiver
            let _ = member.stop.send(());
            watchers.push(member.watcher);
        }
        for result in futures::future::join_all(watchers).await {
            if let Err(e) = result {
                log::warn!("Process watcher failed: {e}");
            }
        }
    }
}

struct Shared {
    active: Mutex<Option<ActiveTunnel>>,
    proxy: Arc<dyn SystemProxy>,
    endpoint: ProxyEndpoint,
    state: watch::Sender<EngineState>,
    stop_timeout: Duration,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Engine state {:?} -> {:?}", previous, state);
        }
    }

    /// Tear down the active set (if any) and clear the system proxy
    async fn stop_locked(&self, active: &mut Option<ActiveTunnel>) {
        if let Some(tunnel) = active.take() {
            self.set_state(EngineState::Disconnecting);
            log::info!("Stopping tunnel for '{}'", tunnel.profile_name);
            tunnel.shutdown().await;
        }
        self.clear_proxy().await;
        self.set_state(EngineState::Disconnected);
    }

    async fn set_proxy(&self) {
        let proxy = self.proxy.clone();
        let endpoint = self.endpoint.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || proxy.set_system_proxy(&endpoint)).await {
            log::warn!("Setting the system proxy panicked: {e}");
        }
    }

    async fn clear_proxy(&self) {
        let proxy = self.proxy.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || proxy.clear_system_proxy()).await {
            log::warn!("Clearing the system proxy panicked: {e}");
        }
    }

    /// Hand each process of `set` to its own watcher task
    fn supervise(self: &Arc<Self>, id: u64, profile_name: &str, set: EngineProcessSet) -> ActiveTunnel {
        let tearing_down = Arc::new(AtomicBool::new(false));
        let members = set
            .into_processes()
            .into_iter()
            .map(|process| {
                let (stop_tx, stop_rx) = oneshot::channel();
                let name = process.name();
                let pid = process.pid();
                let watcher = tokio::spawn(watch_process(
                    process,
                    stop_rx,
                    Arc::downgrade(self),
                    id,
                    tearing_down.clone(),
                    self.stop_timeout,
                ));
                Member {
                    name,
                    pid,
                    stop: stop_tx,
                    watcher,
                }
            })
            .collect();

        ActiveTunnel {
            id,
            profile_name: profile_name.to_string(),
            members,
            tearing_down,
        }
    }

    /// Teardown after an unexpected exit, unless the set was already replaced
    async fn cascade(self: Arc<Self>, tunnel_id: u64) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|t| t.id) != Some(tunnel_id) {
            log::debug!("Tunnel {tunnel_id} already gone, skipping cascade");
            return;
        }
        self.stop_locked(&mut active).await;
    }
}

async fn watch_process(
    mut process: EngineProcess,
    stop: oneshot::Receiver<()>,
    shared: Weak<Shared>,
    tunnel_id: u64,
    tearing_down: Arc<AtomicBool>,
    grace: Duration,
) {
    tokio::select! {
        code = process.wait_exit() => {
            if tearing_down.swap(true, Ordering::SeqCst) {
                log::debug!("{} exited during teardown", process.name());
                return;
            }
            log::warn!(
                "{} (pid {:?}) exited unexpectedly with code {:?}, stopping the tunnel",
                process.name(),
                process.pid(),
                code
            );
            if let Some(shared) = shared.upgrade() {
                tokio::spawn(shared.cascade(tunnel_id));
            }
        }
        _ = stop => {
            process.terminate(grace).await;
        }
    }
}

/// Owner of the live tunnel and entry point for latency probes
pub struct EngineManager {
    shared: Arc<Shared>,
    engines: Arc<EngineRegistry>,
    probe: LatencyProbe,
    next_id: AtomicU64,
}

impl EngineManager {
    /// Build engines from configuration
    pub fn new(config: &Config, proxy: Arc<dyn SystemProxy>) -> Result<Self> {
        config.validate()?;
        let engines = Arc::new(EngineRegistry::from_config(config)?);
        Ok(Self::with_registry(engines, proxy))
    }

    pub fn with_registry(engines: Arc<EngineRegistry>, proxy: Arc<dyn SystemProxy>) -> Self {
        let settings = engines.settings();
        let (state, _) = watch::channel(EngineState::Disconnected);
        let shared = Arc::new(Shared {
            active: Mutex::new(None),
            proxy,
            endpoint: ProxyEndpoint::new(settings.proxy_host.clone(), settings.http_port),
            state,
            stop_timeout: settings.stop_timeout,
        });
        Self {
            shared,
            probe: LatencyProbe::new(engines.clone()),
            engines,
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace whatever is live with a tunnel for `profile`
    ///
    /// The previous set is fully stopped first. The system proxy is only
    /// enabled once every process of the new set has started.
    pub async fn start_engine(&self, profile: &ConnectionProfile) -> Result<()> {
        let mut active = self.shared.active.lock().await;
        self.shared.stop_locked(&mut active).await;

        let engine = self.engines.select(profile)?;
        log::info!("Starting {} engine for '{}'", engine.kind(), profile.name);
        self.shared.set_state(EngineState::Connecting);

        let set = match engine.start(profile).await {
            Ok(set) => set,
            Err(e) => {
                log::error!("Failed to start '{}': {}", profile.name, e);
                self.shared.set_state(EngineState::Disconnected);
                return Err(e);
            }
        };
        log::info!("Tunnel for '{}' up: {:?} (pids {:?})", profile.name, set.names(), set.pids());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *active = Some(self.shared.supervise(id, &profile.name, set));
        self.shared.set_proxy().await;
        self.shared.set_state(EngineState::Connected);
        Ok(())
    }

    /// Stop the live tunnel, if any, and clear the system proxy
    ///
    /// Every process is reaped before this returns.
    pub async fn stop_engine(&self) {
        let mut active = self.shared.active.lock().await;
        self.shared.stop_locked(&mut active).await;
    }

    /// Latency of one profile through a throwaway instance
    pub async fn test_node_latency(&self, profile: &ConnectionProfile) -> i64 {
        self.probe.test(profile).await
    }

    /// Latency of a batch, see [`LatencyProbe::test_all`]
    pub async fn test_profiles(
        &self,
        profiles: Vec<ConnectionProfile>,
        events: Option<UnboundedSender<ProbeEvent>>,
    ) -> Vec<ConnectionProfile> {
        self.probe.test_all(profiles, events).await
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.active.lock().await.is_some()
    }

    /// Pids of the live set, primary first
    pub async fn active_pids(&self) -> Vec<u32> {
        self.shared
            .active
            .lock()
            .await
            .as_ref()
            .map(|t| t.members.iter().filter_map(|m| m.pid).collect())
            .unwrap_or_default()
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::profile::ProfileType;
    use crate::test_support::{is_alive, FakeBinaries, RecordingProxy};

    fn trojan(name: &str) -> ConnectionProfile {
        let mut profile = ConnectionProfile::new(ProfileType::Trojan, format!("{name}.example.com"), 443);
        profile.password = Some("pw".to_string());
        profile.name = name.to_string();
        profile
    }

    fn hysteria() -> ConnectionProfile {
        let mut profile = ConnectionProfile::new(ProfileType::Hysteria2, "hy.example.com", 443);
        profile.password = Some("pw".to_string());
        profile.name = "hy".to_string();
        profile
    }

    fn manager(bins: &FakeBinaries, proxy: &Arc<RecordingProxy>) -> EngineManager {
        manager_with(bins, proxy, |_| {})
    }

    fn manager_with(bins: &FakeBinaries, proxy: &Arc<RecordingProxy>, tweak: impl FnOnce(&mut Config)) -> EngineManager {
        let registry = bins.registry(tweak);
        EngineManager::with_registry(Arc::new(registry), proxy.clone())
    }

    async fn wait_for_state(manager: &EngineManager, state: EngineState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_stop_without_tunnel_still_clears_proxy() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        manager.stop_engine().await;
        assert_eq!(proxy.sets(), 0);
        assert_eq!(proxy.clears(), 1);
        assert_eq!(manager.state(), EngineState::Disconnected);
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_start_replaces_previous_set() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        manager.start_engine(&trojan("first")).await.unwrap();
        assert_eq!(manager.state(), EngineState::Connected);
        let first = manager.active_pids().await;
        assert_eq!(first.len(), 1);
        assert!(is_alive(first[0]));
        assert_eq!(proxy.sets(), 1);
        assert!(bins.data_dir().join("config.json").exists());

        manager.start_engine(&trojan("second")).await.unwrap();
        let second = manager.active_pids().await;
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        assert!(!is_alive(first[0]));
        assert!(is_alive(second[0]));
        assert_eq!(proxy.sets(), 2);
        assert_eq!(proxy.clears(), 2);

        manager.stop_engine().await;
        assert!(!is_alive(second[0]));
        assert!(!manager.is_running().await);
        assert_eq!(proxy.clears(), 3);
        assert_eq!(manager.state(), EngineState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_set() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        let (profile_a, profile_b) = (trojan("a"), trojan("b"));
        let (a, b) = tokio::join!(
            manager.start_engine(&profile_a),
            manager.start_engine(&profile_b)
        );
        a.unwrap();
        b.unwrap();

        let active = manager.active_pids().await;
        assert_eq!(active.len(), 1);
        assert!(is_alive(active[0]));
        let recorded = bins.pids("xray");
        assert_eq!(recorded.len(), 2);
        for pid in recorded.iter().filter(|pid| **pid != active[0]) {
            assert!(!is_alive(*pid), "pid {pid} outlived its replacement");
        }
        assert_eq!(proxy.sets(), 2);
        assert_eq!(proxy.clears(), 2);

        manager.stop_engine().await;
        assert!(!is_alive(active[0]));
        assert_eq!(proxy.sets(), proxy.clears() - 1);
        assert_eq!(manager.state(), EngineState::Disconnected);
    }

    #[tokio::test]
    async fn test_converter_chain_is_one_set() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        manager.start_engine(&hysteria()).await.unwrap();
        let pids = manager.active_pids().await;
        assert_eq!(pids.len(), 2);
        assert!(pids.iter().all(|pid| is_alive(*pid)));
        assert!(bins.data_dir().join("hysteria_config.json").exists());
        assert!(bins.data_dir().join("converter_config.json").exists());

        manager.stop_engine().await;
        assert!(pids.iter().all(|pid| !is_alive(*pid)));
    }

    #[tokio::test]
    async fn test_member_exit_tears_down_set_once() {
        let bins = FakeBinaries::new();
        bins.dies_after("hysteria", "client up", 1);
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        manager.start_engine(&hysteria()).await.unwrap();
        let pids = manager.active_pids().await;
        assert_eq!(pids.len(), 2);
        let converter = pids[1];

        wait_for_state(&manager, EngineState::Disconnected).await;
        assert!(!manager.is_running().await);
        assert!(!is_alive(converter));
        assert_eq!(proxy.sets(), 1);
        // one clear from the initial stop, one from the cascade
        assert_eq!(proxy.clears(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(proxy.clears(), 2);
    }

    #[tokio::test]
    async fn test_missing_engine_is_unsupported() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager_with(&bins, &proxy, |config| config.binaries.hysteria = None);

        let result = manager.start_engine(&hysteria()).await;
        assert!(matches!(result, Err(EngineError::UnsupportedProfile(_))));
        assert_eq!(proxy.sets(), 0);
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_running() {
        let bins = FakeBinaries::new();
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager_with(&bins, &proxy, |config| {
            config.binaries.xray = Some("/nonexistent/xray".into());
        });

        let result = manager.start_engine(&trojan("x")).await;
        assert!(matches!(result, Err(EngineError::Spawn(_))));
        assert!(!manager.is_running().await);
        assert_eq!(manager.state(), EngineState::Disconnected);
        assert_eq!(proxy.sets(), 0);
    }

    #[tokio::test]
    async fn test_crash_during_startup_is_reported() {
        let bins = FakeBinaries::new();
        bins.crashing("xray");
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        let result = manager.start_engine(&trojan("x")).await;
        assert!(matches!(result, Err(EngineError::ProcessExited(_))));
        assert!(!manager.is_running().await);
        assert_eq!(proxy.sets(), 0);
    }

    #[tokio::test]
    async fn test_converter_failure_stops_primary() {
        let bins = FakeBinaries::new();
        bins.crashing("xray");
        let proxy = Arc::new(RecordingProxy::default());
        let manager = manager(&bins, &proxy);

        let result = manager.start_engine(&hysteria()).await;
        assert!(matches!(result, Err(EngineError::ProcessExited(_))));
        for pid in bins.pids("hysteria") {
            assert!(!is_alive(pid));
        }
        assert!(!manager.is_running().await);
    }
}
