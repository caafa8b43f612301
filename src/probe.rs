//! Latency probing of single profiles and batches
//!
//! Every probe runs its own throwaway engine instance. With port isolation
//! on, each in-flight probe leases a distinct free local port, so probes of
//! the same family can run side by side. With it off, the fixed per-family
//! test port is used and probes of one family are serialised.

use crate::engine::{EngineKind, EngineRegistry};
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProbeStatus, PROBE_FAILED};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

const LEASE_ATTEMPTS: usize = 32;

/// Progress of one profile inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Position of the profile in the submitted batch
    pub index: usize,
    pub id: String,
    pub status: ProbeStatus,
    pub ping: Option<i64>,
}

/// Hands out free local ports for probe instances
#[derive(Debug, Clone)]
pub struct PortAllocator {
    reserved: Vec<u16>,
    in_flight: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// `reserved` ports are never leased (the live inbounds)
    pub fn new(reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            reserved: reserved.into_iter().collect(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Lease a port no other in-flight probe holds
    pub fn lease(&self) -> Result<PortLease> {
        for _ in 0..LEASE_ATTEMPTS {
            let port = {
                let listener = TcpListener::bind(("127.0.0.1", 0))?;
                listener.local_addr()?.port()
            };
            if self.reserved.contains(&port) {
                continue;
            }
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.insert(port) {
                return Ok(PortLease {
                    port,
                    in_flight: self.in_flight.clone(),
                });
            }
        }
        Err(EngineError::InvalidState("no free local port for a probe instance".to_string()))
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }
}

/// A leased probe port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    in_flight: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.port);
    }
}

/// Runs latency probes against the registered engines
#[derive(Debug)]
pub struct LatencyProbe {
    engines: Arc<EngineRegistry>,
    ports: PortAllocator,
    fixed_port_locks: HashMap<EngineKind, tokio::sync::Mutex<()>>,
}

impl LatencyProbe {
    pub fn new(engines: Arc<EngineRegistry>) -> Self {
        let settings = engines.settings();
        let ports = PortAllocator::new([settings.socks_port, settings.http_port]);
        let fixed_port_locks = [EngineKind::Xray, EngineKind::Hysteria, EngineKind::Shadowsocks]
            .into_iter()
            .map(|kind| (kind, tokio::sync::Mutex::new(())))
            .collect();
        Self {
            engines,
            ports,
            fixed_port_locks,
        }
    }

    /// Latency of one profile in milliseconds, or [`PROBE_FAILED`]
    pub async fn test(&self, profile: &ConnectionProfile) -> i64 {
        let engine = match self.engines.select(profile) {
            Ok(engine) => engine,
            Err(e) => {
                log::warn!("Cannot probe '{}': {}", profile.name, e);
                return PROBE_FAILED;
            }
        };
        let probe = &self.engines.settings().probe;

        if probe.isolate_ports {
            let lease = match self.ports.lease() {
                Ok(lease) => lease,
                Err(e) => {
                    log::warn!("Cannot probe '{}': {}", profile.name, e);
                    return PROBE_FAILED;
                }
            };
            engine.test(profile, lease.port()).await
        } else {
            let kind = engine.kind();
            let _guard = match self.fixed_port_locks.get(&kind) {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            engine.test(profile, probe.fixed_port(kind)).await
        }
    }

    /// Probe a batch with a bounded worker pool
    ///
    /// Results come back in input order with `ping` and `status` filled.
    /// When `events` is given, a `Testing` event is published as each
    /// profile starts and a `Tested` event when it finishes.
    pub async fn test_all(
        &self,
        profiles: Vec<ConnectionProfile>,
        events: Option<UnboundedSender<ProbeEvent>>,
    ) -> Vec<ConnectionProfile> {
        let total = profiles.len();
        let workers = self.engines.settings().probe.concurrency.clamp(1, total.max(1));
        log::info!("Probing {} profiles with {} workers", total, workers);

        let queue = Mutex::new(profiles.into_iter().enumerate().collect::<VecDeque<_>>());
        let results = Mutex::new((0..total).map(|_| None).collect::<Vec<Option<ConnectionProfile>>>());

        futures::future::join_all((0..workers).map(|_| self.worker(&queue, &results, events.as_ref()))).await;

        results
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    async fn worker(
        &self,
        queue: &Mutex<VecDeque<(usize, ConnectionProfile)>>,
        results: &Mutex<Vec<Option<ConnectionProfile>>>,
        events: Option<&UnboundedSender<ProbeEvent>>,
    ) {
        loop {
            let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some((index, mut profile)) = next else {
                break;
            };

            profile.status = Some(ProbeStatus::Testing);
            profile.ping = None;
            publish(events, index, &profile);

            let ping = self.test(&profile).await;
            profile.ping = Some(ping);
            profile.status = Some(ProbeStatus::Tested);
            publish(events, index, &profile);

            let mut results = results.lock().unwrap_or_else(|e| e.into_inner());
            results[index] = Some(profile);
        }
    }
}

fn publish(events: Option<&UnboundedSender<ProbeEvent>>, index: usize, profile: &ConnectionProfile) {
    let Some(events) = events else {
        return;
    };
    let Some(status) = profile.status else {
        return;
    };
    // A dropped receiver only means nobody is watching
    let _ = events.send(ProbeEvent {
        index,
        id: profile.id.clone(),
        status,
        ping: profile.ping,
    });
}
