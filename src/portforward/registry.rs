use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::worker::ForwardWorker;
use super::{ForwardError, PortForwardInfo, PortForwardKey};
use crate::cluster::ClusterSessions;
use crate::config::PortForwardConfig;
use crate::lifecycle::{self, StartOutcome};
use crate::session::SessionState;

/// Tunables for [`PortForwardRegistry`].
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub listen_address: IpAddr,
    pub ready_timeout: Duration,
    pub max_sessions: Option<usize>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: Duration::from_secs(10),
            max_sessions: None,
        }
    }
}

impl From<&PortForwardConfig> for ForwardOptions {
    fn from(config: &PortForwardConfig) -> Self {
        Self {
            listen_address: config.listen_address,
            ready_timeout: config.ready_timeout(),
            max_sessions: config.max_sessions,
        }
    }
}

struct ForwardEntry {
    state: SessionState,
    /// Distinguishes this registration from any later one with the same key.
    generation: u64,
    terminate: CancellationToken,
}

struct RegistryInner {
    sessions: HashMap<PortForwardKey, ForwardEntry>,
    next_generation: u64,
}

/// Owns every running port-forward session, keyed by its coordinates.
///
/// At most one live session exists per key. A session is visible here from
/// the moment `start` reserves it until its worker has fully cleaned up or
/// `stop` removes it, whichever comes first.
#[derive(Clone)]
pub struct PortForwardRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    cluster: Arc<dyn ClusterSessions>,
    options: ForwardOptions,
}

impl PortForwardRegistry {
    pub fn new(cluster: Arc<dyn ClusterSessions>, options: ForwardOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_generation: 0,
            })),
            cluster,
            options,
        }
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Start forwarding `local_port` to `remote_port` in the pod.
    ///
    /// A `local_port` of 0 reuses `remote_port`. Returns once the session is
    /// usable, or with an error once establishment failed or the ready
    /// timeout elapsed. On error nothing stays registered.
    pub async fn start(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<PortForwardInfo, ForwardError> {
        let key = PortForwardKey::new(namespace, pod, local_port, remote_port)?;
        let (generation, terminate, active) = self.reserve(&key)?;
        tracing::info!(session = %key, active, "starting port-forward session");

        let (signal, waiter) = lifecycle::readiness();
        let worker = ForwardWorker {
            registry: self.clone(),
            cluster: self.cluster.clone(),
            key: key.clone(),
            generation,
            terminate: terminate.clone(),
            listen_addr: SocketAddr::new(self.options.listen_address, key.local_port),
            ready_timeout: self.options.ready_timeout,
        };
        tokio::spawn(worker.run(signal));

        match waiter.wait(self.options.ready_timeout).await {
            StartOutcome::Ready => Ok(PortForwardInfo::new(&key, SessionState::Active)),
            StartOutcome::Failed(err) => {
                self.deregister(&key, generation);
                Err(err)
            }
            // Workers always report; only a panic gets here.
            StartOutcome::Abandoned => {
                self.deregister(&key, generation);
                Err(ForwardError::Abandoned(key.to_string()))
            }
            StartOutcome::TimedOut => {
                terminate.cancel();
                self.deregister(&key, generation);
                tracing::warn!(
                    session = %key,
                    timeout = ?self.options.ready_timeout,
                    "port-forward session did not become ready"
                );
                Err(ForwardError::Timeout {
                    id: key.to_string(),
                    timeout: self.options.ready_timeout,
                })
            }
        }
    }

    /// Stop a session and remove it from the registry.
    ///
    /// The record is gone when this returns; the worker releases the local
    /// port shortly after.
    pub fn stop(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<PortForwardInfo, ForwardError> {
        let key = PortForwardKey::new(namespace, pod, local_port, remote_port)?;
        let entry = self
            .inner
            .write()
            .sessions
            .remove(&key)
            .ok_or_else(|| ForwardError::NotFound(key.to_string()))?;
        entry.terminate.cancel();
        tracing::info!(session = %key, "port-forward session stopped");
        Ok(PortForwardInfo::new(&key, SessionState::Stopping))
    }

    /// Snapshot of every registered session, ordered by id.
    pub fn list(&self) -> Vec<PortForwardInfo> {
        self.snapshot(|_| true)
    }

    /// Snapshot of the sessions targeting one pod, ordered by id.
    pub fn list_for_pod(&self, namespace: &str, pod: &str) -> Vec<PortForwardInfo> {
        self.snapshot(|key| key.pod.namespace == namespace && key.pod.pod == pod)
    }

    /// Stop everything. Used on server shutdown.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(PortForwardKey, ForwardEntry)> =
            self.inner.write().sessions.drain().collect();
        for (key, entry) in &drained {
            entry.terminate.cancel();
            tracing::debug!(session = %key, "port-forward session stopped on shutdown");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current lifecycle state of a registered session.
    pub fn state(&self, key: &PortForwardKey) -> Option<SessionState> {
        self.inner.read().sessions.get(key).map(|entry| entry.state)
    }

    fn snapshot(&self, filter: impl Fn(&PortForwardKey) -> bool) -> Vec<PortForwardInfo> {
        let mut infos: Vec<PortForwardInfo> = self
            .inner
            .read()
            .sessions
            .iter()
            .filter(|(key, _)| filter(key))
            .map(|(key, entry)| PortForwardInfo::new(key, entry.state))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Check-and-insert a `Starting` placeholder under one write lock.
    ///
    /// A session that is already `Stopping` no longer holds its identity and
    /// is replaced; its worker's cleanup is a no-op thanks to the generation
    /// check in [`deregister`](Self::deregister).
    fn reserve(
        &self,
        key: &PortForwardKey,
    ) -> Result<(u64, CancellationToken, usize), ForwardError> {
        let mut inner = self.inner.write();

        let live = |entry: &ForwardEntry| entry.state.is_live();
        if inner.sessions.get(key).is_some_and(live) {
            return Err(ForwardError::Duplicate(key.to_string()));
        }
        if let Some(max) = self.options.max_sessions {
            let occupied = inner.sessions.values().filter(|e| live(e)).count();
            if occupied >= max {
                return Err(ForwardError::LimitReached(max));
            }
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let terminate = CancellationToken::new();
        let replaced = inner.sessions.insert(
            key.clone(),
            ForwardEntry {
                state: SessionState::Starting,
                generation,
                terminate: terminate.clone(),
            },
        );
        if let Some(stale) = replaced {
            stale.terminate.cancel();
        }
        Ok((generation, terminate, inner.sessions.len()))
    }

    /// Update the state of the registration identified by `generation`.
    pub(super) fn set_state(&self, key: &PortForwardKey, generation: u64, state: SessionState) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    /// Remove the registration identified by `generation`, if it is still
    /// the one stored under `key`.
    pub(super) fn deregister(&self, key: &PortForwardKey, generation: u64) -> bool {
        let mut inner = self.inner.write();
        let current = inner
            .sessions
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if current {
            if let Some(entry) = inner.sessions.remove(key) {
                entry.terminate.cancel();
            }
        }
        current
    }
}
