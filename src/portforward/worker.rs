use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::registry::PortForwardRegistry;
use super::{ForwardError, PortForwardKey};
use crate::cluster::{ClusterError, ClusterSessions, ForwardStream};
use crate::lifecycle::{ExitGuard, ReadySignal};
use crate::session::{PodRef, SessionState};

/// A port just released by a previous session can linger briefly.
const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Extra time past the ready timeout before a worker gives up on its own.
const STARTUP_BACKSTOP: Duration = Duration::from_secs(1);

/// Background task that owns one port-forward session.
pub(super) struct ForwardWorker {
    pub(super) registry: PortForwardRegistry,
    pub(super) cluster: Arc<dyn ClusterSessions>,
    pub(super) key: PortForwardKey,
    pub(super) generation: u64,
    pub(super) terminate: CancellationToken,
    pub(super) listen_addr: SocketAddr,
    pub(super) ready_timeout: Duration,
}

impl ForwardWorker {
    pub(super) async fn run(self, signal: ReadySignal<ForwardError>) {
        let _registration = {
            let registry = self.registry.clone();
            let key = self.key.clone();
            let generation = self.generation;
            ExitGuard::new(move || {
                if registry.deregister(&key, generation) {
                    tracing::debug!(session = %key, "port-forward session deregistered");
                }
            })
        };

        let established = tokio::select! {
            result = self.establish() => result,
            _ = self.terminate.cancelled() => {
                tracing::debug!(session = %self.key, "port-forward cancelled during startup");
                signal.fail(ForwardError::Stopped(self.key.to_string()));
                return;
            }
            // Only reached if the waiting caller is gone; it gives up first.
            _ = tokio::time::sleep(self.ready_timeout + STARTUP_BACKSTOP) => {
                signal.fail(ForwardError::Timeout {
                    id: self.key.to_string(),
                    timeout: self.ready_timeout,
                });
                return;
            }
        };

        let (listener, first_stream) = match established {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(session = %self.key, error = %err, "port-forward failed to start");
                signal.fail(err);
                return;
            }
        };

        if self.terminate.is_cancelled()
            || !self
                .registry
                .set_state(&self.key, self.generation, SessionState::Active)
        {
            tracing::debug!(session = %self.key, "port-forward stopped before it became ready");
            signal.fail(ForwardError::Stopped(self.key.to_string()));
            return;
        }
        if !signal.ready() {
            tracing::debug!(session = %self.key, "start request gone before session was ready");
            return;
        }
        tracing::info!(
            session = %self.key,
            listen = %self.listen_addr,
            "port-forward session active"
        );

        let reason = self.pump(listener, first_stream).await;
        self.registry
            .set_state(&self.key, self.generation, SessionState::Stopping);
        tracing::info!(session = %self.key, reason, "port-forward session ended");
    }

    /// Bind the local port and open the first upstream stream.
    async fn establish(&self) -> Result<(TcpListener, ForwardStream), ForwardError> {
        let listener = bind_with_retry(self.listen_addr).await?;
        let stream = self
            .cluster
            .open_port_forward(&self.key.pod, self.key.remote_port)
            .await?;
        Ok((listener, stream))
    }

    /// Accept local connections until stopped or the upstream becomes unusable.
    ///
    /// Dropping the `JoinSet` on return aborts every in-flight connection.
    async fn pump(&self, listener: TcpListener, first_stream: ForwardStream) -> &'static str {
        let mut warm = Some(first_stream);
        let mut connections: JoinSet<Result<(), ClusterError>> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.terminate.cancelled() => return "stopped",
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!(session = %self.key, %peer, "accepted local connection");
                        connections.spawn(forward_connection(
                            self.cluster.clone(),
                            self.key.pod.clone(),
                            self.key.remote_port,
                            warm.take(),
                            socket,
                        ));
                    }
                    Err(e) if is_connection_error(&e) => {
                        tracing::debug!(session = %self.key, error = %e, "local connection dropped before accept");
                    }
                    Err(e) => {
                        // Typically out of file descriptors; the listener itself is fine.
                        tracing::warn!(session = %self.key, error = %e, "accept failed, backing off");
                        tokio::select! {
                            _ = self.terminate.cancelled() => return "stopped",
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
                Some(joined) = connections.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(session = %self.key, error = %e, "remote port unreachable");
                        return "remote closed";
                    }
                    Err(e) if e.is_panic() => {
                        tracing::error!(session = %self.key, error = %e, "connection task panicked");
                    }
                    Err(_) => {}
                },
            }
        }
    }
}

/// Splice one accepted local connection onto an upstream stream.
///
/// Only failing to open the upstream is an error; a connection that ends,
/// cleanly or not, is just one client going away.
async fn forward_connection(
    cluster: Arc<dyn ClusterSessions>,
    pod: PodRef,
    remote_port: u16,
    upstream: Option<ForwardStream>,
    mut socket: TcpStream,
) -> Result<(), ClusterError> {
    let mut upstream = match upstream {
        Some(stream) => stream,
        None => cluster.open_port_forward(&pod, remote_port).await?,
    };
    match tokio::io::copy_bidirectional(&mut socket, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(%pod, remote_port, sent, received, "forwarded connection closed")
        }
        Err(e) => tracing::debug!(%pod, remote_port, error = %e, "forwarded connection error"),
    }
    Ok(())
}

/// Accept errors that concern one incoming connection rather than the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ForwardError> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                tracing::debug!(%addr, attempt, "local port busy, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(source) => return Err(ForwardError::Listen { addr, source }),
        }
    }
}
