#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::StreamExt;
use kubedeck::api::{self, AppState};
use kubedeck::cluster::{ClusterError, ClusterSessions, ExecStream, ForwardStream};
use kubedeck::config::Settings;
use kubedeck::session::PodRef;
use kubedeck::terminal::TerminalSize;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Pod name the fake reports as nonexistent.
pub const MISSING_POD: &str = "ghost";

/// How the fake answers port-forward upgrade requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Every stream echoes what it receives.
    Echo,
    /// The upgrade is rejected.
    Reject,
    /// The upgrade never completes.
    Hang,
}

/// One recorded exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: PodRef,
    pub container: Option<String>,
    pub command: Vec<String>,
}

/// In-memory stand-in for a cluster.
///
/// Port-forward streams and exec sessions are `tokio::io::duplex` pairs whose
/// far ends are driven by background tasks. An exec "shell" echoes its input
/// and exits when it reads `exit`.
pub struct FakeCluster {
    mode: Mutex<ForwardMode>,
    forward_opens: AtomicUsize,
    exec_calls: Mutex<Vec<ExecCall>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    exit_failure: Mutex<Option<String>>,
}

impl FakeCluster {
    pub fn new(mode: ForwardMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            forward_opens: AtomicUsize::new(0),
            exec_calls: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
            exit_failure: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: ForwardMode) {
        *self.mode.lock() = mode;
    }

    /// Number of port-forward streams requested so far.
    pub fn forward_opens(&self) -> usize {
        self.forward_opens.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.exec_calls.lock().clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().clone()
    }

    /// Make exec commands report this failure when they exit.
    pub fn fail_exit_with(&self, message: &str) {
        *self.exit_failure.lock() = Some(message.to_string());
    }

    fn check_pod(pod: &PodRef) -> Result<(), ClusterError> {
        if pod.pod == MISSING_POD {
            return Err(ClusterError::PodNotFound(pod.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterSessions for FakeCluster {
    async fn first_container(&self, pod: &PodRef) -> Result<Option<String>, ClusterError> {
        Self::check_pod(pod)?;
        Ok(Some("app".to_string()))
    }

    async fn open_exec(
        &self,
        pod: &PodRef,
        container: Option<&str>,
        command: &[String],
    ) -> Result<ExecStream, ClusterError> {
        Self::check_pod(pod)?;
        self.exec_calls.lock().push(ExecCall {
            pod: pod.clone(),
            container: container.map(str::to_string),
            command: command.to_vec(),
        });

        let (stdin_local, mut stdin_remote) = tokio::io::duplex(4096);
        let (stdout_local, mut stdout_remote) = tokio::io::duplex(4096);
        let (resize_tx, mut resize_rx) = mpsc::channel::<kube::api::TerminalSize>(8);
        let (status_tx, status_rx) = tokio::sync::oneshot::channel::<Option<String>>();

        let exit_failure = self.exit_failure.lock().clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stdin_remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        if stdout_remote.write_all(chunk).await.is_err() {
                            break;
                        }
                        if chunk.windows(4).any(|w| w == b"exit") {
                            break;
                        }
                    }
                }
            }
            drop(stdout_remote);
            let _ = status_tx.send(exit_failure);
        });

        let resizes = self.resizes.clone();
        tokio::spawn(async move {
            while let Some(size) = resize_rx.next().await {
                resizes.lock().push(TerminalSize::new(size.height, size.width));
            }
        });

        let status: BoxFuture<'static, Option<String>> =
            Box::pin(async move { status_rx.await.unwrap_or(None) });
        Ok(ExecStream {
            stdin: Box::new(stdin_local),
            stdout: Box::new(stdout_local),
            resize: Some(resize_tx),
            status: Some(status),
        })
    }

    async fn open_port_forward(
        &self,
        pod: &PodRef,
        _remote_port: u16,
    ) -> Result<ForwardStream, ClusterError> {
        Self::check_pod(pod)?;
        self.forward_opens.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            ForwardMode::Reject => Err(ClusterError::PortForward("upgrade rejected".into())),
            ForwardMode::Hang => futures::future::pending().await,
            ForwardMode::Echo => {
                let (local, remote) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(remote);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
                Ok(Box::new(local))
            }
        }
    }
}

/// Settings for tests: the API binds an ephemeral port and forwards give up
/// after one second.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.bind = "127.0.0.1:0".parse().unwrap();
    settings.portforward.ready_timeout_secs = 1;
    settings
}

pub fn create_test_state(cluster: Arc<FakeCluster>) -> AppState {
    AppState::new(cluster, test_settings())
}

pub async fn start_test_server(state: AppState) -> SocketAddr {
    let app = api::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

/// A local port that was free a moment ago.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// Wait until `port` can be bound again, i.e. its forward has let go of it.
pub async fn wait_port_released(port: u16) -> bool {
    for _ in 0..50 {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
