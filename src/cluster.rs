//! Upgraded duplex streams into cluster workloads.
//!
//! The SPDY/WebSocket negotiation for `pods/exec` and `pods/portforward` is
//! owned by `kube`. This module narrows it down to the two operations the
//! session subsystem needs, behind the [`ClusterSessions`] trait so the
//! session logic can run against an in-memory fake.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ClusterConfig;
use crate::session::PodRef;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to load cluster configuration: {0}")]
    Config(String),

    #[error("pod not found: {0}")]
    PodNotFound(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("port-forward failed: {0}")]
    PortForward(String),

    #[error("cluster API error: {0}")]
    Kube(#[from] kube::Error),
}

/// A bidirectional byte stream to a workload.
pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Upgraded stream for one forwarded TCP connection.
pub type ForwardStream = Box<dyn DuplexIo>;

/// The halves of an interactive command execution.
pub struct ExecStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Terminal size updates, if the remote side accepts them.
    pub resize: Option<futures::channel::mpsc::Sender<kube::api::TerminalSize>>,
    /// Resolves once the command has finished. Yields a message when the
    /// command ended in failure.
    pub status: Option<BoxFuture<'static, Option<String>>>,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("resize", &self.resize.is_some())
            .field("status", &self.status.is_some())
            .finish_non_exhaustive()
    }
}

/// What the session subsystem needs from the cluster.
#[async_trait]
pub trait ClusterSessions: Send + Sync {
    /// Name of the first container declared by the pod, if it has any.
    async fn first_container(&self, pod: &PodRef) -> Result<Option<String>, ClusterError>;

    /// Start `command` with a TTY in `container` (or the server's default
    /// container when `None`).
    async fn open_exec(
        &self,
        pod: &PodRef,
        container: Option<&str>,
        command: &[String],
    ) -> Result<ExecStream, ClusterError>;

    /// Open one forwarded connection to `remote_port` inside the pod.
    async fn open_port_forward(
        &self,
        pod: &PodRef,
        remote_port: u16,
    ) -> Result<ForwardStream, ClusterError>;
}

/// [`ClusterSessions`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from kubeconfig (or in-cluster config) using the
    /// selected context.
    pub async fn connect(settings: &ClusterConfig) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: settings.context.clone(),
            ..Default::default()
        };
        let config = match (&settings.kubeconfig, &settings.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Config(format!("{}: {e}", path.display())))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };
        tracing::info!(
            cluster_url = %config.cluster_url,
            context = ?settings.context,
            "cluster client configured"
        );
        Ok(Self::new(Client::try_from(config)?))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterSessions for KubeCluster {
    async fn first_container(&self, pod: &PodRef) -> Result<Option<String>, ClusterError> {
        let object = self
            .pods(&pod.namespace)
            .get(&pod.pod)
            .await
            .map_err(|e| classify(pod, e))?;
        Ok(object
            .spec
            .and_then(|spec| spec.containers.into_iter().next())
            .map(|container| container.name))
    }

    async fn open_exec(
        &self,
        pod: &PodRef,
        container: Option<&str>,
        command: &[String],
    ) -> Result<ExecStream, ClusterError> {
        let mut params = AttachParams::interactive_tty();
        if let Some(container) = container.filter(|c| !c.is_empty()) {
            params = params.container(container);
        }

        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.pod, command.to_vec(), &params)
            .await
            .map_err(|e| classify(pod, e))?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| ClusterError::Exec("stdin not available".into()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| ClusterError::Exec("stdout not available".into()))?;
        let resize = attached.terminal_size();
        let status = attached
            .take_status()
            .map(|status| async move { status.await.and_then(failure_message) }.boxed());

        Ok(ExecStream {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            resize,
            status,
        })
    }

    async fn open_port_forward(
        &self,
        pod: &PodRef,
        remote_port: u16,
    ) -> Result<ForwardStream, ClusterError> {
        let mut forwarder = self
            .pods(&pod.namespace)
            .portforward(&pod.pod, &[remote_port])
            .await
            .map_err(|e| classify(pod, e))?;
        let stream = forwarder.take_stream(remote_port).ok_or_else(|| {
            ClusterError::PortForward(format!("no stream for port {remote_port}"))
        })?;
        Ok(Box::new(stream))
    }
}

/// Turn a 404 from the API server into [`ClusterError::PodNotFound`].
fn classify(pod: &PodRef, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => {
            ClusterError::PodNotFound(pod.to_string())
        }
        other => ClusterError::Kube(other),
    }
}

fn failure_message(status: Status) -> Option<String> {
    if status.status.as_deref() == Some("Success") {
        return None;
    }
    Some(
        status
            .message
            .unwrap_or_else(|| "command terminated".to_string()),
    )
}
