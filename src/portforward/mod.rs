//! TCP port-forwarding sessions.
//!
//! Each session listens on a local port and tunnels every accepted connection
//! to a port inside a pod. Sessions are tracked by [`PortForwardRegistry`],
//! which is the only place that knows which forwards are running and is the
//! only way to stop one.

mod registry;
mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::session::{PodRef, SessionState};

pub use registry::{ForwardOptions, PortForwardRegistry};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid port-forward request: {0}")]
    Invalid(String),

    #[error("port-forward session already exists: {0}")]
    Duplicate(String),

    #[error("port-forward session not found: {0}")]
    NotFound(String),

    #[error("maximum number of port-forward sessions reached ({0})")]
    LimitReached(usize),

    #[error("port-forward session {id} did not become ready within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("port-forward session {0} was stopped before it became ready")]
    Stopped(String),

    #[error("port-forward session {0} exited before becoming ready")]
    Abandoned(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Structural identity of a port-forward session.
///
/// Two requests with the same coordinates are the same logical session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortForwardKey {
    pub pod: PodRef,
    pub local_port: u16,
    pub remote_port: u16,
}

impl PortForwardKey {
    /// Validate coordinates and build the key.
    ///
    /// `remote_port` is required. A `local_port` of 0 means "same as
    /// `remote_port`".
    pub fn new(
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self, ForwardError> {
        if remote_port == 0 {
            return Err(ForwardError::Invalid("remotePort is required".into()));
        }
        let pod = PodRef::new(namespace, pod).map_err(ForwardError::Invalid)?;
        let local_port = if local_port == 0 { remote_port } else { local_port };
        Ok(Self {
            pod,
            local_port,
            remote_port,
        })
    }
}

impl fmt::Display for PortForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.pod, self.local_port, self.remote_port)
    }
}

/// Public record of a port-forward session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardInfo {
    pub id: String,
    pub namespace: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: &'static str,
}

impl PortForwardInfo {
    fn new(key: &PortForwardKey, state: SessionState) -> Self {
        Self {
            id: key.to_string(),
            namespace: key.pod.namespace.clone(),
            pod_name: key.pod.pod.clone(),
            local_port: key.local_port,
            remote_port: key.remote_port,
            status: state.public_status(),
        }
    }
}
