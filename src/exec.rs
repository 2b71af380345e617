//! Bridge between a client frame channel and a command running in a pod.
//!
//! The bridge is generic over the client side: anything that yields
//! [`ClientFrame`]s and accepts [`ServerFrame`]s. The HTTP layer adapts a
//! WebSocket to that shape; tests use plain channels.

use std::time::Duration;

use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc as tokio_mpsc, watch};

use crate::cluster::{ClusterError, ClusterSessions, ExecStream};
use crate::lifecycle::ExitGuard;
use crate::protocol::{ClientFrame, ServerFrame, Utf8Decoder};
use crate::session::PodRef;
use crate::terminal::ResizeQueue;

const READ_BUF_SIZE: usize = 8192;

/// How long to wait for the exit status once remote output has ended.
const STATUS_GRACE: Duration = Duration::from_secs(2);

/// What to run, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub pod: PodRef,
    /// Empty or `None` selects the pod's first container.
    pub container: Option<String>,
    pub command: Vec<String>,
}

/// Why a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEnd {
    /// The exec stream could not be opened.
    OpenFailed,
    /// The client hung up or stopped accepting frames.
    ClientClosed,
    /// The remote command finished.
    RemoteExited,
    /// The remote stream broke mid-session.
    RemoteFailed,
    /// The server is shutting down.
    Shutdown,
}

impl ExecEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecEnd::OpenFailed => "open failed",
            ExecEnd::ClientClosed => "client closed",
            ExecEnd::RemoteExited => "remote exited",
            ExecEnd::RemoteFailed => "remote failed",
            ExecEnd::Shutdown => "shutdown",
        }
    }
}

/// Resolve the target container and open the exec stream.
pub async fn open(
    cluster: &dyn ClusterSessions,
    request: &ExecRequest,
) -> Result<ExecStream, ClusterError> {
    let container = match request.container.as_deref().filter(|c| !c.is_empty()) {
        Some(container) => Some(container.to_string()),
        None => {
            let first = cluster.first_container(&request.pod).await?;
            if first.is_none() {
                tracing::debug!(pod = %request.pod, "pod declares no containers");
            }
            first
        }
    };
    cluster
        .open_exec(&request.pod, container.as_deref(), &request.command)
        .await
}

/// Open the exec stream and bridge it to the client until either side ends.
///
/// Failing to open sends one `error` frame. The sink is closed on every path.
pub async fn run<S, R>(
    cluster: &dyn ClusterSessions,
    request: &ExecRequest,
    mut sink: S,
    frames: R,
    shutdown: watch::Receiver<bool>,
) -> ExecEnd
where
    S: Sink<ServerFrame> + Unpin,
    R: Stream<Item = ClientFrame> + Unpin,
{
    let end = match open(cluster, request).await {
        Ok(stream) => {
            tracing::info!(
                pod = %request.pod,
                container = ?request.container,
                command = ?request.command,
                "exec session started"
            );
            bridge(stream, &mut sink, frames, shutdown).await
        }
        Err(e) => {
            tracing::warn!(pod = %request.pod, error = %e, "exec failed to start");
            let _ = sink.send(ServerFrame::error(e.to_string())).await;
            ExecEnd::OpenFailed
        }
    };
    let _ = sink.close().await;
    tracing::info!(pod = %request.pod, reason = end.as_str(), "exec session ended");
    end
}

/// Pump frames between the client and an open exec stream.
pub async fn bridge<S, R>(
    stream: ExecStream,
    sink: &mut S,
    mut frames: R,
    mut shutdown: watch::Receiver<bool>,
) -> ExecEnd
where
    S: Sink<ServerFrame> + Unpin,
    R: Stream<Item = ClientFrame> + Unpin,
{
    let ExecStream {
        stdin,
        mut stdout,
        resize,
        mut status,
    } = stream;

    let resizes = ResizeQueue::new();
    let resize_task = resize.map(|tx| tokio::spawn(forward_resizes(resizes.clone(), tx)));

    // Stdin gets its own task so a slow remote reader never stalls stdout or
    // client frames.
    let (input_tx, input_rx) = tokio_mpsc::unbounded_channel::<String>();
    let mut writer = tokio::spawn(write_input(stdin, input_rx));
    let stop_writer = writer.abort_handle();

    let _stop_tasks = ExitGuard::new(move || {
        stop_writer.abort();
        if let Some(task) = resize_task {
            task.abort();
        }
    });

    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(ClientFrame::Input { data }) => {
                    // Only fails once the writer has exited; its result is
                    // picked up by the branch below.
                    let _ = input_tx.send(data);
                }
                Some(resize @ ClientFrame::Resize { .. }) => {
                    if let Some(size) = resize.terminal_size() {
                        if resizes.push(size) {
                            tracing::trace!(rows = size.rows, cols = size.cols, "collapsed pending resize");
                        }
                    }
                }
                None => return ExecEnd::ClientClosed,
            },

            written = &mut writer => {
                let e = match written {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                    Err(e) => std::io::Error::other(e),
                };
                tracing::debug!(error = %e, "remote stdin closed");
                let _ = sink.send(ServerFrame::error(format!("stdin closed: {e}"))).await;
                return ExecEnd::RemoteFailed;
            },

            read = stdout.read(&mut buf) => match read {
                Ok(0) => {
                    let tail = decoder.finish();
                    if !tail.is_empty() && sink.send(ServerFrame::output(tail)).await.is_err() {
                        return ExecEnd::ClientClosed;
                    }
                    let failure = match status.take() {
                        Some(status) => tokio::time::timeout(STATUS_GRACE, status)
                            .await
                            .unwrap_or(None),
                        None => None,
                    };
                    if let Some(message) = failure {
                        let _ = sink.send(ServerFrame::error(message)).await;
                    }
                    return ExecEnd::RemoteExited;
                }
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && sink.send(ServerFrame::output(text)).await.is_err() {
                        return ExecEnd::ClientClosed;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "remote stdout failed");
                    let _ = sink.send(ServerFrame::error(format!("stream error: {e}"))).await;
                    return ExecEnd::RemoteFailed;
                }
            },

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(ServerFrame::error("server shutting down")).await;
                    return ExecEnd::Shutdown;
                }
            }
        }
    }
}

/// Write client input to the remote stdin in arrival order.
///
/// Returns when the bridge drops its sender or a write fails.
async fn write_input(
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut input: tokio_mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    while let Some(data) = input.recv().await {
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await?;
    }
    Ok(())
}

/// Drain the resize queue into the remote terminal-size channel.
async fn forward_resizes(queue: ResizeQueue, mut tx: mpsc::Sender<kube::api::TerminalSize>) {
    loop {
        let size = queue.pop().await;
        if tx.send(size.into()).await.is_err() {
            break;
        }
    }
}
