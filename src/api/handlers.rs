use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitStream;
use futures::{future, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::exec::{self, ExecRequest};
use crate::portforward::PortForwardInfo;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::PodRef;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    exec_sessions: usize,
    port_forwards: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.shutdown.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        exec_sessions: state.shutdown.active_count(),
        port_forwards: state.forwards.len(),
    })
}

// ── Port-forward ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartForwardBody {
    #[serde(default)]
    local_port: Option<u16>,
    #[serde(default)]
    remote_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StopForwardQuery {
    #[serde(default)]
    local_port: Option<u16>,
    #[serde(default)]
    remote_port: Option<u16>,
}

pub(super) async fn portforward_start(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    body: Result<Json<StartForwardBody>, JsonRejection>,
) -> Result<(StatusCode, Json<PortForwardInfo>), ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let info = state
        .forwards
        .start(
            &namespace,
            &pod,
            body.local_port.unwrap_or(0),
            body.remote_port.unwrap_or(0),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub(super) async fn portforward_stop(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    query: Result<Query<StopForwardQuery>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    state.forwards.stop(
        &namespace,
        &pod,
        query.local_port.unwrap_or(0),
        query.remote_port.unwrap_or(0),
    )?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn portforward_list_for_pod(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<Json<Vec<PortForwardInfo>>, ApiError> {
    let pod = PodRef::new(namespace, pod).map_err(ApiError::InvalidRequest)?;
    Ok(Json(state.forwards.list_for_pod(&pod.namespace, &pod.pod)))
}

pub(super) async fn portforward_list(State(state): State<AppState>) -> Json<Vec<PortForwardInfo>> {
    Json(state.forwards.list())
}

// ── Exec ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(super) struct ExecQuery {
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    shell: Option<String>,
}

pub(super) async fn exec_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    query: Result<Query<ExecQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let Query(query) = query.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let pod = PodRef::new(namespace, pod).map_err(ApiError::InvalidRequest)?;
    let shell = query
        .shell
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.settings.exec.default_shell.clone());
    let request = ExecRequest {
        pod,
        container: query.container.filter(|c| !c.is_empty()),
        command: vec![shell],
    };
    Ok(ws
        .on_upgrade(move |socket| handle_exec_ws(socket, state, request))
        .into_response())
}

async fn handle_exec_ws(socket: WebSocket, state: AppState, request: ExecRequest) {
    // Counted as an active exec session until this returns.
    let (_guard, shutdown_rx) = state.shutdown.register();

    let (ws_tx, ws_rx) = socket.split();
    let sink = ws_tx.with(|frame: ServerFrame| {
        future::ready(Ok::<_, axum::Error>(Message::Text(frame.to_json().into())))
    });

    exec::run(
        state.cluster.as_ref(),
        &request,
        sink,
        client_frames(ws_rx),
        shutdown_rx,
    )
    .await;
}

/// Decode incoming WebSocket messages into client frames.
///
/// The stream ends on a close frame or transport error. Messages that are not
/// valid frames are skipped.
fn client_frames(
    ws_rx: SplitStream<WebSocket>,
) -> impl Stream<Item = ClientFrame> + Unpin {
    ws_rx
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => match ClientFrame::parse(text.as_str()) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed exec frame");
                        None
                    }
                },
                // Ping/Pong handled automatically
                _ => None,
            })
        })
}
