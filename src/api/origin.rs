use std::net::SocketAddr;

use axum::{
    extract::Request,
    http::header::{ORIGIN, UPGRADE},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;

/// Browser origins that may open exec WebSockets: the server's own address
/// plus any configured CORS origins.
pub fn allowed_ws_origins(bind: SocketAddr, cors_origins: &[String]) -> Vec<String> {
    let port = bind.port();
    let mut origins = vec![
        format!("http://127.0.0.1:{port}"),
        format!("http://localhost:{port}"),
        format!("http://[::1]:{port}"),
    ];
    if !bind.ip().is_unspecified() && !bind.ip().is_loopback() {
        origins.push(format!("http://{bind}"));
    }
    origins.extend(cors_origins.iter().cloned());
    origins
}

/// Reject cross-site WebSocket hijacking.
///
/// An exec socket is a shell inside a pod, so an upgrade carrying a foreign
/// `Origin` is refused. Plain HTTP requests and clients that send no
/// `Origin` (CLIs, tests) pass through.
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = req.headers();
    let is_upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());

    match origin {
        Some(origin) if is_upgrade && !allowed_origins.iter().any(|a| a == origin) => {
            tracing::warn!(%origin, path = %req.uri().path(), "rejected WebSocket origin");
            Err(ApiError::OriginNotAllowed)
        }
        _ => Ok(next.run(req).await),
    }
}
