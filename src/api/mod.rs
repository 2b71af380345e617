pub mod error;
mod handlers;
pub mod origin;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::cluster::ClusterSessions;
use crate::config::Settings;
use crate::portforward::{ForwardOptions, PortForwardRegistry};
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Request bodies are tiny JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<dyn ClusterSessions>,
    pub forwards: PortForwardRegistry,
    pub shutdown: ShutdownCoordinator,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Wire a cluster capability and settings into a fresh state.
    pub fn new(cluster: Arc<dyn ClusterSessions>, settings: Settings) -> Self {
        let forwards =
            PortForwardRegistry::new(cluster.clone(), ForwardOptions::from(&settings.portforward));
        Self {
            cluster,
            forwards,
            shutdown: ShutdownCoordinator::new(),
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let allowed_origins = origin::allowed_ws_origins(state.settings.bind, &state.settings.cors_origins);
    let cors_origins = state.settings.cors_origins.clone();

    let pod_routes = Router::new()
        .route("/exec", get(exec_ws))
        .route(
            "/portforward",
            get(portforward_list_for_pod)
                .post(portforward_start)
                .delete(portforward_stop),
        );

    let api = Router::new()
        .nest("/namespaces/{namespace}/pods/{pod}", pod_routes)
        .route("/portforwards", get(portforward_list))
        .layer(axum::middleware::from_fn(move |req, next| {
            let origins = allowed_origins.clone();
            origin::check_ws_origin(origins, req, next)
        }));

    let router = Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
