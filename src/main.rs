//! kubedeck - interactive sessions for a Kubernetes control panel
//!
//! Serves an HTTP/WebSocket API that opens shells inside pods (exec) and
//! tunnels local TCP ports into pods (port-forward).

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use kubedeck::{
    api,
    cluster::{ClusterError, KubeCluster},
    config::{ConfigError, Settings},
};

/// kubedeck - interactive sessions for a Kubernetes control panel
///
/// Command-line flags override values from the config file.
#[derive(ClapParser, Debug)]
#[command(name = "kubedeck", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket API server
    #[arg(long, env = "KUBEDECK_BIND")]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long, env = "KUBEDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig context to use (defaults to the current context)
    #[arg(long, env = "KUBEDECK_CONTEXT")]
    context: Option<String>,

    /// Explicit kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Seconds a port-forward start waits for the session to become ready
    #[arg(long)]
    ready_timeout_secs: Option<u64>,

    /// Maximum number of concurrent port-forward sessions
    #[arg(long)]
    max_port_forwards: Option<usize>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(context) = &self.context {
            settings.cluster.context = Some(context.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            settings.cluster.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(secs) = self.ready_timeout_secs {
            settings.portforward.ready_timeout_secs = secs;
        }
        if let Some(max) = self.max_port_forwards {
            settings.portforward.max_sessions = Some(max);
        }
    }
}

#[derive(Error, Debug)]
pub enum KubedeckError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), KubedeckError> {
    let cli = Cli::parse();
    init_tracing();

    let settings = load_settings(&cli)?;
    run_server(settings).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kubedeck=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file (explicit path, else the default location), then CLI overrides.
fn load_settings(cli: &Cli) -> Result<Settings, KubedeckError> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?.ok_or_else(|| {
            ConfigError::ReadFailed(
                path.clone(),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?,
        None => match Settings::default_path() {
            Some(path) => Settings::load_or_default(&path)?,
            None => Settings::default(),
        },
    };
    cli.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

async fn run_server(settings: Settings) -> Result<(), KubedeckError> {
    tracing::info!("kubedeck starting");

    let cluster = KubeCluster::connect(&settings.cluster).await?;
    let bind = settings.bind;
    let state = api::AppState::new(Arc::new(cluster), settings);
    let forwards = state.forwards.clone();
    let shutdown = state.shutdown.clone();
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("received Ctrl+C"),
                Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl+C, shutting down"),
            }
        }
        result = &mut http_handle => {
            // The server stopped on its own; nothing left to drain.
            result??;
            return Ok(());
        }
    }

    // Signal exec WebSockets to send their final frame and close
    shutdown.shutdown();
    let stopped = forwards.stop_all();
    tracing::info!(stopped, "port-forward sessions stopped");
    // Give handlers a moment to flush before stopping the server
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let _ = server_shutdown_tx.send(());
    http_handle.await??;

    tracing::info!("kubedeck exiting");
    Ok(())
}
