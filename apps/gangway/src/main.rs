use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use gangway::control::{ControlPlane, HttpControlPlane, RetryPolicy};
use gangway::exec::WsExec;
use gangway::gate::{router, GateState};
use gangway::session::SessionRegistry;
use gangway::telemetry::Telemetry;

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    control_plane_url: Url,
    exec_url: Url,
    handshake_timeout: Duration,
    shutdown_grace: Duration,
    retry: RetryPolicy,
}

#[derive(Debug, Parser)]
#[command(
    name = "gangway",
    author,
    version,
    about = "Session gate that attaches client terminals to cluster-hosted apps"
)]
struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "GANGWAY_LISTEN_ADDR", default_value = "127.0.0.1:8701")]
    listen_addr: String,

    /// Base URL of the app control plane.
    #[arg(
        long,
        env = "GANGWAY_CONTROL_PLANE_URL",
        default_value = "http://127.0.0.1:8700/"
    )]
    control_plane_url: String,

    /// Base URL of the cluster exec endpoint.
    #[arg(long, env = "GANGWAY_EXEC_URL", default_value = "ws://127.0.0.1:8702/")]
    exec_url: String,

    /// Maximum time clients have to send their open frame.
    #[arg(long, env = "GANGWAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    handshake_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "GANGWAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Attempts per control-plane update before a conflict is surfaced.
    #[arg(long, env = "GANGWAY_CONFLICT_RETRY_ATTEMPTS", default_value_t = 5)]
    conflict_retry_attempts: u32,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let control_plane_url: Url = cli
            .control_plane_url
            .parse()
            .with_context(|| format!("invalid control plane url: {}", cli.control_plane_url))?;
        let exec_url: Url = cli
            .exec_url
            .parse()
            .with_context(|| format!("invalid exec url: {}", cli.exec_url))?;
        Ok(ServerConfig {
            listen_addr,
            control_plane_url,
            exec_url,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            retry: RetryPolicy {
                attempts: cli.conflict_retry_attempts,
                ..RetryPolicy::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        control_plane = %config.control_plane_url,
        exec = %config.exec_url,
        "starting gangway"
    );

    run(config, telemetry).await
}

async fn run(config: ServerConfig, telemetry: Telemetry) -> Result<()> {
    let control: Arc<dyn ControlPlane> =
        Arc::new(HttpControlPlane::new(config.control_plane_url.clone()));
    let registry = SessionRegistry::new(control, config.retry.clone());
    let exec = Arc::new(WsExec::new(config.exec_url.clone()));
    let state = Arc::new(GateState::new(
        registry,
        exec,
        config.handshake_timeout,
        telemetry.metrics_handle(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("gangway listening on {}", config.listen_addr);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    let server = axum::serve(listener, router(state)).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    // The grace period bounds the connection drain: once the signal lands,
    // open attaches get that long to finish before the process exits anyway.
    tokio::select! {
        result = server => result.context("server shutdown with error")?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(config.shutdown_grace).await;
        } => {
            info!(
                grace_seconds = config.shutdown_grace.as_secs(),
                "drain window elapsed; exiting with connections still open"
            );
        }
    }
    info!("graceful shutdown complete");

    Ok(())
}
