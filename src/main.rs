//! foreman — leaderful cluster membership daemon.
//!
//! Startup order matters: configuration, logging, a probe-bind of the
//! listen port, then the store and the membership pool, and only then
//! the HTTP server.  SIGINT/SIGTERM trigger an orderly stop — the
//! master hands over to its first-in-turn slave, a slave says goodbye to
//! its master — and the process exits 0.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use foreman::config::{self, Config};
use foreman::errors::StopCause;
use foreman::pool::Pool;
use foreman::store::records::NodeRecord;
use foreman::store::NodeStore;

/// Name every fleet member registers under.
const NODE_NAME: &str = "FOREMAN-PRODUCER";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "foreman",
    version,
    about = "Leaderful cluster membership daemon for producer fleets"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "foreman.yaml")]
    config: String,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        config::load_config(&cli.config)?
    } else {
        Config::default()
    };
    config::apply_env_overrides(&mut config);
    if let Some(port) = cli.port {
        config.net.listen_port = port;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if config.is_debug() { "debug" } else { "info" })
            }),
        )
        .init();

    // Probe the listen port before any cluster state is written, so a
    // taken port fails fast without leaving rows behind.
    let bind_addr = format!("0.0.0.0:{}", config.net.listen_port);
    std::net::TcpListener::bind(&bind_addr).map_err(|e| {
        anyhow::anyhow!(
            "cannot bind the listening port {}: {e}",
            config.net.listen_port
        )
    })?;

    let pool = start_membership(&config).await?;

    let state = Arc::new(foreman::AppState {
        config: config.clone(),
        pool: pool.clone(),
    });
    let app = foreman::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("foreman listening on {bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(pool) = &pool {
        pool.stop(StopCause::EndpointStopped).await;
    }
    info!("foreman shut down");

    Ok(())
}

/// Bring up the membership core per the configured identity.
async fn start_membership(config: &Config) -> anyhow::Result<Option<Arc<Pool>>> {
    if config.identity == 0 {
        info!("identity not configured, membership core disabled");
        return Ok(None);
    }
    let server = config
        .database
        .servers
        .first()
        .ok_or_else(|| anyhow::anyhow!("no database server configured"))?;
    let store = Arc::new(NodeStore::new(&server.path)?);
    let self_node = NodeRecord::new(
        NODE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.net.listen_port,
        1,
    );
    let pool = Pool::new(store, self_node, config.localhost)?;
    pool.start(config.identity).await?;

    if pool.local.is_not_determined() {
        info!("identity: not determined");
    }
    if pool.local.is_master() {
        info!("identity: master");
        info!("self  : {}", pool.local.node());
    }
    if pool.local.is_slave() {
        info!("identity: slave");
        if let Some(master) = pool.master.node() {
            info!("master: {master}");
        }
        info!("self  : {}", pool.local.node());
    }
    Ok(Some(pool))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
