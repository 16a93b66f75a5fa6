//! net-attach-def-controller - secondary-network Service endpoints for Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use net_attach_def_controller::controller::{run_controller, ControllerConfig, ControllerState};
use net_attach_def_controller::rest_api::run_server;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Maintains Service Endpoints from pods' secondary network status and
/// recovers NetworkAttachmentDefinitions deleted while still in use
#[derive(Parser, Debug)]
#[command(name = "net-attach-def-controller", version, about, long_about = None)]
struct Cli {
    /// Address of the Kubernetes API server, overriding the kubeconfig
    #[arg(long, env = "KUBE_MASTER")]
    master: Option<String>,

    /// Path to a kubeconfig file; in-cluster configuration is used otherwise
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Number of concurrent reconciliation workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Seconds to wait for the initial cache sync before giving up
    #[arg(long, default_value_t = 120)]
    cache_sync_timeout_secs: u64,

    /// Requeue budget for a Service whose sync keeps failing
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Listen address for /healthz, /readyz and /metrics
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    info!("Starting net-attach-def-controller {}", env!("CARGO_PKG_VERSION"));

    let client = create_client(&cli).await?;
    let config = ControllerConfig {
        workers: cli.workers,
        max_retries: cli.max_retries,
        cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
    };
    let state = Arc::new(ControllerState::new(client, config));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let server = tokio::spawn(run_server(state.clone(), cli.http_addr, shutdown.clone()));

    let result = run_controller(state, shutdown.clone()).await;
    shutdown.cancel();

    match server.await {
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    result.context("controller terminated")?;
    info!("Shutdown complete");
    Ok(())
}

/// Build the API client from an explicit kubeconfig or the in-cluster
/// environment, with `--master` overriding the server address
async fn create_client(cli: &Cli) -> anyhow::Result<Client> {
    let mut config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => Config::infer().await.context("failed to infer config")?,
    };

    if let Some(master) = &cli.master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("invalid master URL {}", master))?;
    }

    Client::try_from(config).context("failed to create client")
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
