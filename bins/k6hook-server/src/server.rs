// Server wiring: tracing, collaborators, HTTP listener and shutdown

use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, KubernetesClient, LogFormat};
use crate::engine::{K6Client, LocalRunner};
use crate::launch::LaunchHandler;
use crate::routes;
use crate::secrets::{KubeSecretStore, SecretStore};
use crate::slack::{NoopNotifier, Notifier, SlackNotifier};
use crate::AppState;

/// RUST_LOG takes precedence over the configured level
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

pub async fn serve(cli: Cli) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let client: Arc<dyn K6Client> = Arc::new(LocalRunner::new(
        cli.k6_binary.clone(),
        cli.cloud_token().map(str::to_string),
    ));

    let notifier: Arc<dyn Notifier> = match cli.slack_token() {
        Some(token) => Arc::new(SlackNotifier::new(token)?),
        None => {
            info!("No Slack token configured, notifications are disabled");
            Arc::new(NoopNotifier)
        }
    };

    let secrets: Option<Arc<dyn SecretStore>> = match cli.kubernetes_client {
        KubernetesClient::None => None,
        KubernetesClient::InCluster => Some(Arc::new(
            KubeSecretStore::in_cluster().context("creating in-cluster kubernetes client")?,
        )),
    };

    let launcher = Arc::new(LaunchHandler::new(
        shutdown.clone(),
        client,
        secrets,
        notifier,
        cli.launch_config(),
    )?);
    info!(
        max_concurrent_tests = cli.max_concurrent_tests,
        "Launch handler ready"
    );

    let state = Arc::new(AppState {
        launcher: launcher.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("HTTP server listening on {}", addr);

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let stopped = shutdown.clone();
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stopped.cancelled().await })
    .await
    .context("server error")?;

    info!("Waiting for test runs to exit");
    launcher.wait().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Received shutdown signal, stopping test runs...");
    shutdown.cancel();
}
