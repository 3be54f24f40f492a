use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubestream_k8s::{KubeClient, KubeLogSource, KubePodDirectory};
use kubestream_server::ServerState;

use crate::cli::ServeArgs;
use crate::config::Config;

/// Serve log channels until Ctrl-C
pub async fn run(args: ServeArgs, config: Config) -> Result<()> {
    let context = args.context.or(config.server.context.clone());
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());

    let client = KubeClient::connect(context.as_deref()).await?;
    info!(context = context.as_deref().unwrap_or("<current>"), "Connected to cluster");

    let state = Arc::new(ServerState::new(
        Arc::new(KubePodDirectory::new(client.clone())),
        Arc::new(KubeLogSource::new(client)),
        config.session_config(),
    ));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
        }
        on_signal.cancel();
    });

    kubestream_server::serve(listener, state, shutdown).await
}
