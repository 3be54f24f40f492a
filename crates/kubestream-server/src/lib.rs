//! WebSocket front of kubestream
//!
//! Every accepted channel gets its own stream session: the first text frame
//! is the watch request, every following server frame is one line event.

mod connection;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubestream_k8s::{LogSource, PodDirectory};
use kubestream_logs::SessionConfig;

pub use connection::handle_connection;

/// What every connection needs to start a session
pub struct ServerState {
    pub directory: Arc<dyn PodDirectory>,
    pub source: Arc<dyn LogSource>,
    pub config: SessionConfig,
}

impl ServerState {
    pub fn new(
        directory: Arc<dyn PodDirectory>,
        source: Arc<dyn LogSource>,
        config: SessionConfig,
    ) -> Self {
        Self {
            directory,
            source,
            config,
        }
    }
}

/// Accept channels until `shutdown` is cancelled, then close every session
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(%addr, "Listening for log channels");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        state.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!(open = connections.len(), "Shutting down; closing open channels");
    while connections.join_next().await.is_some() {}
    Ok(())
}
