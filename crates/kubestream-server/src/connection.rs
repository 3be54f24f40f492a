use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubestream_logs::StreamSession;
use kubestream_types::{WatchRequest, WireLineEvent, diagnostic_text};

use crate::ServerState;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Serve one channel: read the watch request, then stream lines until
/// either side goes away
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let mut client_key: Option<String> = None;
    let capture_key = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        client_key = req
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("key=")))
            .map(str::to_string);
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, capture_key).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    info!(%peer, key = client_key.as_deref().unwrap_or("-"), "Client connected");

    let (mut sink, mut incoming) = ws.split();

    // The first text frame carries the watch request
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        first = next_text(&mut incoming) => first,
    };
    let Some(text) = first else {
        debug!(%peer, "Channel closed before a watch request");
        return;
    };

    let request = match serde_json::from_str::<WatchRequest>(&text) {
        Ok(request) => request,
        Err(e) => {
            warn!(%peer, error = %e, "Malformed watch request");
            reject(&mut sink, format!("malformed watch request: {}", e)).await;
            return;
        }
    };
    let scope = match request.to_scope() {
        Ok(scope) => scope,
        Err(e) => {
            warn!(%peer, error = %e, "Invalid watch request");
            reject(&mut sink, e).await;
            return;
        }
    };

    let (mut session, mut lines) = StreamSession::start(
        scope,
        request.options(),
        state.directory.clone(),
        state.source.clone(),
        &state.config,
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,

            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "Channel read failed");
                    break;
                }
            },

            line = lines.recv() => {
                let Some(event) = line else {
                    break;
                };
                if let Err(e) = send_line(&mut sink, &event.to_wire()).await {
                    debug!(%peer, error = %e, "Channel write failed");
                    break;
                }
            }
        }
    }

    drop(lines);
    session.shutdown().await;
    let _ = sink.close().await;
    info!(%peer, session = session.id(), "Client disconnected");
}

/// Next text frame, skipping control frames; None when the channel ends
async fn next_text<S>(incoming: &mut S) -> Option<String>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = incoming.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send_line(
    sink: &mut WsSink,
    event: &WireLineEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::text(json)).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode line event");
            Ok(())
        }
    }
}

/// Answer an unusable request with one diagnostic line, then close
async fn reject(sink: &mut WsSink, reason: impl std::fmt::Display) {
    let event = WireLineEvent {
        namespace: String::new(),
        pod_name: String::new(),
        container_name: None,
        text: diagnostic_text(reason),
        timestamp: None,
    };
    let _ = send_line(sink, &event).await;
    let _ = sink.close().await;
}
