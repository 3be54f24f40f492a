use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubestream_types::{WatchRequest, WireLineEvent};

/// Stable identity of a client session, independent of its (renamable) name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that happened on a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Line(WireLineEvent),
    /// The channel ended; Some carries the transport error
    Closed(Option<String>),
}

/// A channel event addressed to the session and channel generation that opened it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub session: SessionId,
    pub generation: u64,
    pub event: ChannelEvent,
}

/// Owning handle of an open channel; closing or dropping it ends the channel
#[derive(Debug)]
pub struct ChannelHandle {
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens server channels for client sessions
pub trait ChannelOpener: Send + Sync {
    /// Open a channel, send `request`, and deliver events tagged with
    /// `session` and `generation` until the handle is closed
    fn open(
        &self,
        request: WatchRequest,
        session: SessionId,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelMessage>,
    ) -> ChannelHandle;
}

/// WebSocket channel to a kubestream server
#[derive(Clone, Debug)]
pub struct WebSocketOpener {
    url: String,
}

impl WebSocketOpener {
    pub fn new(server: &str, api_key: Option<&str>) -> Self {
        let base = server.trim_end_matches('/');
        let url = match api_key.filter(|k| !k.is_empty()) {
            Some(key) => format!("{}/?key={}", base, key),
            None => format!("{}/", base),
        };
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ChannelOpener for WebSocketOpener {
    fn open(
        &self,
        request: WatchRequest,
        session: SessionId,
        generation: u64,
        events: mpsc::UnboundedSender<ChannelMessage>,
    ) -> ChannelHandle {
        let cancel = CancellationToken::new();
        let task = ChannelTask {
            url: self.url.clone(),
            request,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            let send = |event: ChannelEvent| {
                let _ = events.send(ChannelMessage {
                    session,
                    generation,
                    event,
                });
            };
            task.run(send).await;
        });

        ChannelHandle::new(cancel)
    }
}

struct ChannelTask {
    url: String,
    request: WatchRequest,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(self, send: impl Fn(ChannelEvent)) {
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            connected = connect_async(self.url.as_str()) => connected,
        };
        let ws = match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to open channel");
                send(ChannelEvent::Closed(Some(e.to_string())));
                return;
            }
        };
        info!(url = %self.url, scope = %self.request.scope, "Channel open");

        let (mut sink, mut incoming) = ws.split();

        let request = match serde_json::to_string(&self.request) {
            Ok(json) => json,
            Err(e) => {
                send(ChannelEvent::Closed(Some(e.to_string())));
                return;
            }
        };
        if let Err(e) = sink.send(WsMessage::text(request)).await {
            send(ChannelEvent::Closed(Some(e.to_string())));
            return;
        }

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(url = %self.url, "Closing channel");
                    let _ = sink.close().await;
                    return;
                }
                msg = incoming.next() => msg,
            };

            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<WireLineEvent>(text.as_str()) {
                        Ok(event) => send(ChannelEvent::Line(event)),
                        Err(e) => warn!(error = %e, "Dropping malformed line event"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    send(ChannelEvent::Closed(None));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    send(ChannelEvent::Closed(Some(e.to_string())));
                    return;
                }
            }
        }
    }
}
