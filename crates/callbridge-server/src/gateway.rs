//! Stream Gateway: the telephony provider's live-media WebSocket.
//!
//! One connection carries one call. The read loop parses each text message
//! into a [`StreamEnvelope`] and dispatches it; a writer task owns the send
//! half and drains a single ordered queue of [`WireCommand`]s, so outbound
//! frames reach the provider in exactly the order they were produced.

use crate::resolver::ResolveError;
use crate::session::{CallSession, SessionHandle, WireCommand};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo,
    },
    response::IntoResponse,
    Extension,
};
use callbridge_types::{BridgeEvent, MediaEnvelope, OutboundFrame, StartEnvelope, StreamEnvelope};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// WebSocket upgrade handler for `/media-stream`.
///
/// The upgrade always succeeds; calls that cannot be routed are declined
/// in-band after the handshake.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// What this connection is carrying.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    /// No `start` handled yet.
    Unbound,
    /// The call was declined; nothing is registered for it.
    Declined(String),
    /// A session owned by this connection.
    Live { stream_id: String, session_id: Uuid },
}

/// Per-connection state, owned by the read loop.
struct Connection {
    state: Arc<AppState>,
    wire: mpsc::Sender<WireCommand>,
    peer: SocketAddr,
    binding: Binding,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (wire_tx, mut wire_rx) =
        mpsc::channel::<WireCommand>(state.settings.outbound_queue_capacity);

    tracing::debug!(%peer, "telephony connection opened");

    // Outbound frames are never dropped: a full queue backpressures the
    // session instead.
    let mut send_task = tokio::spawn(async move {
        while let Some(command) = wire_rx.recv().await {
            match command {
                WireCommand::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("failed to serialize outbound frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                WireCommand::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut connection = Connection {
        state,
        wire: wire_tx,
        peer,
        binding: Binding::Unbound,
    };

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => connection.on_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "telephony connection error");
                    break;
                }
            },
            // The bridge closed the connection (decline or call end).
            _ = &mut send_task => break,
        }
    }

    connection.on_disconnect().await;
    tracing::debug!(%peer, "telephony connection closed");
}

impl Connection {
    async fn on_text(&mut self, text: &str) {
        let envelope = match serde_json::from_str::<StreamEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "dropping malformed envelope");
                self.state.emit(BridgeEvent::FrameDropped {
                    stream_id: self.bound_stream().unwrap_or_default().to_string(),
                    reason: format!("malformed envelope: {}", e),
                });
                return;
            }
        };

        match envelope {
            StreamEnvelope::Connected { protocol, version } => {
                tracing::debug!(
                    peer = %self.peer,
                    protocol = protocol.as_deref().unwrap_or("-"),
                    version = version.as_deref().unwrap_or("-"),
                    "provider handshake"
                );
            }
            StreamEnvelope::Start(start) => self.on_start(start).await,
            StreamEnvelope::Media(media) => self.route_media(media).await,
            StreamEnvelope::Stop { stream_id } => self.route_stop(&stream_id).await,
            StreamEnvelope::Mark { stream_id, name } => self.route_mark(&stream_id, name).await,
        }
    }

    fn bound_stream(&self) -> Option<&str> {
        match &self.binding {
            Binding::Unbound => None,
            Binding::Declined(stream_id) | Binding::Live { stream_id, .. } => Some(stream_id),
        }
    }

    async fn on_start(&mut self, start: StartEnvelope) {
        if let Some(current) = self.bound_stream() {
            if current == start.stream_id {
                tracing::warn!(stream_id = %start.stream_id, "repeated start on the same connection ignored");
                self.state.emit(BridgeEvent::DuplicateStart {
                    stream_id: start.stream_id,
                });
            } else {
                tracing::warn!(
                    current = %current,
                    stream_id = %start.stream_id,
                    "second stream on one connection ignored"
                );
            }
            return;
        }

        if self.state.registry.contains(&start.stream_id) {
            self.reject_duplicate(&start.stream_id);
            return;
        }

        // Resolution completes before the next envelope is read, so no media
        // for this stream can be routed ahead of it.
        let tenant = match self.state.resolver.resolve(&start.to_number).await {
            Ok(tenant) => tenant,
            Err(e) => {
                self.decline(&start, &e).await;
                return;
            }
        };

        let (session, handle) = CallSession::new(
            &start,
            tenant,
            self.wire.clone(),
            self.state.session_deps(),
        );
        let session_id = handle.session_id();
        let tenant_id = handle.tenant_id().to_string();
        if self.state.registry.insert(handle).is_err() {
            // Lost a race with another connection; the unspawned session is dropped.
            self.reject_duplicate(&start.stream_id);
            return;
        }

        tracing::info!(
            stream_id = %start.stream_id,
            call_id = %start.call_id,
            tenant_id = %tenant_id,
            "call session created"
        );
        self.state.emit(BridgeEvent::SessionCreated {
            stream_id: start.stream_id.clone(),
            call_id: start.call_id.clone(),
            tenant_id,
        });
        self.binding = Binding::Live {
            stream_id: start.stream_id,
            session_id,
        };
        tokio::spawn(session.run());
    }

    fn reject_duplicate(&self, stream_id: &str) {
        tracing::warn!(stream_id = %stream_id, "duplicate start for a live stream, keeping existing session");
        self.state.emit(BridgeEvent::DuplicateStart {
            stream_id: stream_id.to_string(),
        });
    }

    /// Accept-then-decline: the handshake already succeeded, so end the call
    /// in-band and send no audio.
    async fn decline(&mut self, start: &StartEnvelope, error: &ResolveError) {
        tracing::warn!(
            stream_id = %start.stream_id,
            call_id = %start.call_id,
            to = %start.to_number,
            error = %error,
            "declining call"
        );
        self.binding = Binding::Declined(start.stream_id.clone());

        let _ = self
            .wire
            .send(WireCommand::Frame(OutboundFrame::Stop {
                stream_id: start.stream_id.clone(),
            }))
            .await;
        let _ = self.wire.send(WireCommand::Close).await;

        self.state.emit(BridgeEvent::SessionDeclined {
            stream_id: start.stream_id.clone(),
            to_number: start.to_number.clone(),
            reason: error.reason().to_string(),
        });
    }

    /// The session this connection started, if `stream_id` names it. Another
    /// connection's stream is never reachable from here.
    fn owned_session(&self, stream_id: &str) -> Option<SessionHandle> {
        let Binding::Live {
            stream_id: bound,
            session_id,
        } = &self.binding
        else {
            return None;
        };
        if bound != stream_id {
            return None;
        }
        self.state
            .registry
            .lookup(stream_id)
            .filter(|handle| handle.session_id() == *session_id)
    }

    async fn route_media(&self, media: MediaEnvelope) {
        let Some(handle) = self.owned_session(&media.stream_id) else {
            self.unknown_stream(&media.stream_id, "media");
            return;
        };
        if handle.on_media(media).await.is_err() {
            tracing::debug!(stream_id = %handle.stream_id(), "session closed, media dropped");
        }
    }

    async fn route_stop(&self, stream_id: &str) {
        let Some(handle) = self.owned_session(stream_id) else {
            self.unknown_stream(stream_id, "stop");
            return;
        };
        if handle.on_stop().await.is_err() {
            tracing::debug!(stream_id = %stream_id, "session already closed at stop");
        }
    }

    async fn route_mark(&self, stream_id: &str, name: String) {
        let Some(handle) = self.owned_session(stream_id) else {
            self.unknown_stream(stream_id, "mark");
            return;
        };
        if handle.on_mark(name).await.is_err() {
            tracing::debug!(stream_id = %stream_id, "session already closed at mark");
        }
    }

    fn unknown_stream(&self, stream_id: &str, event: &str) {
        tracing::warn!(peer = %self.peer, stream_id = %stream_id, event, "envelope for unknown stream dropped");
        self.state.emit(BridgeEvent::UnknownStream {
            stream_id: stream_id.to_string(),
            event: event.to_string(),
        });
    }

    /// Tells this connection's session, if it still has one, that the
    /// provider is gone.
    async fn on_disconnect(&self) {
        let Binding::Live { stream_id, .. } = &self.binding else {
            return;
        };
        if let Some(handle) = self.owned_session(stream_id) {
            let _ = handle.on_socket_closed().await;
        }
    }
}
