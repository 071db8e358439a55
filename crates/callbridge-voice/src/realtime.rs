//! Realtime WebSocket AI backend.
//!
//! Speaks the JSON event protocol of realtime speech-to-speech APIs:
//! `session.update` on connect, `input_audio_buffer.append` for caller
//! audio, `response.cancel` on barge-in, and `response.*` /
//! `input_audio_buffer.speech_*` events on the way back.

use crate::actions::SideAction;
use crate::backend::{
    BackendCommand, BackendConnector, BackendEvent, BackendHandle, BackendPeer,
    BackendSessionConfig, DEFAULT_BACKEND_QUEUE_CAPACITY,
};
use crate::codec::BackendAudio;
use crate::config::BackendConfig;
use crate::error::VoiceError;
use crate::BoxFuture;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Function name the backend calls to hang up.
const END_CALL_TOOL: &str = "end_call";

/// Opens one realtime WebSocket per call.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    config: BackendConfig,
}

impl RealtimeConnector {
    /// # Errors
    ///
    /// Returns `VoiceError::Config` for an empty URL or a sample rate the
    /// codec cannot convert to.
    pub fn new(config: BackendConfig) -> Result<Self, VoiceError> {
        if config.url.trim().is_empty() {
            return Err(VoiceError::Config("backend url is empty".to_string()));
        }
        BackendAudio::new(config.sample_rate)
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self { config })
    }

    fn endpoint(&self) -> String {
        let sep = if self.config.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.config.url, sep, self.config.model)
    }

    async fn open(&self, session: BackendSessionConfig) -> Result<BackendHandle, VoiceError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| VoiceError::Config(format!("backend url: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| VoiceError::Config(format!("api key: {}", e)))?;
            request.headers_mut().insert("Authorization", auth);
        }
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (mut ws, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| VoiceError::Connect(format!("handshake timed out after {:?}", timeout)))?
                .map_err(|e| VoiceError::Connect(e.to_string()))?;

        for message in opening_messages(&session) {
            ws.send(Message::Text(message.to_string().into()))
                .await
                .map_err(|e| VoiceError::Connect(e.to_string()))?;
        }

        tracing::info!(
            tenant_id = %session.tenant_id,
            call_id = %session.call_id,
            model = %self.config.model,
            "realtime backend session opened"
        );

        let (handle, peer) = BackendHandle::pair(DEFAULT_BACKEND_QUEUE_CAPACITY);
        let task = tokio::spawn(run_transport(ws, peer, session.call_id));
        Ok(handle.with_task(task))
    }
}

impl BackendConnector for RealtimeConnector {
    fn connect(
        &self,
        config: BackendSessionConfig,
    ) -> BoxFuture<'_, Result<BackendHandle, VoiceError>> {
        Box::pin(self.open(config))
    }
}

/// Pumps commands out and events in until either side closes.
///
/// At most one parsed event waits for room in the event queue. While it
/// waits, the socket is not read but commands keep flowing.
async fn run_transport(mut ws: BackendSocket, mut peer: BackendPeer, call_id: String) {
    let mut pending: Option<BackendEvent> = None;
    loop {
        tokio::select! {
            command = peer.commands.recv() => {
                let Some(command) = command else {
                    let _ = ws.close(None).await;
                    break;
                };
                if command == BackendCommand::Close {
                    let _ = ws.close(None).await;
                    break;
                }
                for message in command_messages(&command) {
                    if let Err(e) = ws.send(Message::Text(message.to_string().into())).await {
                        tracing::warn!(call_id = %call_id, "realtime backend send failed: {}", e);
                        return;
                    }
                }
            }
            permit = peer.events.reserve(), if pending.is_some() => {
                let Ok(permit) = permit else {
                    break;
                };
                if let Some(event) = pending.take() {
                    permit.send(event);
                }
            }
            incoming = ws.next(), if pending.is_none() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        pending = parse_server_event(text.as_str());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(call_id = %call_id, ?frame, "realtime backend closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(call_id = %call_id, "realtime backend read failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

fn tool(name: &str, description: &str, properties: Value) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": {"type": "object", "properties": properties},
    })
}

/// Messages sent right after the handshake, before any caller audio.
pub(crate) fn opening_messages(session: &BackendSessionConfig) -> Vec<Value> {
    let mut messages = vec![json!({
        "type": "session.update",
        "session": {
            "instructions": session.instructions,
            "voice": session.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": {"type": "server_vad"},
            "tools": [
                tool("save_note", "Save a note for the business to follow up on.",
                    json!({"note": {"type": "string"}})),
                tool("create_lead", "Record a caller who wants to be contacted.",
                    json!({"name": {"type": "string"}, "phone": {"type": "string"}, "reason": {"type": "string"}})),
                tool(END_CALL_TOOL, "Hang up once the conversation is finished.", json!({})),
            ],
        },
    })];

    if let Some(greeting) = &session.greeting {
        messages.push(json!({
            "type": "response.create",
            "response": {"instructions": format!("Greet the caller by saying: {}", greeting)},
        }));
    }
    messages
}

/// Protocol messages for one session command.
pub(crate) fn command_messages(command: &BackendCommand) -> Vec<Value> {
    match command {
        BackendCommand::AppendAudio(pcm) => vec![json!({
            "type": "input_audio_buffer.append",
            "audio": B64.encode(pcm),
        })],
        BackendCommand::CancelResponse => vec![json!({"type": "response.cancel"})],
        BackendCommand::ActionResult { call_id, output } => vec![
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output.to_string(),
                },
            }),
            json!({"type": "response.create"}),
        ],
        BackendCommand::Close => Vec::new(),
    }
}

/// Maps one server event to a [`BackendEvent`]; uninteresting events are `None`.
pub(crate) fn parse_server_event(text: &str) -> Option<BackendEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Some(BackendEvent::Error {
                message: format!("unparseable backend event: {}", e),
                fatal: false,
            })
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

    match kind {
        "response.audio.delta" | "response.output_audio.delta" => {
            let delta = value.get("delta").and_then(Value::as_str)?;
            match B64.decode(delta) {
                Ok(pcm) => Some(BackendEvent::AudioDelta(pcm)),
                Err(e) => Some(BackendEvent::Error {
                    message: format!("audio delta is not base64: {}", e),
                    fatal: false,
                }),
            }
        }
        "response.created" => Some(BackendEvent::ResponseStarted),
        "response.done" => Some(BackendEvent::ResponseDone),
        "input_audio_buffer.speech_started" => Some(BackendEvent::SpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(BackendEvent::SpeechStopped),
        "response.function_call_arguments.done" => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or_default();
            if name == END_CALL_TOOL {
                return Some(BackendEvent::Hangup);
            }
            let call_id = value
                .get("call_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            // Arguments arrive as a JSON-encoded string.
            let arguments = match value.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            Some(BackendEvent::Action(SideAction {
                call_id,
                name: name.to_string(),
                arguments,
            }))
        }
        "error" => {
            let error = value.get("error").unwrap_or(&Value::Null);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend error")
                .to_string();
            let fatal = error.get("type").and_then(Value::as_str) == Some("server_error")
                || error.get("code").and_then(Value::as_str) == Some("session_expired");
            Some(BackendEvent::Error { message, fatal })
        }
        _ => None,
    }
}
