#![allow(dead_code)]

use base64::Engine;
use callbridge_server::registry::SessionRegistry;
use callbridge_server::session::{BridgeSettings, SessionDeps, WireCommand};
use callbridge_types::{BridgeEvent, CallState, MediaEnvelope, StartEnvelope, TenantConfig};
use callbridge_voice::codec;
use callbridge_voice::{
    ActionContext, ActionSink, BackendAudio, BackendCommand, BackendConnector, BackendHandle,
    BackendPeer, BackendSessionConfig, BoxFuture, SideAction, TemplatePromptBuilder, VoiceError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

/// One connection handed out by [`MockConnector`].
pub struct MockBackend {
    pub config: BackendSessionConfig,
    pub peer: BackendPeer,
}

/// Channel-backed AI backend: each connect yields a [`MockBackend`] the test
/// drives by hand.
pub struct MockConnector {
    connects: AtomicUsize,
    fail: bool,
    delay: Duration,
    backends: mpsc::UnboundedSender<MockBackend>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockBackend>) {
        Self::build(false, Duration::ZERO)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<MockBackend>) {
        Self::build(true, Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<MockBackend>) {
        Self::build(false, delay)
    }

    fn build(fail: bool, delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<MockBackend>) {
        let (backends, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                fail,
                delay,
                backends,
            }),
            rx,
        )
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl BackendConnector for MockConnector {
    fn connect(
        &self,
        config: BackendSessionConfig,
    ) -> BoxFuture<'_, Result<BackendHandle, VoiceError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(VoiceError::Connect("connection refused".to_string()));
            }
            let (handle, peer) = BackendHandle::pair(64);
            let _ = self.backends.send(MockBackend { config, peer });
            Ok(handle)
        })
    }
}

/// Records every dispatched action.
#[derive(Default)]
pub struct RecordingActionSink {
    pub seen: Mutex<Vec<(ActionContext, SideAction)>>,
}

impl ActionSink for RecordingActionSink {
    fn dispatch(
        &self,
        context: ActionContext,
        action: SideAction,
    ) -> BoxFuture<'_, Result<(), VoiceError>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push((context, action));
            Ok(())
        })
    }
}

pub fn settings() -> BridgeSettings {
    BridgeSettings {
        starting_timeout: Duration::from_secs(2),
        draining_grace: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(30),
        stall_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_secs(60),
        starting_buffer_frames: 8,
        session_queue_capacity: 64,
        outbound_queue_capacity: 64,
        barge_in_rms_threshold: 900.0,
        // Same rate as the wire so backend audio maps 1:1 onto wire samples.
        audio: BackendAudio::new(8_000).unwrap(),
    }
}

pub fn tenant() -> TenantConfig {
    TenantConfig {
        tenant_id: "acme".to_string(),
        assistant_name: "Ava".to_string(),
        voice: "alloy".to_string(),
        greeting: Some("Thanks for calling Acme".to_string()),
        context_ref: Some("biz-42".to_string()),
    }
}

pub fn start_envelope(stream_id: &str) -> StartEnvelope {
    StartEnvelope {
        call_id: format!("CA-{stream_id}"),
        stream_id: stream_id.to_string(),
        from_number: "+15550001111".to_string(),
        to_number: "+15550003333".to_string(),
    }
}

/// 20 ms of µ-law bytes, base64-encoded.
pub fn payload_of(byte: u8) -> String {
    base64::engine::general_purpose::STANDARD.encode([byte; 160])
}

/// Digital silence: RMS 0.
pub fn silence() -> String {
    payload_of(0xFF)
}

/// Full-scale tone, far above the barge-in threshold.
pub fn loud() -> String {
    payload_of(0x80)
}

pub fn media(stream_id: &str, payload: String, sequence_number: Option<u64>) -> MediaEnvelope {
    MediaEnvelope {
        stream_id: stream_id.to_string(),
        payload,
        sequence_number,
        timestamp: None,
    }
}

/// The backend-rate bytes the session forwards for a wire payload.
pub fn forwarded(settings: &BridgeSettings, payload: &str) -> Vec<u8> {
    settings.audio.to_backend(&codec::decode(payload).unwrap())
}

/// Backend PCM16 bytes for a constant-level response chunk.
pub fn assistant_pcm(level: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(level.to_le_bytes())
        .take(samples)
        .flatten()
        .collect()
}

/// The wire payload the session produces for [`assistant_pcm`] at 8 kHz.
pub fn assistant_wire_payload(level: i16, samples: usize) -> String {
    codec::encode(&codec::PcmChunk::new(vec![level; samples])).unwrap()
}

pub async fn next_command(peer: &mut BackendPeer) -> BackendCommand {
    tokio::time::timeout(WAIT, peer.commands.recv())
        .await
        .expect("timed out waiting for a backend command")
        .expect("backend command queue closed")
}

pub async fn next_wire(wire: &mut mpsc::Receiver<WireCommand>) -> WireCommand {
    tokio::time::timeout(WAIT, wire.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("outbound queue closed")
}

pub async fn next_backend(backends: &mut mpsc::UnboundedReceiver<MockBackend>) -> MockBackend {
    tokio::time::timeout(WAIT, backends.recv())
        .await
        .expect("timed out waiting for a backend connection")
        .expect("connector dropped")
}

/// Waits for the first event matching `pred`, skipping others.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<BridgeEvent>, pred: F) -> BridgeEvent
where
    F: Fn(&BridgeEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for bridge event")
}

pub async fn wait_for_state(
    events: &mut broadcast::Receiver<BridgeEvent>,
    stream_id: &str,
    state: CallState,
) {
    wait_for_event(events, |e| {
        matches!(e, BridgeEvent::StateChanged { stream_id: s, to, .. } if s == stream_id && *to == state)
    })
    .await;
}

/// Every state change already published for `stream_id`, in order.
pub fn drain_transitions(
    events: &mut broadcast::Receiver<BridgeEvent>,
    stream_id: &str,
) -> Vec<(CallState, CallState)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::StateChanged {
            stream_id: s,
            from,
            to,
        } = event
        {
            if s == stream_id {
                out.push((from, to));
            }
        }
    }
    out
}

/// Builds the collaborators a standalone session needs.
pub fn deps(
    connector: Arc<MockConnector>,
    registry: SessionRegistry,
    settings: BridgeSettings,
) -> (SessionDeps, broadcast::Receiver<BridgeEvent>, Arc<RecordingActionSink>) {
    let (events_tx, events) = broadcast::channel(256);
    let actions = Arc::new(RecordingActionSink::default());
    let deps = SessionDeps {
        connector,
        prompts: Arc::new(TemplatePromptBuilder),
        actions: actions.clone(),
        registry,
        events_tx,
        settings,
    };
    (deps, events, actions)
}
