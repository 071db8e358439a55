//! Call Session: one worker task per live call.
//!
//! The worker owns every piece of per-call state. The gateway talks to it only
//! through [`SessionHandle`], which feeds a single ordered inbound queue, and
//! the AI backend talks to it only through its [`BackendHandle`]. Nothing in
//! here is shared with other calls except the [`SessionRegistry`] entry.
//!
//! Lifecycle: `Starting -> Active -> Draining -> Closed`. `Starting` may skip
//! straight to `Draining` when the backend never comes up.

use crate::registry::SessionRegistry;
use callbridge_types::{
    BridgeEvent, CallState, MediaEnvelope, OutboundFrame, StartEnvelope, TenantConfig,
};
use callbridge_voice::codec::{self, BackendAudio, PcmChunk, MAX_FRAME_SAMPLES};
use callbridge_voice::{
    ActionContext, ActionSink, BackendCommand, BackendConnector, BackendEvent, BackendHandle,
    BackendSessionConfig, PromptBuilder, SideAction, VoiceError,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// Runtime tuning shared by every call session.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Prompt building plus backend connect must finish within this window.
    pub starting_timeout: Duration,
    /// Upper bound on flushing backend output once a call is draining.
    pub draining_grace: Duration,
    /// An active call with no inbound media for this long is closed.
    pub idle_timeout: Duration,
    /// Longest the worker waits on a full backend or provider queue before
    /// giving up on that peer.
    pub stall_timeout: Duration,
    pub sweep_interval: Duration,
    /// Media frames held while the backend connects.
    pub starting_buffer_frames: usize,
    pub session_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    /// RMS energy at or above which a caller frame is treated as speech.
    pub barge_in_rms_threshold: f64,
    /// Wire <-> backend sample-rate conversion.
    pub audio: BackendAudio,
}

/// Inbound work for a session, processed strictly in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Media(MediaEnvelope),
    /// The provider reached a playback marker.
    Mark(String),
    Stop,
    /// The provider's connection went away without a `stop`.
    SocketClosed,
}

/// Outbound work for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    Frame(OutboundFrame),
    /// Close the provider connection once everything before it is written.
    Close,
}

/// Published state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: CallState,
    /// When the session entered `state`.
    pub since: Instant,
}

/// When the worker last finished a unit of work, readable without locking.
#[derive(Debug)]
struct Progress {
    epoch: Instant,
    elapsed_ms: AtomicU64,
}

impl Progress {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, at: Instant) {
        let ms = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.elapsed_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.epoch + Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

/// The session behind a handle no longer accepts input.
#[derive(Debug, Error)]
#[error("session for stream {0} is no longer accepting input")]
pub struct SessionClosed(pub String);

/// Collaborators a session needs, cloned from the application state.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn BackendConnector>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub actions: Arc<dyn ActionSink>,
    pub registry: SessionRegistry,
    pub events_tx: broadcast::Sender<BridgeEvent>,
    pub settings: BridgeSettings,
}

impl SessionDeps {
    fn emit(&self, event: BridgeEvent) {
        // No subscribers is the normal case outside tests.
        let _ = self.events_tx.send(event);
    }
}

/// Cheap, cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    stream_id: String,
    session_id: Uuid,
    call_id: String,
    tenant_id: String,
    created_at: DateTime<Utc>,
    inbox: mpsc::Sender<SessionInput>,
    status: watch::Receiver<SessionStatus>,
    shutdown: Arc<Notify>,
    progress: Arc<Progress>,
}

impl SessionHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Unique per session, even when a stream id is reused.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// `false` once the worker task has exited, cleanly or not.
    pub fn worker_alive(&self) -> bool {
        self.status.has_changed().is_ok()
    }

    /// Last time the worker got back to its event loop. A worker blocked on
    /// a peer stops advancing this.
    pub fn last_progress(&self) -> Instant {
        self.progress.last()
    }

    /// Hands one caller audio envelope to the session.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has already closed.
    pub async fn on_media(&self, media: MediaEnvelope) -> Result<(), SessionClosed> {
        self.deliver(SessionInput::Media(media)).await
    }

    /// Tells the session the provider ended the stream.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has already closed.
    pub async fn on_stop(&self) -> Result<(), SessionClosed> {
        self.deliver(SessionInput::Stop).await
    }

    /// Reports that playback reached a marker the session sent earlier.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has already closed.
    pub async fn on_mark(&self, name: String) -> Result<(), SessionClosed> {
        self.deliver(SessionInput::Mark(name)).await
    }

    /// Reports that the provider connection dropped without a `stop`.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has already closed.
    pub async fn on_socket_closed(&self) -> Result<(), SessionClosed> {
        self.deliver(SessionInput::SocketClosed).await
    }

    /// Asks the worker to end the call now, skipping any remaining grace.
    pub fn force_close(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once the session is `Closed` or its worker is gone.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.state == CallState::Closed).await;
    }

    async fn deliver(&self, input: SessionInput) -> Result<(), SessionClosed> {
        self.inbox
            .send(input)
            .await
            .map_err(|_| SessionClosed(self.stream_id.clone()))
    }

    /// A handle with no worker behind it, plus the worker-side ends.
    #[cfg(test)]
    pub(crate) fn detached(
        stream_id: &str,
    ) -> (
        SessionHandle,
        watch::Sender<SessionStatus>,
        mpsc::Receiver<SessionInput>,
    ) {
        let (inbox, inbox_rx) = mpsc::channel(8);
        let (status_tx, status) = watch::channel(SessionStatus {
            state: CallState::Starting,
            since: Instant::now(),
        });
        let handle = SessionHandle {
            stream_id: stream_id.to_string(),
            session_id: Uuid::new_v4(),
            call_id: format!("call-{stream_id}"),
            tenant_id: "acme".to_string(),
            created_at: Utc::now(),
            inbox,
            status,
            shutdown: Arc::new(Notify::new()),
            progress: Arc::new(Progress::new(Instant::now())),
        };
        (handle, status_tx, inbox_rx)
    }

    #[cfg(test)]
    pub(crate) fn record_progress_at(&self, at: Instant) {
        self.progress.record(at);
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    ProviderStop,
    SocketClosed,
    Idle,
    BackendHangup,
    BackendLost,
    BackendError,
    /// The backend stopped taking commands for longer than the stall timeout.
    BackendStalled,
    /// The provider connection stopped draining outbound frames.
    WireStalled,
    StartFailed,
    ForceClosed,
}

impl EndReason {
    fn as_str(self) -> &'static str {
        match self {
            EndReason::ProviderStop => "provider_stop",
            EndReason::SocketClosed => "socket_closed",
            EndReason::Idle => "idle_timeout",
            EndReason::BackendHangup => "backend_hangup",
            EndReason::BackendLost => "backend_lost",
            EndReason::BackendError => "backend_error",
            EndReason::BackendStalled => "backend_stalled",
            EndReason::WireStalled => "wire_stalled",
            EndReason::StartFailed => "start_failed",
            EndReason::ForceClosed => "force_closed",
        }
    }

    /// The provider still thinks the call is up and must be told to hang up.
    fn hangs_up_wire(self) -> bool {
        !matches!(
            self,
            EndReason::ProviderStop | EndReason::SocketClosed | EndReason::WireStalled
        )
    }

    /// The backend connection is still worth a graceful close.
    fn backend_usable(self) -> bool {
        !matches!(
            self,
            EndReason::BackendLost | EndReason::BackendError | EndReason::BackendStalled
        )
    }
}

/// Outcome of a queue send that may not wait forever.
enum Delivery {
    Sent,
    Closed,
    Stalled,
    Shutdown,
}

/// Awaits `send`, giving up after `limit` or on a shutdown request.
async fn deliver_bounded<E>(
    send: impl Future<Output = Result<(), E>>,
    shutdown: &Notify,
    limit: Duration,
) -> Delivery {
    tokio::select! {
        result = tokio::time::timeout(limit, send) => match result {
            Ok(Ok(())) => Delivery::Sent,
            Ok(Err(_)) => Delivery::Closed,
            Err(_) => Delivery::Stalled,
        },
        () = shutdown.notified() => Delivery::Shutdown,
    }
}

/// The per-call worker. Consumed by [`CallSession::run`].
pub struct CallSession {
    stream_id: String,
    session_id: Uuid,
    call_id: String,
    tenant: TenantConfig,
    started_at: Instant,
    state: CallState,
    deps: SessionDeps,
    inbox: mpsc::Receiver<SessionInput>,
    status: watch::Sender<SessionStatus>,
    shutdown: Arc<Notify>,
    wire: mpsc::Sender<WireCommand>,
    wire_open: bool,
    progress: Arc<Progress>,
    /// Set by a send that gave up; the event loop ends the call with it.
    pending_end: Option<EndReason>,
    /// First audio frame the backend queue refused since it last accepted one.
    backend_full_since: Option<Instant>,
    starting_buffer: VecDeque<MediaEnvelope>,
    last_sequence: Option<u64>,
    last_media: Instant,
    // Turn-taking.
    responding: bool,
    suppress_output: bool,
    response_audio: bool,
    pending_marks: VecDeque<String>,
    responses: u64,
    /// Backend samples left over from the last delta's downsampling.
    carry: Vec<i16>,
}

impl CallSession {
    /// Builds a session in `Starting` for an accepted `start` envelope.
    ///
    /// Nothing runs until [`CallSession::run`] is spawned; the handle should
    /// be registered first so the gateway can route media to it.
    pub fn new(
        start: &StartEnvelope,
        tenant: TenantConfig,
        wire: mpsc::Sender<WireCommand>,
        deps: SessionDeps,
    ) -> (CallSession, SessionHandle) {
        let now = Instant::now();
        let (inbox_tx, inbox) = mpsc::channel(deps.settings.session_queue_capacity);
        let (status, status_rx) = watch::channel(SessionStatus {
            state: CallState::Starting,
            since: now,
        });
        let shutdown = Arc::new(Notify::new());
        let progress = Arc::new(Progress::new(now));
        let session_id = Uuid::new_v4();

        let handle = SessionHandle {
            stream_id: start.stream_id.clone(),
            session_id,
            call_id: start.call_id.clone(),
            tenant_id: tenant.tenant_id.clone(),
            created_at: Utc::now(),
            inbox: inbox_tx,
            status: status_rx,
            shutdown: Arc::clone(&shutdown),
            progress: Arc::clone(&progress),
        };

        let session = CallSession {
            stream_id: start.stream_id.clone(),
            session_id,
            call_id: start.call_id.clone(),
            tenant,
            started_at: now,
            state: CallState::Starting,
            deps,
            inbox,
            status,
            shutdown,
            wire,
            wire_open: true,
            progress,
            pending_end: None,
            backend_full_since: None,
            starting_buffer: VecDeque::new(),
            last_sequence: None,
            last_media: now,
            responding: false,
            suppress_output: false,
            response_audio: false,
            pending_marks: VecDeque::new(),
            responses: 0,
            carry: Vec::new(),
        };
        (session, handle)
    }

    /// Drives the call from `Starting` to `Closed`.
    pub async fn run(mut self) {
        tracing::info!(
            stream_id = %self.stream_id,
            call_id = %self.call_id,
            tenant_id = %self.tenant.tenant_id,
            "call session starting"
        );

        let (backend, reason) = match self.establish().await {
            Ok(mut backend) => {
                self.transition(CallState::Active);
                let reason = self.run_active(&mut backend).await;
                (reason.backend_usable().then_some(backend), reason)
            }
            Err(reason) => (None, reason),
        };

        self.drain(backend, reason).await;
        self.finish(reason).await;
    }

    /// `Starting`: build the prompt and connect, buffering early media.
    async fn establish(&mut self) -> Result<BackendHandle, EndReason> {
        let prompts = Arc::clone(&self.deps.prompts);
        let connector = Arc::clone(&self.deps.connector);
        let tenant = self.tenant.clone();
        let call_id = self.call_id.clone();
        let sample_rate = self.deps.settings.audio.sample_rate();

        let connect = async move {
            let instructions = prompts.build(&tenant).await?;
            connector
                .connect(BackendSessionConfig {
                    tenant_id: tenant.tenant_id.clone(),
                    call_id,
                    instructions,
                    voice: tenant.voice.clone(),
                    greeting: tenant.greeting.clone(),
                    sample_rate,
                })
                .await
        };
        tokio::pin!(connect);
        let deadline = tokio::time::sleep(self.deps.settings.starting_timeout);
        tokio::pin!(deadline);

        loop {
            self.progress.record(Instant::now());
            tokio::select! {
                result = &mut connect => {
                    return result.map_err(|e| {
                        tracing::warn!(
                            stream_id = %self.stream_id,
                            error = %e,
                            "AI backend connection failed"
                        );
                        EndReason::StartFailed
                    });
                }
                () = &mut deadline => {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        timeout_ms = self.deps.settings.starting_timeout.as_millis() as u64,
                        "AI backend did not connect in time"
                    );
                    return Err(EndReason::StartFailed);
                }
                () = self.shutdown.notified() => return Err(EndReason::ForceClosed),
                input = self.inbox.recv() => match input {
                    Some(SessionInput::Media(media)) => self.buffer_starting(media),
                    Some(SessionInput::Mark(_)) => {}
                    Some(SessionInput::Stop) => return Err(EndReason::ProviderStop),
                    Some(SessionInput::SocketClosed) | None => return Err(EndReason::SocketClosed),
                },
            }
        }
    }

    fn buffer_starting(&mut self, media: MediaEnvelope) {
        if self.starting_buffer.len() >= self.deps.settings.starting_buffer_frames {
            tracing::warn!(
                stream_id = %self.stream_id,
                capacity = self.deps.settings.starting_buffer_frames,
                "starting buffer full, dropping media frame"
            );
            self.deps.emit(BridgeEvent::FrameDropped {
                stream_id: self.stream_id.clone(),
                reason: "starting_buffer_full".to_string(),
            });
            return;
        }
        self.starting_buffer.push_back(media);
    }

    /// `Active`: relay audio both ways until something ends the call.
    async fn run_active(&mut self, backend: &mut BackendHandle) -> EndReason {
        self.last_media = Instant::now();

        let buffered = std::mem::take(&mut self.starting_buffer);
        if !buffered.is_empty() {
            tracing::debug!(
                stream_id = %self.stream_id,
                count = buffered.len(),
                "forwarding media buffered while starting"
            );
        }
        for media in buffered {
            if let Err(reason) = self.handle_media(backend, media).await {
                return reason;
            }
            if let Some(reason) = self.pending_end.take() {
                return reason;
            }
        }

        loop {
            self.progress.record(Instant::now());
            if let Some(reason) = self.pending_end.take() {
                return reason;
            }
            let idle_deadline = self.last_media + self.deps.settings.idle_timeout;
            tokio::select! {
                () = self.shutdown.notified() => return EndReason::ForceClosed,
                input = self.inbox.recv() => match input {
                    Some(SessionInput::Media(media)) => {
                        if let Err(reason) = self.handle_media(backend, media).await {
                            return reason;
                        }
                    }
                    Some(SessionInput::Mark(name)) => self.handle_mark(&name),
                    Some(SessionInput::Stop) => return EndReason::ProviderStop,
                    Some(SessionInput::SocketClosed) | None => return EndReason::SocketClosed,
                },
                event = backend.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_backend_event(backend, event).await {
                            return reason;
                        }
                    }
                    None => {
                        tracing::warn!(stream_id = %self.stream_id, "AI backend connection lost");
                        return EndReason::BackendLost;
                    }
                },
                () = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        idle_secs = self.deps.settings.idle_timeout.as_secs(),
                        "no media from provider, closing idle call"
                    );
                    return EndReason::Idle;
                }
            }
        }
    }

    async fn handle_media(
        &mut self,
        backend: &BackendHandle,
        media: MediaEnvelope,
    ) -> Result<(), EndReason> {
        self.last_media = Instant::now();
        self.check_sequence(media.sequence_number);

        let chunk = match codec::decode(&media.payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    error = %e,
                    "dropping undecodable media frame"
                );
                self.deps.emit(BridgeEvent::FrameDropped {
                    stream_id: self.stream_id.clone(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        // Caller audio always wins: cancel before forwarding.
        if chunk.rms() >= self.deps.settings.barge_in_rms_threshold && self.assistant_audible() {
            self.interrupt(backend).await?;
        }

        let audio = self.deps.settings.audio.to_backend(&chunk);
        self.append_audio(backend, audio)
    }

    /// Caller audio never waits on the backend. A full queue drops the
    /// frame; a queue that stays full past the stall timeout ends the call.
    fn append_audio(&mut self, backend: &BackendHandle, audio: Vec<u8>) -> Result<(), EndReason> {
        match backend.try_send(BackendCommand::AppendAudio(audio)) {
            Ok(()) => {
                self.backend_full_since = None;
                Ok(())
            }
            Err(VoiceError::Backpressure) => {
                let now = Instant::now();
                let since = *self.backend_full_since.get_or_insert_with(|| {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        "AI backend queue full, dropping caller audio"
                    );
                    now
                });
                self.deps.emit(BridgeEvent::FrameDropped {
                    stream_id: self.stream_id.clone(),
                    reason: "backend_backpressure".to_string(),
                });
                if now.saturating_duration_since(since) >= self.deps.settings.stall_timeout {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        stalled_ms = now.saturating_duration_since(since).as_millis() as u64,
                        "AI backend stopped accepting audio"
                    );
                    return Err(EndReason::BackendStalled);
                }
                Ok(())
            }
            Err(_) => Err(EndReason::BackendLost),
        }
    }

    /// Sends a command that must not be dropped, within the stall timeout.
    async fn send_control(
        &self,
        backend: &BackendHandle,
        command: BackendCommand,
    ) -> Result<(), EndReason> {
        let limit = self.deps.settings.stall_timeout;
        match deliver_bounded(backend.send(command), &self.shutdown, limit).await {
            Delivery::Sent => Ok(()),
            Delivery::Closed => Err(EndReason::BackendLost),
            Delivery::Stalled => {
                tracing::warn!(stream_id = %self.stream_id, "AI backend stopped accepting commands");
                Err(EndReason::BackendStalled)
            }
            Delivery::Shutdown => Err(EndReason::ForceClosed),
        }
    }

    /// Sequence numbers are only checked, never used to reorder.
    fn check_sequence(&mut self, sequence: Option<u64>) {
        let Some(actual) = sequence else {
            return;
        };
        if let Some(last) = self.last_sequence {
            let expected = last.saturating_add(1);
            if actual != expected {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    expected,
                    actual,
                    "media sequence gap"
                );
                self.deps.emit(BridgeEvent::SequenceGap {
                    stream_id: self.stream_id.clone(),
                    expected,
                    actual,
                });
            }
        }
        self.last_sequence = Some(actual);
    }

    /// Assistant audio is being generated or is still queued at the provider.
    fn assistant_audible(&self) -> bool {
        self.responding || !self.pending_marks.is_empty()
    }

    async fn interrupt(&mut self, backend: &BackendHandle) -> Result<(), EndReason> {
        if self.responding {
            self.send_control(backend, BackendCommand::CancelResponse).await?;
            self.suppress_output = true;
        }
        self.responding = false;
        self.response_audio = false;
        self.pending_marks.clear();
        self.carry.clear();
        self.send_wire(OutboundFrame::Clear {
            stream_id: self.stream_id.clone(),
        })
        .await;

        tracing::info!(stream_id = %self.stream_id, "caller barged in, assistant output cancelled");
        self.deps.emit(BridgeEvent::Interrupted {
            stream_id: self.stream_id.clone(),
        });
        Ok(())
    }

    fn handle_mark(&mut self, name: &str) {
        match self.pending_marks.iter().position(|m| m == name) {
            Some(pos) => {
                self.pending_marks.drain(..=pos);
                tracing::debug!(stream_id = %self.stream_id, mark = name, "playback reached mark");
            }
            None => {
                tracing::debug!(stream_id = %self.stream_id, mark = name, "ignoring stale mark");
            }
        }
    }

    async fn handle_backend_event(
        &mut self,
        backend: &BackendHandle,
        event: BackendEvent,
    ) -> Option<EndReason> {
        match event {
            BackendEvent::AudioDelta(bytes) => self.forward_audio(&bytes).await,
            BackendEvent::ResponseStarted => {
                self.responding = true;
                self.suppress_output = false;
                self.response_audio = false;
            }
            BackendEvent::ResponseDone => self.finish_response().await,
            BackendEvent::SpeechStarted => {
                if self.assistant_audible() {
                    if let Err(reason) = self.interrupt(backend).await {
                        return Some(reason);
                    }
                }
            }
            BackendEvent::SpeechStopped => {
                tracing::debug!(stream_id = %self.stream_id, "caller stopped speaking");
            }
            BackendEvent::Action(action) => {
                if let Err(reason) = self.dispatch_action(backend, action).await {
                    return Some(reason);
                }
            }
            BackendEvent::Hangup => {
                tracing::info!(stream_id = %self.stream_id, "assistant ended the call");
                return Some(EndReason::BackendHangup);
            }
            BackendEvent::Error { message, fatal } => {
                tracing::warn!(stream_id = %self.stream_id, fatal, %message, "AI backend error");
                if fatal {
                    return Some(EndReason::BackendError);
                }
            }
        }
        None
    }

    /// Converts one backend delta to wire frames, in order.
    async fn forward_audio(&mut self, bytes: &[u8]) {
        if self.suppress_output {
            tracing::debug!(stream_id = %self.stream_id, "discarding audio from cancelled response");
            return;
        }
        let audio = self.deps.settings.audio;
        let samples = match audio.parse_backend(bytes) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(stream_id = %self.stream_id, error = %e, "dropping malformed backend audio");
                self.deps.emit(BridgeEvent::FrameDropped {
                    stream_id: self.stream_id.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.responding = true;
        self.carry.extend_from_slice(&samples);
        let (wire_samples, consumed) = audio.downsample(&self.carry);
        self.carry.drain(..consumed);

        for piece in wire_samples.chunks(MAX_FRAME_SAMPLES) {
            match codec::encode(&PcmChunk::new(piece.to_vec())) {
                Ok(payload) => {
                    self.response_audio = true;
                    self.send_wire(OutboundFrame::Media {
                        stream_id: self.stream_id.clone(),
                        payload,
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(stream_id = %self.stream_id, error = %e, "failed to encode assistant audio");
                }
            }
        }
    }

    /// Marks the end of a response so playback progress can be tracked.
    async fn finish_response(&mut self) {
        self.responding = false;
        self.carry.clear();
        if self.suppress_output {
            self.suppress_output = false;
            return;
        }
        if !std::mem::take(&mut self.response_audio) {
            return;
        }
        self.responses += 1;
        let name = format!("response-{}", self.responses);
        self.pending_marks.push_back(name.clone());
        self.send_wire(OutboundFrame::Mark {
            stream_id: self.stream_id.clone(),
            name,
        })
        .await;
    }

    /// Hands an action to the sink off the audio path and acknowledges it.
    async fn dispatch_action(
        &mut self,
        backend: &BackendHandle,
        action: SideAction,
    ) -> Result<(), EndReason> {
        let context = ActionContext {
            tenant_id: self.tenant.tenant_id.clone(),
            call_id: self.call_id.clone(),
            stream_id: self.stream_id.clone(),
        };
        let reply_to = action.call_id.clone();
        let name = action.name.clone();

        let sink = Arc::clone(&self.deps.actions);
        let stream_id = self.stream_id.clone();
        let action_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.dispatch(context, action).await {
                tracing::warn!(
                    stream_id = %stream_id,
                    action = %action_name,
                    error = %e,
                    "side-channel action delivery failed"
                );
            }
        });

        tracing::info!(stream_id = %self.stream_id, action = %name, "dispatched side-channel action");
        self.deps.emit(BridgeEvent::ActionDispatched {
            stream_id: self.stream_id.clone(),
            name,
        });

        self.send_control(
            backend,
            BackendCommand::ActionResult {
                call_id: reply_to,
                output: json!({ "status": "queued" }),
            },
        )
        .await
    }

    /// `Draining`: accept no new audio, let in-flight backend output flush
    /// within the grace period, then close the backend.
    async fn drain(&mut self, backend: Option<BackendHandle>, reason: EndReason) {
        self.transition(CallState::Draining);
        if reason == EndReason::SocketClosed {
            self.wire_open = false;
        }
        let deadline = Instant::now() + self.deps.settings.draining_grace;

        if let Some(mut backend) = backend {
            if self.responding && self.wire_open {
                self.flush_backend(&mut backend, deadline).await;
            }
            self.close_backend(&mut backend, deadline).await;
            // Dropping the handle aborts the transport if it is still running.
        }

        if reason.hangs_up_wire() {
            self.send_wire(OutboundFrame::Stop {
                stream_id: self.stream_id.clone(),
            })
            .await;
        }
    }

    async fn flush_backend(&mut self, backend: &mut BackendHandle, deadline: Instant) {
        loop {
            self.progress.record(Instant::now());
            if !self.wire_open || self.pending_end.is_some() {
                break;
            }
            tokio::select! {
                event = backend.recv() => match event {
                    Some(BackendEvent::AudioDelta(bytes)) => self.forward_audio(&bytes).await,
                    Some(BackendEvent::ResponseDone) | None => break,
                    Some(_) => {}
                },
                input = self.inbox.recv() => match input {
                    Some(SessionInput::SocketClosed) | None => {
                        self.wire_open = false;
                        break;
                    }
                    // No new audio is accepted while draining.
                    Some(_) => {}
                },
                () = self.shutdown.notified() => break,
                () = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(stream_id = %self.stream_id, "drain grace expired with output pending");
                    break;
                }
            }
        }
    }

    async fn close_backend(&mut self, backend: &mut BackendHandle, deadline: Instant) {
        let closing = async {
            if backend.send(BackendCommand::Close).await.is_ok() {
                while backend.recv().await.is_some() {}
            }
        };
        tokio::select! {
            () = closing => {}
            () = self.shutdown.notified() => {}
            () = tokio::time::sleep_until(deadline) => {
                tracing::debug!(stream_id = %self.stream_id, "AI backend did not close within grace");
            }
        }
    }

    /// `Closed`: release the connection and the registry entry. Runs once.
    async fn finish(&mut self, reason: EndReason) {
        if self.state.is_terminal() {
            return;
        }
        if self.wire_open {
            let limit = self.deps.settings.stall_timeout;
            if let Delivery::Stalled =
                deliver_bounded(self.wire.send(WireCommand::Close), &self.shutdown, limit).await
            {
                tracing::debug!(stream_id = %self.stream_id, "provider connection did not take close");
            }
            self.wire_open = false;
        }
        self.deps.registry.remove(&self.stream_id, self.session_id);
        self.inbox.close();
        self.transition(CallState::Closed);
        tracing::info!(
            stream_id = %self.stream_id,
            call_id = %self.call_id,
            reason = reason.as_str(),
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            "call session closed"
        );
    }

    /// Queues a frame for the provider. A writer that stops draining is
    /// treated as a dead connection; a shutdown request ends the call.
    async fn send_wire(&mut self, frame: OutboundFrame) {
        if !self.wire_open {
            return;
        }
        let limit = self.deps.settings.stall_timeout;
        match deliver_bounded(self.wire.send(WireCommand::Frame(frame)), &self.shutdown, limit).await
        {
            Delivery::Sent => {}
            Delivery::Closed => {
                tracing::debug!(stream_id = %self.stream_id, "provider connection writer is gone");
                self.wire_open = false;
            }
            Delivery::Stalled => {
                tracing::warn!(stream_id = %self.stream_id, "provider connection stopped draining");
                self.wire_open = false;
                self.pending_end.get_or_insert(EndReason::WireStalled);
            }
            Delivery::Shutdown => {
                self.pending_end.get_or_insert(EndReason::ForceClosed);
            }
        }
    }

    fn transition(&mut self, next: CallState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            tracing::warn!(
                stream_id = %self.stream_id,
                from = %from,
                to = %next,
                "ignoring invalid session transition"
            );
            return;
        }
        self.state = next;
        tracing::debug!(stream_id = %self.stream_id, from = %from, to = %next, "session state changed");
        self.deps.emit(BridgeEvent::StateChanged {
            stream_id: self.stream_id.clone(),
            from,
            to: next,
        });
        // Published last so watchers of `Closed` see every event before it.
        self.status.send_replace(SessionStatus {
            state: next,
            since: Instant::now(),
        });
    }
}
