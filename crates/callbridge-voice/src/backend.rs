//! AI voice backend connection seam.
//!
//! A call session never touches the backend transport directly. It holds a
//! [`BackendHandle`]: an ordered command queue towards the backend and an
//! ordered event queue back from it. The transport task on the other side
//! holds the matching [`BackendPeer`]. When the peer goes away the event
//! queue closes, which is how a session observes a dropped connection.

use crate::actions::SideAction;
use crate::error::VoiceError;
use crate::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default depth of the command and event queues.
pub const DEFAULT_BACKEND_QUEUE_CAPACITY: usize = 256;

/// Everything the backend needs to open a session for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSessionConfig {
    pub tenant_id: String,
    pub call_id: String,
    /// System instructions from the prompt builder, treated as opaque.
    pub instructions: String,
    pub voice: String,
    /// Opening line the assistant speaks before the caller does.
    pub greeting: Option<String>,
    /// PCM16 sample rate of `AppendAudio` and `AudioDelta` payloads.
    pub sample_rate: u32,
}

/// Messages from a call session to its backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    /// Little-endian PCM16 caller audio at the backend rate.
    AppendAudio(Vec<u8>),
    /// Abort the response currently being generated.
    CancelResponse,
    /// Reply to a side-channel action so the backend can continue the turn.
    ActionResult {
        call_id: String,
        output: serde_json::Value,
    },
    /// Close the connection after flushing anything already queued.
    Close,
}

/// Messages from the backend to a call session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Little-endian PCM16 assistant audio at the backend rate.
    AudioDelta(Vec<u8>),
    /// A new response (assistant turn) began.
    ResponseStarted,
    /// The current response finished or was cancelled.
    ResponseDone,
    /// Server-side VAD heard the caller start speaking.
    SpeechStarted,
    /// Server-side VAD heard the caller stop speaking.
    SpeechStopped,
    /// A structured action for the business-data service.
    Action(SideAction),
    /// The assistant decided to end the call.
    Hangup,
    /// The backend reported an error. Fatal errors end the call.
    Error { message: String, fatal: bool },
}

/// Session-side end of a backend connection.
///
/// Dropping the handle aborts the transport task, so a backend connection
/// can never outlive the session that owns it.
#[derive(Debug)]
pub struct BackendHandle {
    commands: mpsc::Sender<BackendCommand>,
    events: mpsc::Receiver<BackendEvent>,
    task: Option<JoinHandle<()>>,
}

/// Transport-side end of a backend connection.
#[derive(Debug)]
pub struct BackendPeer {
    pub commands: mpsc::Receiver<BackendCommand>,
    pub events: mpsc::Sender<BackendEvent>,
}

impl BackendHandle {
    /// Creates a connected handle/peer pair with queues of `capacity`.
    pub fn pair(capacity: usize) -> (BackendHandle, BackendPeer) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (evt_tx, evt_rx) = mpsc::channel(capacity);
        (
            BackendHandle {
                commands: cmd_tx,
                events: evt_rx,
                task: None,
            },
            BackendPeer {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }

    /// Ties the transport task's lifetime to this handle.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Queues a command, preserving order with earlier commands.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Closed` if the transport has gone away.
    pub async fn send(&self, command: BackendCommand) -> Result<(), VoiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| VoiceError::Closed)
    }

    /// Queues a command only if there is room right now.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Backpressure` if the transport is not keeping up
    /// and `VoiceError::Closed` if it has gone away.
    pub fn try_send(&self, command: BackendCommand) -> Result<(), VoiceError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => VoiceError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => VoiceError::Closed,
        })
    }

    /// Waits for the next backend event. `None` means the connection is gone.
    pub async fn recv(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens backend connections, one per call.
pub trait BackendConnector: Send + Sync {
    /// Establishes a session-scoped backend connection.
    fn connect(&self, config: BackendSessionConfig)
        -> BoxFuture<'_, Result<BackendHandle, VoiceError>>;
}
