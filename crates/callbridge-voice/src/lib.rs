//! Voice plumbing for the call bridge.
//!
//! - [`codec`]: G.711 µ-law wire audio to PCM16 and back, integer-ratio
//!   resampling to the AI backend's rate, and frame energy for barge-in.
//! - [`backend`]: the channel-based handle a call session uses to talk to
//!   its AI voice backend, and the [`BackendConnector`] seam.
//! - [`realtime`]: the WebSocket realtime backend implementation.
//! - [`prompt`] and [`actions`]: collaborator seams for per-tenant
//!   instructions and for side-channel actions emitted by the backend.

pub mod actions;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod prompt;
pub mod realtime;

pub use actions::{ActionContext, ActionSink, LoggingActionSink, SideAction, WebhookActionSink};
pub use backend::{
    BackendCommand, BackendConnector, BackendEvent, BackendHandle, BackendPeer,
    BackendSessionConfig,
};
pub use codec::{BackendAudio, CodecError, PcmChunk};
pub use config::BackendConfig;
pub use error::VoiceError;
pub use prompt::{PromptBuilder, TemplatePromptBuilder};
pub use realtime::RealtimeConnector;

/// Boxed future returned by the collaborator traits in this crate.
pub type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;
