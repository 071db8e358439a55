//! Shared types for the call bridge.
//!
//! This crate defines the telephony wire protocol (inbound
//! [`StreamEnvelope`] messages and outbound [`OutboundFrame`] messages), the
//! per-call lifecycle [`CallState`], the resolved [`TenantConfig`], and the
//! [`BridgeEvent`] stream that the server broadcasts for observability.
//!
//! Nothing here performs I/O. Every other crate in the workspace depends on
//! this one for cross-cutting definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

mod envelope;
mod tenant;

pub use envelope::{MediaEnvelope, OutboundFrame, StartEnvelope, StreamEnvelope};
pub use tenant::TenantConfig;

/// Lifecycle state of a single bridged call.
///
/// Transitions are strictly forward:
/// `Starting -> Active -> Draining -> Closed`, with `Starting -> Draining`
/// allowed when the backend never comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Tenant resolved, AI backend connection being established.
    Starting,
    /// Audio flowing in both directions.
    Active,
    /// No new caller audio accepted; in-flight backend output is flushing.
    Draining,
    /// Terminal. Backend closed, registry entry evicted.
    Closed,
}

impl CallState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Active)
                | (Self::Starting, Self::Draining)
                | (Self::Active, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }

    /// Returns `true` for [`CallState::Closed`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns the string label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable bridge events.
///
/// Broadcast by the server on every session lifecycle change and every
/// recovered anomaly. Receivers that lag simply miss events; emitting never
/// blocks a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A `Start` resolved to a tenant and a session was registered.
    SessionCreated {
        stream_id: String,
        call_id: String,
        tenant_id: String,
    },
    /// A `Start` was accepted on the wire but no session was created.
    SessionDeclined {
        stream_id: String,
        to_number: String,
        reason: String,
    },
    /// A session moved between lifecycle states.
    StateChanged {
        stream_id: String,
        from: CallState,
        to: CallState,
    },
    /// A `Start` arrived for a stream id that already has a live session.
    DuplicateStart { stream_id: String },
    /// An envelope referenced a stream id with no live session.
    UnknownStream { stream_id: String, event: String },
    /// A single inbound frame was discarded; the call continues.
    FrameDropped { stream_id: String, reason: String },
    /// Media sequence numbers were not contiguous.
    SequenceGap {
        stream_id: String,
        expected: u64,
        actual: u64,
    },
    /// Caller speech cancelled in-progress backend output.
    Interrupted { stream_id: String },
    /// A side-channel action from the backend was handed off.
    ActionDispatched { stream_id: String, name: String },
    /// The periodic sweep force-closed a session that failed to close itself.
    SessionEvicted { stream_id: String, state: CallState },
}

impl BridgeEvent {
    /// Returns the stream id this event concerns.
    pub fn stream_id(&self) -> &str {
        match self {
            Self::SessionCreated { stream_id, .. }
            | Self::SessionDeclined { stream_id, .. }
            | Self::StateChanged { stream_id, .. }
            | Self::DuplicateStart { stream_id }
            | Self::UnknownStream { stream_id, .. }
            | Self::FrameDropped { stream_id, .. }
            | Self::SequenceGap { stream_id, .. }
            | Self::Interrupted { stream_id }
            | Self::ActionDispatched { stream_id, .. }
            | Self::SessionEvicted { stream_id, .. } => stream_id,
        }
    }
}
