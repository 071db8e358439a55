//! Call bridge server library logic.
//!
//! The telephony provider opens one WebSocket per call on `/media-stream`.
//! The [`gateway`] resolves the dialled number to a tenant, spawns a
//! [`session::CallSession`] worker registered in the [`registry`], and relays
//! envelopes to it; the worker relays audio to and from the AI backend.

pub mod api_sessions;
pub mod background;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod resolver;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use callbridge_types::BridgeEvent;
use callbridge_voice::{ActionSink, BackendConnector, PromptBuilder};
use registry::SessionRegistry;
use resolver::TenantResolver;
use serde_json::{json, Value};
use session::{BridgeSettings, SessionDeps};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

/// Buffer size of the bridge event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dialled number to tenant lookup.
    pub resolver: Arc<dyn TenantResolver>,
    /// Live call sessions.
    pub registry: SessionRegistry,
    /// Opens one AI backend connection per call.
    pub connector: Arc<dyn BackendConnector>,
    /// Per-tenant backend instructions.
    pub prompts: Arc<dyn PromptBuilder>,
    /// Receives side-channel actions emitted by the backend.
    pub actions: Arc<dyn ActionSink>,
    /// Timeouts and queue bounds for call sessions.
    pub settings: BridgeSettings,
    /// Broadcast channel for bridge lifecycle and anomaly events.
    pub events_tx: broadcast::Sender<BridgeEvent>,
}

impl AppState {
    /// The collaborators handed to each new call session.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            connector: Arc::clone(&self.connector),
            prompts: Arc::clone(&self.prompts),
            actions: Arc::clone(&self.actions),
            registry: self.registry.clone(),
            events_tx: self.events_tx.clone(),
            settings: self.settings,
        }
    }

    /// Publishes a bridge event. Having no subscribers is not an error.
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(api_sessions::list_sessions_handler))
        .route("/media-stream", get(gateway::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
