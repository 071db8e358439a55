//! Read-only inspection of live call sessions.

use crate::AppState;
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;

/// Lists live sessions with their state, oldest first.
pub async fn list_sessions_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let sessions = state.registry.snapshot();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}
