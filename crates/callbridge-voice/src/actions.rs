//! Side-channel actions emitted by the AI backend.
//!
//! Actions such as "save note" or "create lead" belong to the business-data
//! service. The bridge only forwards them; it never interprets arguments.

use crate::error::VoiceError;
use crate::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One structured action requested by the backend mid-call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideAction {
    /// Backend-assigned id used to reply with the result.
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Which call an action came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub tenant_id: String,
    /// Telephony call id (not the backend's function-call id).
    pub call_id: String,
    pub stream_id: String,
}

/// Receives side-channel actions.
pub trait ActionSink: Send + Sync {
    fn dispatch(
        &self,
        context: ActionContext,
        action: SideAction,
    ) -> BoxFuture<'_, Result<(), VoiceError>>;
}

/// Records actions in the log only.
#[derive(Debug, Clone, Default)]
pub struct LoggingActionSink;

impl ActionSink for LoggingActionSink {
    fn dispatch(
        &self,
        context: ActionContext,
        action: SideAction,
    ) -> BoxFuture<'_, Result<(), VoiceError>> {
        Box::pin(async move {
            tracing::info!(
                tenant_id = %context.tenant_id,
                call_id = %context.call_id,
                stream_id = %context.stream_id,
                action = %action.name,
                arguments = %action.arguments,
                "side-channel action (no webhook configured)"
            );
            Ok(())
        })
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    #[serde(flatten)]
    context: &'a ActionContext,
    action: &'a SideAction,
}

/// POSTs each action as JSON to the business-data service.
#[derive(Debug, Clone)]
pub struct WebhookActionSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookActionSink {
    /// # Errors
    ///
    /// Returns `VoiceError::Config` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Config(format!("webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ActionSink for WebhookActionSink {
    fn dispatch(
        &self,
        context: ActionContext,
        action: SideAction,
    ) -> BoxFuture<'_, Result<(), VoiceError>> {
        Box::pin(async move {
            let body = WebhookBody {
                context: &context,
                action: &action,
            };
            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| VoiceError::Action(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(VoiceError::Action(format!(
                    "webhook returned {} for action '{}'",
                    status, action.name
                )));
            }
            tracing::debug!(
                stream_id = %context.stream_id,
                action = %action.name,
                "delivered side-channel action"
            );
            Ok(())
        })
    }
}
