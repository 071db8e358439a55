//! Per-call tenant configuration.

use serde::{Deserialize, Serialize};

/// Configuration of the workspace that owns a dialled number.
///
/// Resolved once when a call starts and immutable for the rest of the call.
/// `context_ref` points at business data owned by an external service; the
/// bridge never dereferences it, it only hands it to the prompt builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Stable workspace identifier.
    pub tenant_id: String,
    /// Name the assistant introduces itself with.
    pub assistant_name: String,
    /// Backend voice identifier.
    pub voice: String,
    /// Opening line spoken when the call connects.
    pub greeting: Option<String>,
    /// Reference to business-context data held by the business-data service.
    pub context_ref: Option<String>,
}
