use serde::{Deserialize, Serialize};
use std::fmt;

fn default_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Connection settings for the realtime AI voice backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Realtime WebSocket endpoint. The model is appended as a query parameter.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// PCM16 sample rate the backend expects: 8000, 16000 or 24000.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Upper bound on the WebSocket handshake, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: String::new(),
            model: default_model(),
            sample_rate: default_sample_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("sample_rate", &self.sample_rate)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}
