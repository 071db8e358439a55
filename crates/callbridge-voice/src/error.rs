use crate::codec::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend connection closed")]
    Closed,

    #[error("backend command queue is full")]
    Backpressure,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("prompt builder error: {0}")]
    Prompt(String),

    #[error("action dispatch error: {0}")]
    Action(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
