// src/error.rs
use thiserror::Error;

/// Everything that can go wrong between the caller and the tag.
///
/// The codec only ever produces `Encoding`; the session maps platform
/// failures into the remaining variants before surfacing them.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not enough space on the tag: {0}")]
    Overflow(String),
    #[error("tag left the field: {0}")]
    Disconnected(String),
    #[error("tag content unreadable: {0}")]
    Format(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid input: {0}")]
    Encoding(String),
}

impl TagError {
    /// Map a PC/SC error onto the taxonomy. The smart-card layer reports
    /// a removed card and a rejected write through distinct codes.
    pub fn from_pcsc(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard => {
                TagError::Disconnected(err.to_string())
            }
            pcsc::Error::InsufficientBuffer => TagError::Overflow(err.to_string()),
            _ => TagError::Transport(err.to_string()),
        }
    }
}
