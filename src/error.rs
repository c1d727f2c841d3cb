//! Error types for the listener.
//!
//! Each stage of the pipeline has its own error enum so callers can match on
//! the failure they care about. Socket-level failures stay `std::io::Error`.

use std::path::PathBuf;
use thiserror::Error;

/// Frame header could not be interpreted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The 4-byte header is not a decimal number.
    #[error("frame header is not numeric: {0:?}")]
    HeaderNotNumeric(String),
}

/// Worker pool submission failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue is full and no further thread may be started.
    #[error("worker pool has reached the maximum capacity")]
    Overloaded,

    /// The pool no longer accepts work.
    #[error("worker pool is shut down")]
    ShutDown,

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Payload does not conform to the expected packaging format.
#[derive(Debug, Error)]
#[error("could not unpack message: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Message could not be packed into wire bytes.
#[derive(Debug, Error)]
#[error("could not pack message: {reason}")]
pub struct EncodeError {
    pub reason: String,
}

impl EncodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure of a request handler task.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("message is not in ISO-8583 format: {0}")]
    Decode(#[from] DecodeError),
}

/// Failure to queue a reply on a session.
#[derive(Debug, Error)]
pub enum ReplyError {
    /// The originating connection is gone; the reply is discarded.
    #[error("session is closed")]
    SessionClosed,

    /// A body this large cannot be described by a 4-digit header.
    #[error("reply payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("invalid listen address '{0}'")]
    InvalidListenAddress(String),
}
