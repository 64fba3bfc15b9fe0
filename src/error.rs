//! Error types shared across the crate.
//!
//! Script and HTTP errors never leave the crate boundary towards the host: the editor and
//! interception layers log them and fall back to showing or forwarding the original message.

use thiserror::Error;

use crate::catalog::Direction;
use crate::http::MessageKind;

/// Failures raised while talking to the scripting engine.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("no script is loaded")]
    EngineUnavailable,

    #[error("failed to compile script {path}: {reason}")]
    Compile { path: String, reason: String },

    #[error("callback `{callback}` is not defined")]
    CallbackNotFound { callback: String },

    #[error("callback `{callback}` failed: {reason}")]
    CallbackFailed { callback: String, reason: String },

    #[error("callback `{callback}` returned an unsupported value of type `{type_name}`")]
    UnsupportedReturn { callback: String, type_name: String },

    #[error("callback `{callback}` returned an invalid message: {source}")]
    InvalidMessage {
        callback: String,
        #[source]
        source: HttpError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed HTTP input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed HTTP message: {0}")]
    Malformed(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("missing required configuration: {0}")]
    Missing(String),
}

/// Where a callback failure happened, carried into every log line about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSite {
    pub kind: MessageKind,
    pub direction: Direction,
    pub channel: String,
}

impl std::fmt::Display for CallbackSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channel = if self.channel.is_empty() { "<default>" } else { &self.channel };
        write!(f, "{} {} `{}`", self.kind, self.direction, channel)
    }
}
