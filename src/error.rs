//! Error types shared by the codecs, the channel state machine, the servers
//! and the client.

use crate::channel::{ChannelId, ChannelState};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Protocol-level failures. Every variant maps to an [`ErrorKind`] whose name
/// is what travels on the wire in the `error` field of a response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown command type `{0}`")]
    UnknownCommandType(String),

    #[error("invalid channel {channel_id}: instrument has {num_channels} channels")]
    InvalidChannel { channel_id: i64, num_channels: u16 },

    #[error("cannot {action} channel {channel_id} while {state}")]
    InvalidTransition {
        channel_id: ChannelId,
        action: &'static str,
        state: ChannelState,
    },

    #[error("incomplete frame: need {needed} bytes, have {available}")]
    IncompleteFrame { needed: usize, available: usize },

    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("channel {0} is faulted; reset required")]
    ChannelFaulted(ChannelId),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            ProtocolError::UnknownCommandType(_) => ErrorKind::UnknownCommandType,
            ProtocolError::InvalidChannel { .. } => ErrorKind::InvalidChannel,
            ProtocolError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ProtocolError::IncompleteFrame { .. } => ErrorKind::IncompleteFrame,
            ProtocolError::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            ProtocolError::ChannelFaulted(_) => ErrorKind::ChannelFaulted,
        }
    }

    pub(crate) fn malformed(detail: impl std::fmt::Display) -> Self {
        ProtocolError::MalformedMessage(detail.to_string())
    }
}

/// Wire name of a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedMessage,
    UnknownCommandType,
    InvalidChannel,
    InvalidTransition,
    IncompleteFrame,
    ConnectionTimeout,
    ChannelFaulted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedMessage => "MalformedMessage",
            ErrorKind::UnknownCommandType => "UnknownCommandType",
            ErrorKind::InvalidChannel => "InvalidChannel",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::IncompleteFrame => "IncompleteFrame",
            ErrorKind::ConnectionTimeout => "ConnectionTimeout",
            ErrorKind::ChannelFaulted => "ChannelFaulted",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the emulator process itself.
#[derive(Debug, Error)]
pub enum SpooferError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors seen by [`crate::client::CyclerInterface`] callers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("instrument rejected command ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("command connection closed")]
    Closed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Error kind for callers that want to branch on protocol semantics
    /// without caring where the error was detected.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote { kind, .. } => Some(*kind),
            ClientError::Protocol(e) => Some(e.kind()),
            ClientError::Timeout(_) => Some(ErrorKind::ConnectionTimeout),
            _ => None,
        }
    }
}
