use meetup_proto::{error_codes, MediaKind};
use thiserror::Error;

use crate::session::CallState;
use crate::transport::Direction;
use crate::types::{ConsumerId, PeerId};

/// Failures of the signaling channel itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("request {method} timed out")]
    Timeout { method: String },

    #[error("request rejected ({code}): {reason}")]
    Rejected { code: i32, reason: String },

    #[error("signaling connection lost")]
    ConnectionLost,

    #[error("request cancelled")]
    Cancelled,

    #[error("signaling channel already opened")]
    AlreadyOpen,

    #[error("signaling channel not open")]
    NotOpen,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no codec in common with the router")]
    Incompatible,

    #[error("router cannot receive {0}")]
    UnsupportedKind(MediaKind),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Session not ready")]
    NotReady,

    #[error("Call session already {0}")]
    AlreadyActive(CallState),

    #[error("Transport error ({direction}): {reason}")]
    Transport { direction: Direction, reason: String },

    #[error("A {0} transport already exists")]
    TransportExists(Direction),

    #[error("The {0} transport is not ready")]
    TransportNotReady(Direction),

    #[error("Already producing {0}")]
    AlreadyProducing(MediaKind),

    #[error("Not producing {0}")]
    NotProducing(MediaKind),

    #[error("Media acquisition failed for {kind}: {reason}")]
    MediaAcquisition { kind: MediaKind, reason: String },

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Unknown consumer: {0}")]
    UnknownConsumer(ConsumerId),

    #[error("Invalid consumer descriptor: {0}")]
    Consume(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying `connect()` may succeed without a config change.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Signaling(e) => !matches!(e, SignalingError::AlreadyOpen),
            Self::Transport { .. } | Self::TransportNotReady(_) | Self::Engine(_) => true,
            _ => false,
        }
    }

    /// Whether the error takes the whole session down.
    ///
    /// Producer, consumer and device errors stay local to that operation.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Signaling(SignalingError::ConnectionLost)
                | Self::Negotiation(NegotiationError::Incompatible)
                | Self::Transport { .. }
        )
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Signaling(SignalingError::Cancelled))
    }

    /// Code used when this error rejects a server request
    #[must_use]
    pub const fn reject_code(&self) -> i32 {
        match self {
            Self::TransportNotReady(_) => error_codes::TRANSPORT_NOT_READY,
            Self::UnknownPeer(_) => error_codes::PEER_NOT_FOUND,
            Self::Consume(_) | Self::Serialization(_) => error_codes::BAD_REQUEST,
            Self::Signaling(SignalingError::Timeout { .. }) => error_codes::REQUEST_TIMEOUT,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}
