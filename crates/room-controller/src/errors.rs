//! Room Controller error types.
//!
//! Errors map to a named `ErrorCode` carried in the signaling response
//! envelope. Internal details are logged server-side but not exposed to
//! clients; media engine failures are surfaced verbatim.

use crate::media::types::{ProducerId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by the media engine facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The worker hosting the target resource has died.
    #[error("worker {0} died")]
    WorkerDied(WorkerId),

    /// The referenced engine object does not exist (or was closed).
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The referenced producer does not exist (or was closed).
    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    /// A codec is not part of the router's capability set.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Malformed capability set or RTP parameters.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The engine has no capacity left (no live worker, port range, ...).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other engine-side request failure.
    #[error("engine request failed: {0}")]
    Request(String),
}

/// Room Controller error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `RoomNotFound`, `TransportNotFound`: `NotFound`
/// - `RoomAlreadyExists`: `AlreadyExists`
/// - `Engine`: `EngineError`
/// - `SessionClosed`, `Internal`: `Internal`
#[derive(Debug, Error)]
pub enum RoomError {
    /// Request failed validation (missing field, malformed room id, bad JSON).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Transport not owned by this peer.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Room id already registered (or reserved by an in-flight create).
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    /// Room is at its configured peer capacity.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// Room was closed while the operation was in flight.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Operation not valid in the peer's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The peer session ended before the operation completed.
    #[error("Session closed")]
    SessionClosed,

    /// Produce on a transport that is not the peer's send transport.
    #[error("No send transport: {0}")]
    NoSendTransport(String),

    /// Peer already has a producer.
    #[error("Peer is already producing")]
    AlreadyProducing,

    /// The peer cannot receive the target producer's media.
    #[error("Incompatible capabilities for producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Target producer is gone.
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Media engine failure.
    #[error("Engine error: {0}")]
    Engine(EngineError),

    /// Engine call did not answer within the configured timeout.
    #[error("Engine call timed out: {0}")]
    Timeout(&'static str),

    /// Controller is shutting down.
    #[error("Room controller is draining")]
    Draining,

    /// Internal error (channel failure, panicked task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for RoomError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ProducerNotFound(id) => RoomError::ProducerNotFound(id),
            other => RoomError::Engine(other),
        }
    }
}

/// Error code carried in signaling error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    RoomFull,
    NoSendTransport,
    AlreadyProducing,
    IncompatibleCapabilities,
    ProducerNotFound,
    EngineError,
    Timeout,
    InvalidRequest,
    InvalidState,
    RoomClosed,
    Draining,
    Internal,
}

impl ErrorCode {
    /// Stable label used for metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::RoomFull => "RoomFull",
            ErrorCode::NoSendTransport => "NoSendTransport",
            ErrorCode::AlreadyProducing => "AlreadyProducing",
            ErrorCode::IncompatibleCapabilities => "IncompatibleCapabilities",
            ErrorCode::ProducerNotFound => "ProducerNotFound",
            ErrorCode::EngineError => "EngineError",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::InvalidState => "InvalidState",
            ErrorCode::RoomClosed => "RoomClosed",
            ErrorCode::Draining => "Draining",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RoomError {
    /// Returns the signaling `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoomError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RoomError::RoomNotFound(_) | RoomError::TransportNotFound(_) => ErrorCode::NotFound,
            RoomError::RoomAlreadyExists(_) => ErrorCode::AlreadyExists,
            RoomError::RoomFull(_) => ErrorCode::RoomFull,
            RoomError::RoomClosed(_) => ErrorCode::RoomClosed,
            RoomError::InvalidState(_) => ErrorCode::InvalidState,
            RoomError::NoSendTransport(_) => ErrorCode::NoSendTransport,
            RoomError::AlreadyProducing => ErrorCode::AlreadyProducing,
            RoomError::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            RoomError::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            RoomError::Engine(_) => ErrorCode::EngineError,
            RoomError::Timeout(_) => ErrorCode::Timeout,
            RoomError::Draining => ErrorCode::Draining,
            RoomError::SessionClosed | RoomError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::SessionClosed | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RoomError::Engine(e) => e.to_string(),
            RoomError::Draining => "Server is shutting down, please reconnect".to_string(),
            other => other.to_string(),
        }
    }
}
