//! Coordinator error types

use thiserror::Error;

/// Errors raised while coordinating a protocol run
///
/// Every error is scoped to a single event or message; none of them stop the
/// poll loop.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("chain query failed: {0}")]
    Chain(String),

    #[error("event store error: {0}")]
    Store(String),

    #[error("send to peer {peer_id} failed: {reason}")]
    Transport { peer_id: String, reason: String },

    #[error("peer {peer_id} is not a participant of event {event_id}")]
    NotParticipant { peer_id: String, event_id: String },

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("unknown protocol type: {0}")]
    UnknownProtocol(String),

    #[error("no TSS key registered")]
    MissingKey,

    #[error("keyshare not found for key {0}")]
    MissingKeyshare(String),

    #[error("no tx builder for chain {0}")]
    UnsupportedChain(String),

    #[error("crypto engine error: {0}")]
    Engine(String),

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("gas price {got} outside tolerance of oracle price {oracle} ({min}..={max})")]
    GasPriceOutOfRange { got: u128, oracle: u128, min: u128, max: u128 },

    #[error("signing hash mismatch: expected {expected}, got {got}")]
    SigningHashMismatch { expected: String, got: String },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
