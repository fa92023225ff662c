//! Error types for wirerpc.

use thiserror::Error;

use crate::packet::SmErr;

/// Error type for all fallible wirerpc operations.
///
/// Variants map onto the engine's failure taxonomy: resource exhaustion
/// (`OutOfMemory`, `NoCredit`) is surfaced synchronously and never retried
/// internally; connectivity failures carry the session-management error
/// code; protocol violations fail fast before touching engine state.
#[derive(Debug, Error)]
pub enum Error {
    /// The size-class pool backing an allocation is exhausted.
    #[error("out of memory: size class {class_bytes} B exhausted")]
    OutOfMemory { class_bytes: usize },

    /// The session has no free credit for another in-flight request.
    #[error("no credit available on session {0}")]
    NoCredit(u16),

    /// No session exists with this number.
    #[error("session {0} not found")]
    SessionNotFound(u16),

    /// A data-plane operation was issued against a session that is not
    /// in the `Connected` state.
    #[error("session {0} is not connected")]
    SessionNotConnected(u16),

    /// The remote endpoint rejected the connect request.
    #[error("connect for session {session} rejected: {err:?}")]
    ConnectRejected { session: u16, err: SmErr },

    /// An argument violated a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A message exceeds the maximum message size.
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MsgTooLarge { size: usize, max: usize },

    /// A request type already has a registered handler.
    #[error("request type {0} already has a handler")]
    AlreadyRegistered(u8),

    /// A received packet failed header validation.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The underlying transport failed to accept or deliver a frame.
    #[error("transport: {0}")]
    Transport(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
