use thiserror::Error;

use crate::chunks::ChunkError;

/// Coarse failure classification shared across the crate.
///
/// Dispositions: `Internal` aborts the swarm, `Communication` drops the peer
/// and cools it down, `Network` drops the peer silently, `Storage` drops the
/// peer and surfaces to the host, `Tracker` backs off and tries the next
/// tracker, `Input` is returned synchronously to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Internal,
    Communication,
    Network,
    Storage,
    Tracker,
    Input,
}

/// Errors raised by peer connections.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No bytes arrived within the idle window, or an operation timed out.
    #[error("timeout")]
    Timeout,

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match the swarm's.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The chunk store refused or failed an operation.
    #[error("storage error: {0}")]
    Storage(#[from] ChunkError),

    /// Invariant violation on our side.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Io(_) | PeerError::ConnectionClosed | PeerError::Timeout => {
                ErrorKind::Network
            }
            PeerError::InvalidHandshake
            | PeerError::InfoHashMismatch
            | PeerError::InvalidMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::Protocol(_) => ErrorKind::Communication,
            PeerError::Storage(_) => ErrorKind::Storage,
            PeerError::Internal(_) => ErrorKind::Internal,
        }
    }
}
