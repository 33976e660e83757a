//! Peer wire protocol (BEP-3) and the engines built on it.
//!
//! This module holds the per-peer state machine, the global choke arbiter,
//! and the block delegator, plus the framing and codec layers they sit on.

mod bitfield;
mod choking;
mod connection;
mod delegator;
mod error;
mod message;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeDecision, ChokeManager};
pub use connection::{PeerConnection, SweepOutcome};
pub use delegator::{pipe_size, BlockRequest, CompletionOutcome, RequestDelegator};
pub use error::{ErrorKind, PeerError};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN};
pub use peer_id::PeerId;
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
