//! Tracker protocols (BEP-3, BEP-15, BEP-23) and tracker scheduling.
//!
//! Three worker variants share one contract: announce with the current
//! session counters, optionally scrape, and report a peer list or a failure
//! message. [`list::TrackerList`] arranges workers into failover groups and
//! decides who is asked next; the orchestrator owns the actual dispatch.

pub mod dht;
mod error;
mod http;
pub mod list;
mod response;
pub mod udp;

pub use dht::{DhtPeerSource, DhtTracker};
pub use error::TrackerError;
pub use http::HttpTracker;
pub use list::{Tracker, TrackerKind, TrackerList};
pub use response::{
    encode_compact_peers, parse_compact_peers, parse_compact_peers6, AddressList,
    AnnounceResponse, ScrapeResponse, TrackerEvent,
};
pub use udp::UdpTracker;

use crate::peer::PeerId;

/// Swarm identity shared by every tracker worker.
#[derive(Debug, Clone)]
pub struct TrackerInfo {
    pub info_hash: [u8; 20],
    /// Used by protocols that obfuscate the hash; plain announces ignore it.
    pub obfuscated_hash: Option<[u8; 20]>,
    pub local_id: PeerId,
    /// Session-scoped nonce reported to trackers for IP-change tracking.
    pub key: u32,
}

impl TrackerInfo {
    pub fn new(info_hash: [u8; 20], local_id: PeerId) -> Self {
        Self {
            info_hash,
            obfuscated_hash: None,
            local_id,
            key: rand::random(),
        }
    }
}

/// Announce counters pulled from the orchestrator at send time.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    /// Peers wanted; negative means "server default".
    pub numwant: i32,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub port: u16,
}

#[cfg(test)]
mod tests;
