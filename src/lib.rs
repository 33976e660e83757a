//! rswarm - a BitTorrent swarm engine
//!
//! This library drives one active torrent session: it announces to trackers,
//! maintains peer connections running the wire protocol, arbitrates upload
//! slots, selects which blocks to fetch from which peer, and enforces global
//! rate ceilings. Metainfo parsing, disk layout, and the user interface are
//! the host's concern; piece storage plugs in through the [`chunks`] seam.
//!
//! # Modules
//!
//! - [`peer`] - BEP-3 wire protocol, per-peer state machines, choking, block delegation
//! - [`tracker`] - BEP-3/15/23 HTTP and UDP trackers, DHT adapter, grouped failover list
//! - [`swarm`] - the orchestrator tying peers, trackers, and throttles together
//! - [`bandwidth`] - token-bucket throttles with per-peer fair-share quotas
//! - [`chunks`] - pinned access to piece storage, implemented by the host
//! - [`bencode`] - BEP-3 bencode decoding for tracker responses
//! - [`config`] - host-tunable session parameters

pub mod bandwidth;
pub mod bencode;
pub mod chunks;
pub mod config;
pub mod constants;
pub mod peer;
pub mod swarm;
pub mod tracker;

pub use bandwidth::{NodeId, Rate, Throttle};
pub use bencode::{decode, BencodeError, Value};
pub use chunks::{ChunkError, ChunkHandle, ChunkStore, MemoryChunkStore};
pub use config::SwarmConfig;
pub use peer::{
    Bitfield, BlockRequest, ChokeManager, ErrorKind, Handshake, Message, PeerConnection, PeerError,
    PeerId, RequestDelegator,
};
pub use swarm::{Swarm, SwarmHandle, SwarmHandler};
pub use tracker::{
    AddressList, AnnounceResponse, DhtPeerSource, HttpTracker, ScrapeResponse, TrackerError,
    TrackerEvent, TrackerInfo, TrackerList, UdpTracker,
};
