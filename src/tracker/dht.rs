//! DHT as an opaque peer source.
//!
//! The routing table and lookup machinery live in the host; this adapter
//! lets the tracker list schedule the DHT like any other tracker. Scrape is
//! a no-op unless the source says otherwise.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::error::TrackerError;
use super::response::{AnnounceResponse, ScrapeResponse};
use super::{AnnounceParams, TrackerInfo};
use crate::constants::TRACKER_DEFAULT_INTERVAL_SECS;

type PeerFuture<'a> = Pin<Box<dyn Future<Output = Vec<std::net::SocketAddr>> + Send + 'a>>;

/// Host-supplied DHT access.
pub trait DhtPeerSource: Send + Sync + 'static {
    /// Announces our port for the info hash and resolves to the peers found.
    fn find_peers(&self, info_hash: [u8; 20], port: u16) -> PeerFuture<'_>;

    /// Whether the source can answer scrape-style aggregate queries.
    fn supports_scrape(&self) -> bool {
        false
    }

    fn scrape(&self, _info_hash: [u8; 20]) -> Option<ScrapeResponse> {
        None
    }
}

/// Tracker-shaped adapter over a [`DhtPeerSource`].
pub struct DhtTracker {
    source: Arc<dyn DhtPeerSource>,
}

impl DhtTracker {
    pub fn new(source: Arc<dyn DhtPeerSource>) -> Self {
        Self { source }
    }

    pub async fn announce(
        &self,
        info: &TrackerInfo,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        let peers = self.source.find_peers(info.info_hash, params.port).await;

        let mut response = AnnounceResponse::new(TRACKER_DEFAULT_INTERVAL_SECS as u32);
        response.peers.extend(peers);
        Ok(response)
    }

    pub fn scrape(&self, info: &TrackerInfo) -> Result<ScrapeResponse, TrackerError> {
        if !self.source.supports_scrape() {
            return Err(TrackerError::ScrapeUnsupported);
        }
        self.source
            .scrape(info.info_hash)
            .ok_or(TrackerError::ScrapeUnsupported)
    }
}
