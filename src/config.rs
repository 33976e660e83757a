//! Host-tunable swarm parameters.

use crate::constants::DEFAULT_PORT;

/// Knobs for one swarm session. `Default` gives a usable leecher setup;
/// hosts override what they care about.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// TCP listen port for incoming peers; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Peers requested per announce; negative leaves it to the tracker.
    pub numwant: i32,
    /// Open outbound connections while below this many peers.
    pub min_peers: usize,
    /// Hard cap on concurrent connections.
    pub max_peers: usize,
    /// Download ceiling in bytes/sec; 0 means unlimited.
    pub download_limit: u64,
    /// Upload ceiling in bytes/sec; 0 means unlimited.
    pub upload_limit: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            numwant: -1,
            min_peers: 40,
            max_peers: 100,
            download_limit: 0,
            upload_limit: 0,
        }
    }
}
