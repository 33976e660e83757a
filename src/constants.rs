//! Protocol constants and tuning parameters.
//!
//! Values shared across the peer, tracker, and bandwidth subsystems.
//! Defaults follow common client behavior (libtorrent, qBittorrent) where
//! the protocol does not pin them down.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-RS0001-";

/// User agent string for HTTP tracker requests
pub const USER_AGENT: &str = "rswarm/0.1.0";

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length per BEP 3 (128KB). Larger requests are a protocol
/// violation and the peer is dropped.
pub const MAX_REQUEST_LENGTH: u32 = 1 << 17;

/// Remaining-blocks threshold below which endgame mode starts
pub const ENDGAME_BLOCK_THRESHOLD: usize = 32;

// ============================================================================
// Peer queues and pipelining
// ============================================================================

/// Maximum blocks a remote may queue on us
pub const MAX_SEND_QUEUE: usize = 64;

/// Request pipe sizing: pipe = PIPE_BASE + rate / PIPE_GRANULARITY,
/// clamped to [MIN_PIPE, MAX_PIPE]
pub const PIPE_BASE: usize = 2;
pub const PIPE_GRANULARITY: u64 = 8192;
pub const MIN_PIPE: usize = 2;
pub const MAX_PIPE: usize = 200;

/// Strikes from failed piece hashes before a peer is disconnected
pub const STRIKE_LIMIT: u32 = 3;

/// Aggregate download rate under which stalled peers may request in endgame
pub const ENDGAME_SLOW_RATE: u64 = 10 * 1024;

// ============================================================================
// Choking
// ============================================================================

/// Upload slots filled by the regular choke round
pub const UNCHOKE_SLOTS: usize = 4;

/// Regular choke round interval
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Optimistic unchoke round interval
pub const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);

/// Relative weight of recently-connected peers in the optimistic pick
pub const NEW_PEER_WEIGHT: usize = 3;

// ============================================================================
// Timeouts - peers
// ============================================================================

/// Handshake must complete within this after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Drop a peer when no bytes have been read for this long
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Write timeout for a single message
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive send interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(100);

/// Do not retry a peer dropped for a protocol violation before this
pub const PEER_COOL_DOWN: Duration = Duration::from_secs(300);

// ============================================================================
// Timeouts - trackers
// ============================================================================

/// HTTP tracker request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP tracker base retransmit timeout; attempt n waits base * 2^n
pub const UDP_RETRY_BASE: Duration = Duration::from_secs(15);

/// Attempts 0..=UDP_MAX_ATTEMPT are made before giving up (BEP 15)
pub const UDP_MAX_ATTEMPT: u32 = 8;

/// A UDP connection id is valid for one minute after the connect exchange
pub const UDP_CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Minimum delay between scrapes of one tracker
pub const SCRAPE_MIN_INTERVAL_SECS: u64 = 600;

/// Failure backoff: failed_time_next = last + min(30 * 2^failures, cap)
pub const TRACKER_BACKOFF_BASE_SECS: u64 = 30;
pub const TRACKER_BACKOFF_CAP_SECS: u64 = 3600;

/// Announce interval used until a tracker supplies one
pub const TRACKER_DEFAULT_INTERVAL_SECS: u64 = 1800;

// ============================================================================
// Bandwidth
// ============================================================================

/// Bucket capacity relative to refill rate (burst allowance)
pub const BURST_MULTIPLIER: u64 = 2;

/// Largest quota handed to one node in a single scheduling slice
pub const MAX_QUOTA_SLICE: u32 = 128 * 1024;

/// Throttle refill tick
pub const THROTTLE_TICK: Duration = Duration::from_millis(100);

/// Rolling window for rate meters
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

// ============================================================================
// Orchestrator
// ============================================================================

/// Stall/idle sweep interval
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Tracker scheduling tick
pub const TRACKER_TICK: Duration = Duration::from_secs(1);

/// Bound for every inter-task channel in the swarm
pub const CHANNEL_CAPACITY: usize = 256;
