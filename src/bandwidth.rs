//! Bandwidth limiting using token bucket throttles.
//!
//! A [`Throttle`] caps one direction of traffic (download or upload) for the
//! whole swarm. Every peer half-connection registers a *node*; each refill
//! tick deals the bucket's tokens out evenly across active nodes, so two
//! peers both able to run at line rate end up within a few percent of half
//! the ceiling each.
//!
//! A node that drains its quota mid-transfer is deactivated; its connection
//! parks until the next refill tick re-activates it. The orchestrator drives
//! [`Throttle::tick`] and re-arms the returned nodes; connection tasks use
//! [`Throttle::acquire`] which wraps the same protocol behind an await.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::constants::{BURST_MULTIPLIER, MAX_QUOTA_SLICE, RATE_WINDOW};

/// Rolling-window byte rate meter.
#[derive(Debug, Clone)]
pub struct Rate {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Rate {
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Records `bytes` transferred at `now`.
    pub fn insert(&mut self, now: Instant, bytes: u64) {
        self.expire(now);
        self.samples.push_back((now, bytes));
        self.total += bytes;
    }

    /// Average bytes per second over the window.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.total / self.window.as_secs().max(1)
    }

    /// Total bytes currently inside the window.
    pub fn bytes_in_window(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.total -= bytes;
            self.samples.pop_front();
        }
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable handle to a throttle node. Slot indices are reused; the generation
/// counter keeps a stale id from touching a successor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    slot: usize,
    generation: u32,
}

#[derive(Debug)]
struct Node {
    generation: u32,
    alive: bool,
    active: bool,
    /// Deactivated because the bucket starved it (as opposed to erased);
    /// such nodes are re-activated by the next refill with tokens to deal.
    starved: bool,
    /// Bytes this node may still transfer in the current slice.
    quota: u32,
    rate: Rate,
}

struct Bucket {
    /// Bytes per second; 0 means unlimited.
    limit: u64,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if self.limit == 0 {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.limit as f64).min(self.capacity);
    }
}

struct Inner {
    bucket: Bucket,
    nodes: Vec<Node>,
    free_slots: Vec<usize>,
    active_count: usize,
}

impl Inner {
    /// Deals an even share of the bucket to a set of nodes. `extra` counts
    /// nodes that will be activated by the caller but are not active yet.
    fn share(&self, extra: usize) -> u32 {
        if self.bucket.limit == 0 {
            return MAX_QUOTA_SLICE;
        }
        let n = (self.active_count + extra).max(1) as f64;
        ((self.bucket.tokens / n) as u64).min(u64::from(MAX_QUOTA_SLICE)) as u32
    }
}

/// Shared token-bucket rate limiter with per-node fair-share scheduling.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Mutex<Inner>>,
    refilled: Arc<Notify>,
}

impl Throttle {
    /// Creates a throttle limited to `bytes_per_sec`. A limit of 0 means
    /// unlimited: quotas are always granted and nodes never starve.
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = (bytes_per_sec * BURST_MULTIPLIER) as f64;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bucket: Bucket {
                    limit: bytes_per_sec,
                    tokens: capacity,
                    capacity,
                    last_refill: Instant::now(),
                },
                nodes: Vec::new(),
                free_slots: Vec::new(),
                active_count: 0,
            })),
            refilled: Arc::new(Notify::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Changes the rate ceiling. Tokens above the new burst capacity are
    /// dropped.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        let mut inner = self.inner.lock();
        let capacity = (bytes_per_sec * BURST_MULTIPLIER) as f64;
        inner.bucket.limit = bytes_per_sec;
        inner.bucket.capacity = capacity;
        if bytes_per_sec != 0 {
            inner.bucket.tokens = inner.bucket.tokens.min(capacity);
        }
        self.refilled.notify_waiters();
    }

    /// Registers a node. New nodes start inactive.
    pub fn insert_node(&self) -> NodeId {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.free_slots.pop() {
            let node = &mut inner.nodes[slot];
            node.alive = true;
            node.active = false;
            node.starved = false;
            node.quota = 0;
            node.rate = Rate::new();
            return NodeId {
                slot,
                generation: node.generation,
            };
        }

        inner.nodes.push(Node {
            generation: 0,
            alive: true,
            active: false,
            starved: false,
            quota: 0,
            rate: Rate::new(),
        });
        NodeId {
            slot: inner.nodes.len() - 1,
            generation: 0,
        }
    }

    /// Unregisters a node. The id is dead afterwards; its slot may be reused.
    pub fn erase_node(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(node) = checked_node(&mut inner.nodes, id) else {
            return;
        };

        let was_active = node.active;
        node.alive = false;
        node.active = false;
        node.starved = false;
        node.quota = 0;
        node.generation = node.generation.wrapping_add(1);

        if was_active {
            inner.active_count -= 1;
        }
        inner.free_slots.push(id.slot);
    }

    /// Moves a node onto the active list and grants it an opening share so a
    /// transfer can begin before the next tick.
    pub fn activate(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let now = Instant::now();
        inner.bucket.refill(now);
        let share = inner.share(1);

        let Some(node) = checked_node(&mut inner.nodes, id) else {
            return;
        };
        if !node.active {
            node.active = true;
            node.starved = false;
            node.quota = share;
            inner.active_count += 1;
        }
    }

    /// Moves a node off the active list, remembering that it was starved so
    /// the next refill re-activates it.
    pub fn deactivate(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(node) = checked_node(&mut inner.nodes, id) else {
            return;
        };
        if node.active {
            node.active = false;
            node.starved = true;
            node.quota = 0;
            inner.active_count -= 1;
        }
    }

    /// True when the node is registered and on the active list.
    pub fn is_throttled(&self, id: NodeId) -> bool {
        let mut inner = self.inner.lock();
        checked_node(&mut inner.nodes, id).map_or(false, |n| n.active)
    }

    /// Bytes the node may still transfer in the current slice. Inactive
    /// nodes get nothing.
    pub fn quota(&self, id: NodeId) -> u32 {
        let mut inner = self.inner.lock();
        let unlimited = inner.bucket.limit == 0;
        match checked_node(&mut inner.nodes, id) {
            Some(node) if node.active => {
                if unlimited {
                    MAX_QUOTA_SLICE
                } else {
                    node.quota
                }
            }
            _ => 0,
        }
    }

    /// Debits the node's slice quota, the bucket, and the node's rate meter
    /// after a transfer.
    pub fn used(&self, id: NodeId, now: Instant, bytes: u32) {
        let mut inner = self.inner.lock();
        if inner.bucket.limit != 0 {
            inner.bucket.tokens = (inner.bucket.tokens - f64::from(bytes)).max(0.0);
        }
        if let Some(node) = checked_node(&mut inner.nodes, id) {
            node.quota = node.quota.saturating_sub(bytes);
            node.rate.insert(now, u64::from(bytes));
        }
    }

    /// The node's transfer rate over the rolling window.
    pub fn node_rate(&self, id: NodeId, now: Instant) -> u64 {
        let mut inner = self.inner.lock();
        checked_node(&mut inner.nodes, id).map_or(0, |n| n.rate.rate(now))
    }

    /// Refills the bucket, deals fresh slice quotas to every live node, and
    /// returns the nodes brought back from starvation so their connections
    /// can re-arm read/write interest.
    pub fn tick(&self, now: Instant) -> Vec<NodeId> {
        let mut inner = self.inner.lock();
        inner.bucket.refill(now);

        if inner.bucket.limit != 0 && inner.bucket.tokens < 1.0 {
            return Vec::new();
        }

        let starved = inner.nodes.iter().filter(|n| n.alive && n.starved).count();
        let share = inner.share(starved);

        let mut woken = Vec::new();
        for (slot, node) in inner.nodes.iter_mut().enumerate() {
            if !node.alive {
                continue;
            }
            if node.starved {
                node.starved = false;
                node.active = true;
                woken.push(NodeId {
                    slot,
                    generation: node.generation,
                });
            }
            if node.active {
                node.quota = share;
            }
        }
        inner.active_count += woken.len();
        drop(inner);

        self.refilled.notify_waiters();
        woken
    }

    /// Takes up to `want` bytes of quota, waiting for refills while the node
    /// is starved. Returns the granted amount (already debited), or 0 when
    /// the node has been erased.
    pub async fn acquire(&self, id: NodeId, want: u32) -> u32 {
        loop {
            let notified = self.refilled.notified();

            {
                let quota = self.quota(id);
                if quota > 0 {
                    let granted = want.min(quota);
                    self.used(id, Instant::now(), granted);
                    return granted;
                }

                let mut inner = self.inner.lock();
                let inner = &mut *inner;
                match checked_node(&mut inner.nodes, id) {
                    None => return 0,
                    Some(node) => {
                        if node.active {
                            node.active = false;
                            node.starved = true;
                            node.quota = 0;
                            inner.active_count -= 1;
                        }
                    }
                }
            }

            notified.await;
        }
    }
}

fn checked_node(nodes: &mut [Node], id: NodeId) -> Option<&mut Node> {
    nodes
        .get_mut(id.slot)
        .filter(|n| n.alive && n.generation == id.generation)
}
