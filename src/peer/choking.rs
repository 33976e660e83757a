//! Global upload-slot arbitration.
//!
//! Every ~10s the regular round ranks interested, non-snubbed peers by how
//! fast they send to us (or, when seeding, how fast we send to them) and
//! unchokes the top four. Every ~30s the optimistic round unchokes one
//! extra peer picked at random, weighting fresh connections so newcomers
//! get a chance to prove themselves. At most five peers are ever unchoked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng as _;

use crate::constants::{CHOKE_INTERVAL, NEW_PEER_WEIGHT, OPTIMISTIC_INTERVAL, UNCHOKE_SLOTS};

/// A choke/unchoke order for one peer, to be relayed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub addr: SocketAddr,
    pub unchoke: bool,
}

#[derive(Debug)]
struct Candidate {
    insertion: u64,
    connected_at: Instant,
    interested: bool,
    snubbed: bool,
    unchoked: bool,
    /// Bytes/sec they send us.
    download_rate: u64,
    /// Bytes/sec we send them.
    upload_rate: u64,
}

pub struct ChokeManager {
    peers: HashMap<SocketAddr, Candidate>,
    insertion_counter: u64,
    last_round: Instant,
    last_optimistic: Instant,
    optimistic: Option<SocketAddr>,
}

impl ChokeManager {
    pub fn new(now: Instant) -> Self {
        Self {
            peers: HashMap::new(),
            insertion_counter: 0,
            last_round: now,
            last_optimistic: now,
            optimistic: None,
        }
    }

    pub fn insert(&mut self, addr: SocketAddr, now: Instant) {
        let insertion = self.insertion_counter;
        self.insertion_counter += 1;
        self.peers.insert(
            addr,
            Candidate {
                insertion,
                connected_at: now,
                interested: false,
                snubbed: false,
                unchoked: false,
                download_rate: 0,
                upload_rate: 0,
            },
        );
    }

    /// Removes a peer. A freed optimistic slot is refilled immediately.
    pub fn remove(&mut self, addr: SocketAddr, is_seed: bool, now: Instant) -> Vec<ChokeDecision> {
        self.peers.remove(&addr);

        if self.optimistic == Some(addr) {
            self.optimistic = None;
            self.pick_optimistic(now);
            return self.apply(is_seed);
        }
        Vec::new()
    }

    /// Updates the remote-interest flag. An unchoked peer going uninterested
    /// frees a slot, which is refilled by an immediate re-rank, and a newly
    /// interested peer may claim a free regular slot right away; all other
    /// transitions wait for the next round.
    pub fn set_interested(
        &mut self,
        addr: SocketAddr,
        interested: bool,
        is_seed: bool,
    ) -> Vec<ChokeDecision> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        let was_unchoked = peer.unchoked;
        peer.interested = interested;

        if !interested && was_unchoked {
            return self.apply(is_seed);
        }
        if interested && self.unchoked_count() < UNCHOKE_SLOTS {
            return self.apply(is_seed);
        }
        Vec::new()
    }

    pub fn set_snubbed(&mut self, addr: SocketAddr, snubbed: bool) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.snubbed = snubbed;
        }
    }

    pub fn update_rates(&mut self, addr: SocketAddr, download_rate: u64, upload_rate: u64) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.download_rate = download_rate;
            peer.upload_rate = upload_rate;
        }
    }

    pub fn unchoked_count(&self) -> usize {
        self.peers.values().filter(|p| p.unchoked).count()
    }

    pub fn is_unchoked(&self, addr: SocketAddr) -> bool {
        self.peers.get(&addr).is_some_and(|p| p.unchoked)
    }

    /// Runs whichever rounds are due. Call on every timer sweep.
    pub fn maybe_round(&mut self, now: Instant, is_seed: bool) -> Vec<ChokeDecision> {
        let mut due = false;

        if now.duration_since(self.last_optimistic) >= OPTIMISTIC_INTERVAL {
            self.last_optimistic = now;
            self.pick_optimistic(now);
            due = true;
        }
        if now.duration_since(self.last_round) >= CHOKE_INTERVAL {
            self.last_round = now;
            due = true;
        }

        if due {
            self.apply(is_seed)
        } else {
            Vec::new()
        }
    }

    /// Ranks candidates and emits the flag changes.
    fn apply(&mut self, is_seed: bool) -> Vec<ChokeDecision> {
        // Drop a stale optimistic pick.
        if let Some(addr) = self.optimistic {
            if !self.peers.get(&addr).is_some_and(|p| p.interested) {
                self.optimistic = None;
            }
        }

        let mut ranked: Vec<(&SocketAddr, &Candidate)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.interested && !p.snubbed)
            .collect();

        ranked.sort_by(|(_, a), (_, b)| {
            let rate = |p: &Candidate| if is_seed { p.upload_rate } else { p.download_rate };
            rate(b).cmp(&rate(a)).then(a.insertion.cmp(&b.insertion))
        });

        let mut desired: Vec<SocketAddr> = ranked
            .iter()
            .take(UNCHOKE_SLOTS)
            .map(|(addr, _)| **addr)
            .collect();

        if let Some(opt) = self.optimistic {
            if !desired.contains(&opt) {
                desired.push(opt);
            }
        }

        let mut decisions = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            let unchoke = desired.contains(addr);
            if unchoke != peer.unchoked {
                peer.unchoked = unchoke;
                decisions.push(ChokeDecision {
                    addr: *addr,
                    unchoke,
                });
            }
        }
        decisions
    }

    /// Picks the optimistic peer from the interested-and-choked set, giving
    /// recent connections extra weight.
    fn pick_optimistic(&mut self, now: Instant) {
        let mut pool: Vec<SocketAddr> = Vec::new();

        for (addr, peer) in &self.peers {
            if !peer.interested || peer.unchoked {
                continue;
            }
            let weight = if now.duration_since(peer.connected_at) < OPTIMISTIC_INTERVAL {
                NEW_PEER_WEIGHT
            } else {
                1
            };
            for _ in 0..weight {
                pool.push(*addr);
            }
        }

        if pool.is_empty() {
            return;
        }
        let pick = pool[rand::rng().random_range(0..pool.len())];
        self.optimistic = Some(pick);
    }
}
