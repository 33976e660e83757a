//! Piece selection and block delegation.
//!
//! The delegator owns our bitfield, per-piece availability, and every
//! outstanding block reservation across peers. Connections ask it which
//! block to request next; it prefers finishing partial pieces, then
//! rarest-first among new ones, and in endgame hands the same block to
//! several peers so the last few arrivals never wait on one slow sender.
//!
//! Hash verdicts come back through [`RequestDelegator::piece_completed`]:
//! a failed piece voids its reservations and received blocks and gives
//! every contributing peer a strike; three strikes and the orchestrator
//! disconnects the peer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use super::bitfield::Bitfield;
use crate::chunks::piece_size;
use crate::constants::{
    BLOCK_SIZE, ENDGAME_BLOCK_THRESHOLD, MAX_PIPE, MIN_PIPE, PIPE_BASE, PIPE_GRANULARITY,
    STRIKE_LIMIT,
};

/// A block: the unit of peer requests, at most 128KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// Request pipeline depth as a function of the peer's download rate.
pub fn pipe_size(rate: u64) -> usize {
    (PIPE_BASE + (rate / PIPE_GRANULARITY) as usize).clamp(MIN_PIPE, MAX_PIPE)
}

#[derive(Debug, Default)]
struct PartialPiece {
    received: HashSet<u32>,
    /// offset -> peers with an outstanding request for that block.
    reservations: HashMap<u32, Vec<SocketAddr>>,
    /// Peers that supplied at least one received block.
    contributors: HashSet<SocketAddr>,
}

/// Outcome of a hash verdict.
#[derive(Debug, Default)]
pub struct CompletionOutcome {
    /// Peers that reached the strike limit and must be disconnected.
    pub banned: Vec<SocketAddr>,
}

pub struct RequestDelegator {
    piece_count: u32,
    piece_length: u32,
    total_length: u64,
    have: Bitfield,
    availability: Vec<u32>,
    partials: BTreeMap<u32, PartialPiece>,
    strikes: HashMap<SocketAddr, u32>,
    total_blocks: usize,
    received_blocks: usize,
}

impl RequestDelegator {
    pub fn new(piece_count: u32, piece_length: u32, total_length: u64) -> Self {
        let total_blocks = (0..piece_count)
            .map(|i| block_count(piece_size(piece_length, total_length, piece_count, i)))
            .sum();
        Self {
            piece_count,
            piece_length,
            total_length,
            have: Bitfield::new(piece_count as usize),
            availability: vec![0; piece_count as usize],
            partials: BTreeMap::new(),
            strikes: HashMap::new(),
            total_blocks,
            received_blocks: 0,
        }
    }

    /// Marks pieces we already hold (resume). Counts their blocks received.
    pub fn set_have(&mut self, index: u32) {
        if index < self.piece_count && !self.have.has(index as usize) {
            self.have.set(index as usize);
            self.received_blocks += block_count(self.piece_size(index));
        }
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        piece_size(self.piece_length, self.total_length, self.piece_count, index)
    }

    /// Blocks not yet received, torrent-wide.
    pub fn remaining_blocks(&self) -> usize {
        self.total_blocks - self.received_blocks
    }

    pub fn in_endgame(&self) -> bool {
        let remaining = self.remaining_blocks();
        remaining > 0 && remaining < ENDGAME_BLOCK_THRESHOLD
    }

    /// Whether the selector wants anything this peer advertises; drives our
    /// interest flag.
    pub fn wants_any(&self, theirs: &Bitfield) -> bool {
        theirs.has_missing_in(&self.have)
    }

    pub fn peer_connected(&mut self, theirs: &Bitfield) {
        for index in 0..self.piece_count as usize {
            if theirs.has(index) {
                self.availability[index] += 1;
            }
        }
    }

    pub fn peer_disconnected(&mut self, peer: SocketAddr, theirs: &Bitfield) {
        for index in 0..self.piece_count as usize {
            if theirs.has(index) {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
        self.return_blocks(peer);
    }

    /// A `have` broadcast from the peer.
    pub fn peer_has(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Picks the next block `peer` should request, reserving it. Returns
    /// `None` when the peer has nothing useful left.
    pub fn delegate(&mut self, peer: SocketAddr, theirs: &Bitfield) -> Option<BlockRequest> {
        // Finish partial pieces the peer has first.
        for (&index, partial) in self.partials.iter_mut() {
            if !theirs.has(index as usize) {
                continue;
            }
            let length = piece_size(self.piece_length, self.total_length, self.piece_count, index);
            if let Some(offset) = next_free_block(partial, length) {
                partial.reservations.entry(offset).or_default().push(peer);
                return Some(BlockRequest::new(index, offset, block_length(length, offset)));
            }
        }

        // Rarest-first among pieces we lack and have not started.
        if let Some(index) = self.rarest_new_piece(theirs) {
            let length = self.piece_size(index);
            let partial = self.partials.entry(index).or_default();
            partial.reservations.entry(0).or_default().push(peer);
            return Some(BlockRequest::new(index, 0, block_length(length, 0)));
        }

        // Endgame: duplicate an outstanding reservation, never our own.
        if self.in_endgame() {
            for (&index, partial) in self.partials.iter_mut() {
                if !theirs.has(index as usize) {
                    continue;
                }
                let length =
                    piece_size(self.piece_length, self.total_length, self.piece_count, index);
                if let Some(offset) = next_duplicate_block(partial, length, peer) {
                    partial.reservations.entry(offset).or_default().push(peer);
                    return Some(BlockRequest::new(index, offset, block_length(length, offset)));
                }
            }
        }

        None
    }

    /// Records an arrived block. Returns whether the piece now has every
    /// block, plus the duplicate reservations other peers hold for this
    /// block so the caller can send `cancel`.
    pub fn record_block(
        &mut self,
        peer: SocketAddr,
        block: BlockRequest,
    ) -> (bool, Vec<(SocketAddr, BlockRequest)>) {
        let Some(partial) = self.partials.get_mut(&block.piece) else {
            // Unsolicited or already-voided piece; nothing tracked.
            return (false, Vec::new());
        };

        let mut cancels = Vec::new();
        if let Some(holders) = partial.reservations.remove(&block.offset) {
            for holder in holders {
                if holder != peer {
                    cancels.push((holder, block));
                }
            }
        }

        if partial.received.insert(block.offset) {
            self.received_blocks += 1;
        }
        partial.contributors.insert(peer);

        let length = piece_size(
            self.piece_length,
            self.total_length,
            self.piece_count,
            block.piece,
        );
        let filled = partial.received.len() == block_count(length);
        (filled, cancels)
    }

    /// Releases every reservation `peer` holds (choke or disconnect).
    pub fn return_blocks(&mut self, peer: SocketAddr) {
        for partial in self.partials.values_mut() {
            for holders in partial.reservations.values_mut() {
                holders.retain(|&p| p != peer);
            }
            partial.reservations.retain(|_, holders| !holders.is_empty());
        }
    }

    /// Applies the chunk store's hash verdict for a filled piece.
    pub fn piece_completed(&mut self, index: u32, ok: bool) -> CompletionOutcome {
        let mut outcome = CompletionOutcome::default();
        let Some(partial) = self.partials.remove(&index) else {
            return outcome;
        };

        if ok {
            self.have.set(index as usize);
            tracing::debug!(piece = index, "piece complete");
            return outcome;
        }

        // Bad hash: the piece is missing again and every contributor is
        // suspect.
        self.received_blocks -= partial.received.len();
        for peer in partial.contributors {
            let strikes = self.strikes.entry(peer).or_insert(0);
            *strikes += 1;
            tracing::debug!(piece = index, %peer, strikes = *strikes, "hash fail strike");
            if *strikes >= STRIKE_LIMIT {
                outcome.banned.push(peer);
            }
        }
        outcome
    }

    pub fn strikes(&self, peer: SocketAddr) -> u32 {
        self.strikes.get(&peer).copied().unwrap_or(0)
    }

    /// Clears strike history for a departed peer.
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.strikes.remove(&peer);
    }

    fn rarest_new_piece(&self, theirs: &Bitfield) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for index in 0..self.piece_count {
            if self.have.has(index as usize)
                || self.partials.contains_key(&index)
                || !theirs.has(index as usize)
            {
                continue;
            }
            let avail = self.availability[index as usize];
            match best {
                Some((best_avail, _)) if best_avail <= avail => {}
                _ => best = Some((avail, index)),
            }
        }
        best.map(|(_, index)| index)
    }
}

fn block_count(piece_length: u32) -> usize {
    piece_length.div_ceil(BLOCK_SIZE) as usize
}

fn block_length(piece_length: u32, offset: u32) -> u32 {
    (piece_length - offset).min(BLOCK_SIZE)
}

/// First block with no reservation and no data.
fn next_free_block(partial: &PartialPiece, piece_length: u32) -> Option<u32> {
    let mut offset = 0;
    while offset < piece_length {
        if !partial.received.contains(&offset) && !partial.reservations.contains_key(&offset) {
            return Some(offset);
        }
        offset += BLOCK_SIZE;
    }
    None
}

/// First block missing data that `peer` has not already reserved.
fn next_duplicate_block(partial: &PartialPiece, piece_length: u32, peer: SocketAddr) -> Option<u32> {
    let mut offset = 0;
    while offset < piece_length {
        if !partial.received.contains(&offset)
            && !partial
                .reservations
                .get(&offset)
                .is_some_and(|holders| holders.contains(&peer))
        {
            return Some(offset);
        }
        offset += BLOCK_SIZE;
    }
    None
}
