//! Per-peer protocol state.
//!
//! [`PeerConnection`] is the engine-side record of one wire connection: the
//! down half (their choke of us, our interest, the request pipeline, the
//! pinned writable chunk for the piece currently arriving) and the up half
//! (our choke of them, their interest, the send queue, the pinned read-only
//! chunk being served). All transitions run on the orchestrator; the socket
//! itself is pumped by a separate I/O task that only moves whole messages.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use super::bitfield::Bitfield;
use super::delegator::{pipe_size, BlockRequest};
use super::error::PeerError;
use super::peer_id::PeerId;
use crate::bandwidth::{NodeId, Rate};
use crate::chunks::{ChunkHandle, ChunkStore};
use crate::constants::{ENDGAME_SLOW_RATE, MAX_REQUEST_LENGTH, MAX_SEND_QUEUE, PEER_IDLE_TIMEOUT};

pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,

    /// Pieces the remote advertises.
    pub bitfield: Bitfield,

    // Down half.
    pub peer_choking: bool,
    pub am_interested: bool,
    pub request_list: Vec<BlockRequest>,
    pub down_stall: u32,
    pub down_node: NodeId,
    down_chunk: Option<ChunkHandle>,

    // Up half.
    pub am_choking: bool,
    pub peer_interested: bool,
    pub send_list: VecDeque<BlockRequest>,
    pub up_node: NodeId,
    /// Upload paused on quota exhaustion until the next throttle tick.
    pub up_starved: bool,
    up_chunk: Option<ChunkHandle>,

    pub snubbed: bool,
    pub connected_at: Instant,
    pub last_read: Instant,

    down_rate: Rate,
    up_rate: Rate,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    read_since_sweep: u64,
    received_any: bool,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        piece_count: usize,
        down_node: NodeId,
        up_node: NodeId,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            peer_id,
            bitfield: Bitfield::new(piece_count),
            peer_choking: true,
            am_interested: false,
            request_list: Vec::new(),
            down_stall: 0,
            down_node,
            down_chunk: None,
            am_choking: true,
            peer_interested: false,
            send_list: VecDeque::new(),
            up_node,
            up_starved: false,
            up_chunk: None,
            snubbed: false,
            connected_at: now,
            last_read: now,
            down_rate: Rate::new(),
            up_rate: Rate::new(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            read_since_sweep: 0,
            received_any: false,
        }
    }

    // ------------------------------------------------------------------
    // Down half
    // ------------------------------------------------------------------

    /// Applies the remote's bitfield. Legal only as the first message.
    pub fn set_bitfield(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        if self.received_any {
            return Err(PeerError::Protocol("bitfield after first message".into()));
        }
        self.received_any = true;

        self.bitfield = Bitfield::from_wire(bytes, self.bitfield.piece_count())
            .ok_or_else(|| PeerError::Protocol("bitfield size mismatch".into()))?;
        Ok(())
    }

    /// Applies a `have`. Returns whether the bit was newly set.
    pub fn on_have(&mut self, piece: u32) -> Result<bool, PeerError> {
        self.received_any = true;
        if piece as usize >= self.bitfield.piece_count() {
            return Err(PeerError::Protocol(format!("have for piece {piece} out of range")));
        }
        let newly = !self.bitfield.has(piece as usize);
        self.bitfield.set(piece as usize);
        Ok(newly)
    }

    /// Remote choked us: the pipeline is void. Returns the requests to hand
    /// back to the delegator.
    pub fn on_choke(&mut self) -> Vec<BlockRequest> {
        self.received_any = true;
        self.peer_choking = true;
        std::mem::take(&mut self.request_list)
    }

    pub fn on_unchoke(&mut self) {
        self.received_any = true;
        self.peer_choking = false;
    }

    /// True when the pipeline has room for another request.
    pub fn wants_more_requests(&mut self, now: Instant) -> bool {
        !self.peer_choking
            && self.am_interested
            && self.request_list.len() < pipe_size(self.down_rate.rate(now))
    }

    pub fn push_request(&mut self, request: BlockRequest) {
        self.request_list.push(request);
    }

    /// Whether this peer should be given requests right now. Stalled peers
    /// sit out endgame unless the whole download has slowed to a crawl.
    pub fn should_request(&self, endgame: bool, aggregate_down_rate: u64) -> bool {
        if self.peer_choking || !self.am_interested {
            return false;
        }
        if !endgame {
            return true;
        }
        self.down_stall <= 1 || aggregate_down_rate < ENDGAME_SLOW_RATE
    }

    /// An arriving `piece` message. Matches it against the pipeline, pins
    /// the piece's chunk, and copies the block into place. Returns the
    /// matched request, or `None` for a block we no longer want (a cancelled
    /// endgame duplicate).
    pub fn on_block(
        &mut self,
        store: &dyn ChunkStore,
        index: u32,
        begin: u32,
        data: &Bytes,
        now: Instant,
    ) -> Result<Option<BlockRequest>, PeerError> {
        self.received_any = true;
        self.note_read(data.len() as u64, now);
        self.down_stall = 0;

        let wanted = BlockRequest::new(index, begin, data.len() as u32);
        let Some(pos) = self.request_list.iter().position(|r| *r == wanted) else {
            return Ok(None);
        };
        self.request_list.remove(pos);

        self.load_down_chunk(store, index)?;
        let chunk = self
            .down_chunk
            .as_ref()
            .ok_or_else(|| PeerError::Internal("down chunk missing after load".into()))?;
        chunk.write_at(begin, data)?;

        self.bytes_downloaded += u64::from(wanted.length);
        self.down_rate.insert(now, u64::from(wanted.length));

        Ok(Some(wanted))
    }

    /// Pins the writable chunk for an incoming piece, reusing the pin while
    /// consecutive blocks land in the same piece.
    fn load_down_chunk(&mut self, store: &dyn ChunkStore, index: u32) -> Result<(), PeerError> {
        if self.down_chunk.as_ref().is_some_and(|c| c.index() == index) {
            return Ok(());
        }
        self.release_down_chunk();
        self.down_chunk = Some(store.get(index, true)?);
        Ok(())
    }

    pub fn release_down_chunk(&mut self) {
        self.down_chunk = None;
    }

    /// Piece index of the currently pinned incoming chunk, if any.
    pub fn down_chunk_index(&self) -> Option<u32> {
        self.down_chunk.as_ref().map(|c| c.index())
    }

    // ------------------------------------------------------------------
    // Up half
    // ------------------------------------------------------------------

    pub fn set_peer_interested(&mut self, interested: bool) {
        self.received_any = true;
        self.peer_interested = interested;
    }

    /// An incoming `request`. Oversized blocks and pieces we never
    /// advertised are protocol violations; requests while choked or
    /// duplicates are dropped. Returns whether the block was queued.
    pub fn queue_request(
        &mut self,
        request: BlockRequest,
        our_have: &Bitfield,
    ) -> Result<bool, PeerError> {
        self.received_any = true;

        if request.length > MAX_REQUEST_LENGTH || request.length == 0 {
            return Err(PeerError::Protocol(format!(
                "request length {} out of bounds",
                request.length
            )));
        }
        if !our_have.has(request.piece as usize) {
            return Err(PeerError::Protocol(format!(
                "request for piece {} we do not have",
                request.piece
            )));
        }

        if self.am_choking
            || self.send_list.contains(&request)
            || self.send_list.len() >= MAX_SEND_QUEUE
        {
            return Ok(false);
        }

        self.send_list.push_back(request);
        Ok(true)
    }

    pub fn on_cancel(&mut self, request: BlockRequest) {
        self.received_any = true;
        self.send_list.retain(|r| *r != request);
    }

    /// We choked the peer: its queue is void.
    pub fn set_am_choking(&mut self, choking: bool) {
        self.am_choking = choking;
        if choking {
            self.send_list.clear();
            self.release_up_chunk();
        }
    }

    pub fn next_send(&self) -> Option<BlockRequest> {
        self.send_list.front().copied()
    }

    /// Serves the head of the send queue: pins the piece read-only and
    /// copies the block out. The caller has already cleared upload quota
    /// for `length` bytes.
    pub fn take_block(
        &mut self,
        store: &dyn ChunkStore,
        now: Instant,
    ) -> Result<Option<(BlockRequest, Bytes)>, PeerError> {
        let Some(request) = self.send_list.pop_front() else {
            return Ok(None);
        };

        self.load_up_chunk(store, request.piece)?;
        let chunk = self
            .up_chunk
            .as_ref()
            .ok_or_else(|| PeerError::Internal("up chunk missing after load".into()))?;
        let data = chunk.read_at(request.offset, request.length)?;

        self.bytes_uploaded += u64::from(request.length);
        self.up_rate.insert(now, u64::from(request.length));

        Ok(Some((request, data)))
    }

    fn load_up_chunk(&mut self, store: &dyn ChunkStore, index: u32) -> Result<(), PeerError> {
        if self.up_chunk.as_ref().is_some_and(|c| c.index() == index) {
            return Ok(());
        }
        self.release_up_chunk();
        self.up_chunk = Some(store.get(index, false)?);
        Ok(())
    }

    pub fn release_up_chunk(&mut self) {
        self.up_chunk = None;
    }

    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------

    /// Marks non-piece traffic as read activity.
    pub fn note_read(&mut self, bytes: u64, now: Instant) {
        self.last_read = now;
        self.read_since_sweep += bytes;
    }

    /// Snub transitions are edge-triggered: the caller consults the choke
    /// manager exactly when this returns true.
    pub fn set_snubbed(&mut self, snubbed: bool) -> bool {
        if self.snubbed == snubbed {
            return false;
        }
        self.snubbed = snubbed;
        true
    }

    /// One-second maintenance pass: stall accounting and the idle verdict.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        if self.request_list.is_empty() {
            self.down_stall = 0;
        } else if self.read_since_sweep == 0 {
            self.down_stall += 1;
        } else {
            self.down_stall = 0;
        }
        self.read_since_sweep = 0;

        SweepOutcome {
            idle: now.duration_since(self.last_read) > PEER_IDLE_TIMEOUT,
            stalled: self.down_stall > 1,
        }
    }

    pub fn down_rate(&mut self, now: Instant) -> u64 {
        self.down_rate.rate(now)
    }

    pub fn up_rate(&mut self, now: Instant) -> u64 {
        self.up_rate.rate(now)
    }

    /// Drops every held resource before the connection record goes away.
    /// Outstanding requests must already be back with the delegator.
    pub fn close(&mut self) {
        self.release_down_chunk();
        self.release_up_chunk();
        self.send_list.clear();
        self.request_list.clear();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOutcome {
    pub idle: bool,
    pub stalled: bool,
}
