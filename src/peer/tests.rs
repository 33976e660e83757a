use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::*;
use crate::bandwidth::Throttle;
use crate::chunks::{ChunkStore, MemoryChunkStore};
use crate::constants::{
    BLOCK_SIZE, CHOKE_INTERVAL, MAX_SEND_QUEUE, OPTIMISTIC_INTERVAL, STRIKE_LIMIT, UNCHOKE_SLOTS,
};

fn addr(n: u8) -> SocketAddr {
    format!("10.0.0.{n}:6881").parse().unwrap()
}

fn connection(piece_count: usize) -> PeerConnection {
    let throttle = Throttle::unlimited();
    PeerConnection::new(
        addr(1),
        None,
        piece_count,
        throttle.insert_node(),
        throttle.insert_node(),
        Instant::now(),
    )
}

#[test]
fn peer_id_generation_and_tagging() {
    let id = PeerId::generate();
    assert_eq!(&id.as_bytes()[..8], b"-RS0001-");
    assert_eq!(id.azureus_style(), Some(("RS", "0001")));

    let id2 = PeerId::generate();
    assert_ne!(id.as_bytes(), id2.as_bytes());

    // Not every swarm member follows the convention.
    let raw = PeerId([0xAA; 20]);
    assert_eq!(raw.azureus_style(), None);
    assert!(PeerId::from_bytes(&[0u8; 19]).is_none());
}

#[test]
fn peer_id_displays_percent_encoded() {
    let plain = PeerId(*b"-RS0001-abcdefghijkl");
    assert_eq!(plain.to_string(), "-RS0001-abcdefghijkl");

    let binary = PeerId([0xFF; 20]);
    assert_eq!(binary.to_string(), "%FF".repeat(20));
}

#[test]
fn handshake_encode_decode() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, [1u8; 20]);
    assert_eq!(decoded.peer_id, [2u8; 20]);
    assert_eq!(decoded.reserved, [0u8; 8]);
}

#[test]
fn handshake_rejects_wrong_protocol() {
    let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).encode().to_vec();
    bytes[3] = b'X';
    assert!(matches!(
        Handshake::decode(&bytes),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn message_round_trips() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA5, 0x00])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"block data"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
    ];

    for msg in messages {
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }
}

#[test]
fn message_rejects_bad_lengths() {
    // `have` with a 3-byte payload.
    let bad = Bytes::from_static(&[0, 0, 0, 4, 4, 0, 0, 1]);
    assert!(Message::decode(bad).is_err());

    // Unknown id.
    let bad = Bytes::from_static(&[0, 0, 0, 1, 99]);
    assert!(matches!(
        Message::decode(bad),
        Err(PeerError::InvalidMessageId(99))
    ));
}

#[test]
fn pipe_size_scales_with_rate() {
    assert_eq!(pipe_size(0), 2);
    assert!(pipe_size(100 * 1024) > pipe_size(10 * 1024));
    assert_eq!(pipe_size(u64::MAX / 2), crate::constants::MAX_PIPE);
}

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

#[test]
fn bitfield_must_come_first() {
    let mut conn = connection(16);
    conn.on_have(3).unwrap();
    assert!(conn.set_bitfield(&[0xFF, 0xFF]).is_err());

    let mut conn = connection(16);
    conn.set_bitfield(&[0x80, 0x00]).unwrap();
    assert!(conn.bitfield.has(0));
    assert!(!conn.bitfield.has(1));
}

#[test]
fn have_out_of_range_is_protocol_error() {
    let mut conn = connection(8);
    assert!(conn.on_have(7).is_ok());
    assert!(matches!(conn.on_have(8), Err(PeerError::Protocol(_))));
}

#[test]
fn oversized_request_is_protocol_error() {
    let mut conn = connection(8);
    let mut have = Bitfield::new(8);
    have.set(0);

    let oversized = BlockRequest::new(0, 0, (1 << 17) + 1);
    assert!(conn.queue_request(oversized, &have).is_err());

    let missing = BlockRequest::new(5, 0, 16384);
    assert!(conn.queue_request(missing, &have).is_err());
}

#[test]
fn requests_while_choked_are_dropped() {
    let mut conn = connection(8);
    let mut have = Bitfield::new(8);
    have.set(0);

    let request = BlockRequest::new(0, 0, 16384);
    assert!(!conn.queue_request(request, &have).unwrap());

    conn.set_am_choking(false);
    assert!(conn.queue_request(request, &have).unwrap());
    // Duplicate is dropped, not queued twice.
    assert!(!conn.queue_request(request, &have).unwrap());
    assert_eq!(conn.send_list.len(), 1);
}

#[test]
fn send_queue_is_bounded() {
    let mut conn = connection(8);
    conn.set_am_choking(false);
    let mut have = Bitfield::new(8);
    have.set(0);

    for i in 0..MAX_SEND_QUEUE as u32 {
        let req = BlockRequest::new(0, i * 16, 16);
        assert!(conn.queue_request(req, &have).unwrap());
    }
    let overflow = BlockRequest::new(0, MAX_SEND_QUEUE as u32 * 16, 16);
    assert!(!conn.queue_request(overflow, &have).unwrap());
    assert_eq!(conn.send_list.len(), MAX_SEND_QUEUE);
}

#[test]
fn choking_clears_send_queue() {
    let mut conn = connection(8);
    conn.set_am_choking(false);
    let mut have = Bitfield::new(8);
    have.set(0);

    conn.queue_request(BlockRequest::new(0, 0, 16384), &have)
        .unwrap();
    conn.set_am_choking(true);
    assert!(conn.send_list.is_empty());
}

#[test]
fn cancel_removes_queued_block() {
    let mut conn = connection(8);
    conn.set_am_choking(false);
    let mut have = Bitfield::new(8);
    have.set(0);

    let request = BlockRequest::new(0, 0, 16384);
    conn.queue_request(request, &have).unwrap();
    conn.on_cancel(request);
    assert!(conn.send_list.is_empty());
}

#[test]
fn remote_choke_returns_pipeline() {
    let mut conn = connection(8);
    conn.on_unchoke();
    conn.am_interested = true;

    let a = BlockRequest::new(0, 0, 16384);
    let b = BlockRequest::new(0, 16384, 16384);
    conn.push_request(a);
    conn.push_request(b);

    let returned = conn.on_choke();
    assert_eq!(returned, vec![a, b]);
    assert!(conn.request_list.is_empty());
    assert!(conn.peer_choking);
}

#[test]
fn pipeline_is_bounded_by_pipe_size() {
    let mut conn = connection(8);
    conn.on_unchoke();
    conn.am_interested = true;

    let now = Instant::now();
    // Zero measured rate: pipe floor is MIN_PIPE (2).
    assert!(conn.wants_more_requests(now));
    conn.push_request(BlockRequest::new(0, 0, 16384));
    assert!(conn.wants_more_requests(now));
    conn.push_request(BlockRequest::new(0, 16384, 16384));
    assert!(!conn.wants_more_requests(now));
}

#[test]
fn block_arrival_writes_into_pinned_chunk() {
    let data = vec![0xABu8; 32768];
    let store = MemoryChunkStore::seeded(32768, &data);
    let empty = MemoryChunkStore::new(32768, 32768, vec![[0u8; 20]]);

    let mut conn = connection(1);
    conn.on_unchoke();
    conn.am_interested = true;

    let first = BlockRequest::new(0, 0, BLOCK_SIZE);
    let second = BlockRequest::new(0, BLOCK_SIZE, BLOCK_SIZE);
    conn.push_request(first);
    conn.push_request(second);

    let now = Instant::now();
    let block = store.get(0, false).unwrap().read_at(0, BLOCK_SIZE).unwrap();
    let matched = conn.on_block(empty.as_ref(), 0, 0, &block, now).unwrap();
    assert_eq!(matched, Some(first));
    assert_eq!(conn.request_list, vec![second]);
    assert_eq!(empty.pin_count(0), 1);

    // The bytes really landed in the store.
    let written = empty.get(0, false).unwrap().read_at(0, BLOCK_SIZE).unwrap();
    assert_eq!(&written[..], &data[..BLOCK_SIZE as usize]);

    conn.close();
    assert_eq!(empty.pin_count(0), 0);
}

#[test]
fn unsolicited_block_is_ignored() {
    let store = MemoryChunkStore::new(16384, 16384, vec![[0u8; 20]]);
    let mut conn = connection(1);

    let data = Bytes::from(vec![0u8; 16384]);
    let matched = conn
        .on_block(store.as_ref(), 0, 0, &data, Instant::now())
        .unwrap();
    assert_eq!(matched, None);
    assert_eq!(store.pin_count(0), 0);
}

#[test]
fn stall_counting_over_sweeps() {
    let mut conn = connection(8);
    conn.on_unchoke();
    conn.am_interested = true;
    conn.push_request(BlockRequest::new(0, 0, 16384));

    let now = Instant::now();
    conn.sweep(now);
    conn.sweep(now + Duration::from_secs(1));
    assert_eq!(conn.down_stall, 2);
    assert!(conn.sweep(now + Duration::from_secs(2)).stalled);

    // Any read resets the counter.
    conn.note_read(100, now + Duration::from_secs(3));
    conn.sweep(now + Duration::from_secs(3));
    assert_eq!(conn.down_stall, 0);
}

#[test]
fn stalled_peers_sit_out_fast_endgame() {
    let mut conn = connection(8);
    conn.on_unchoke();
    conn.am_interested = true;
    conn.down_stall = 2;

    assert!(conn.should_request(false, 1 << 20));
    assert!(!conn.should_request(true, 1 << 20));
    // Slow aggregate rate lets stalled peers back in.
    assert!(conn.should_request(true, 1024));
}

#[test]
fn snub_transitions_are_edge_triggered() {
    let mut conn = connection(8);
    assert!(conn.set_snubbed(true));
    assert!(!conn.set_snubbed(true));
    assert!(conn.set_snubbed(false));
}

// ---------------------------------------------------------------------------
// Delegator
// ---------------------------------------------------------------------------

#[test]
fn rarest_piece_is_picked_first() {
    let mut delegator = RequestDelegator::new(4, 16384, 4 * 16384);

    let full = Bitfield::full(4);
    let mut partial_peer = Bitfield::new(4);
    partial_peer.set(0);
    partial_peer.set(1);
    partial_peer.set(3);

    delegator.peer_connected(&full);
    delegator.peer_connected(&partial_peer);

    // Piece 2 is on one peer only.
    let block = delegator.delegate(addr(1), &full).unwrap();
    assert_eq!(block.piece, 2);
}

#[test]
fn partial_pieces_finish_before_new_ones() {
    let mut delegator = RequestDelegator::new(4, 2 * 16384, 8 * 16384);
    let full = Bitfield::full(4);
    delegator.peer_connected(&full);

    let first = delegator.delegate(addr(1), &full).unwrap();
    let second = delegator.delegate(addr(1), &full).unwrap();
    // Second block continues the piece the first one started.
    assert_eq!(first.piece, second.piece);
    assert_ne!(first.offset, second.offset);
}

#[test]
fn interest_follows_selector_wants() {
    let mut delegator = RequestDelegator::new(2, 16384, 2 * 16384);
    let mut theirs = Bitfield::new(2);
    assert!(!delegator.wants_any(&theirs));

    theirs.set(1);
    assert!(delegator.wants_any(&theirs));

    delegator.set_have(1);
    assert!(!delegator.wants_any(&theirs));
}

#[test]
fn endgame_duplicates_and_cancels() {
    // One piece, three blocks: endgame from the start.
    let mut delegator = RequestDelegator::new(1, 3 * BLOCK_SIZE, u64::from(3 * BLOCK_SIZE));
    let full = Bitfield::full(1);
    delegator.peer_connected(&full);
    delegator.peer_connected(&full);

    let a = addr(1);
    let b = addr(2);

    // Peer A reserves all three blocks.
    let a0 = delegator.delegate(a, &full).unwrap();
    delegator.delegate(a, &full).unwrap();
    delegator.delegate(a, &full).unwrap();

    // Peer A has nothing left to duplicate onto itself.
    assert!(delegator.delegate(a, &full).is_none());

    // Peer B duplicates A's outstanding block.
    let b0 = delegator.delegate(b, &full).unwrap();
    assert_eq!(a0, b0);

    // First arrival cancels the other reservation.
    let (filled, cancels) = delegator.record_block(b, b0);
    assert!(!filled);
    assert_eq!(cancels, vec![(a, a0)]);
}

#[test]
fn returned_blocks_are_redelegated() {
    let mut delegator = RequestDelegator::new(1, 2 * BLOCK_SIZE, u64::from(2 * BLOCK_SIZE));
    let full = Bitfield::full(1);
    delegator.peer_connected(&full);

    let a = addr(1);
    let first = delegator.delegate(a, &full).unwrap();
    delegator.delegate(a, &full).unwrap();

    delegator.return_blocks(a);

    // A fresh peer can pick the same blocks again without duplication.
    let b = addr(2);
    let again = delegator.delegate(b, &full).unwrap();
    assert_eq!(again, first);
}

#[test]
fn failed_piece_strikes_and_bans() {
    let mut delegator = RequestDelegator::new(1, BLOCK_SIZE, u64::from(BLOCK_SIZE));
    let full = Bitfield::full(1);
    delegator.peer_connected(&full);

    let peer = addr(1);
    for round in 1..=STRIKE_LIMIT {
        let block = delegator.delegate(peer, &full).unwrap();
        let (filled, _) = delegator.record_block(peer, block);
        assert!(filled);

        let outcome = delegator.piece_completed(0, false);
        assert_eq!(delegator.strikes(peer), round);
        if round < STRIKE_LIMIT {
            assert!(outcome.banned.is_empty());
        } else {
            assert_eq!(outcome.banned, vec![peer]);
        }
    }

    // The failed piece is downloadable again.
    assert!(!delegator.have().has(0));
    assert!(delegator.delegate(peer, &full).is_some());
}

#[test]
fn completed_piece_updates_have() {
    let mut delegator = RequestDelegator::new(1, BLOCK_SIZE, u64::from(BLOCK_SIZE));
    let full = Bitfield::full(1);
    delegator.peer_connected(&full);

    let peer = addr(1);
    let block = delegator.delegate(peer, &full).unwrap();
    let (filled, _) = delegator.record_block(peer, block);
    assert!(filled);

    delegator.piece_completed(0, true);
    assert!(delegator.have().has(0));
    assert!(delegator.is_complete());
    assert_eq!(delegator.remaining_blocks(), 0);
}

// ---------------------------------------------------------------------------
// Choke manager
// ---------------------------------------------------------------------------

#[test]
fn choke_rounds_bound_unchoked_set() {
    let start = Instant::now();
    let mut manager = ChokeManager::new(start);

    for n in 1..=6 {
        let peer = addr(n);
        manager.insert(peer, start);
        manager.update_rates(peer, u64::from(n) * 1000, 0);
        manager.set_interested(peer, true, false);
    }

    // Two regular rounds and one optimistic round.
    manager.maybe_round(start + CHOKE_INTERVAL, false);
    manager.maybe_round(start + 2 * CHOKE_INTERVAL, false);
    manager.maybe_round(start + OPTIMISTIC_INTERVAL, false);

    let unchoked = manager.unchoked_count();
    assert!(unchoked <= UNCHOKE_SLOTS + 1);
    assert!(unchoked >= UNCHOKE_SLOTS);

    // The top four by download rate hold the regular slots.
    for n in 3..=6 {
        assert!(manager.is_unchoked(addr(n)), "peer {n} should be unchoked");
    }
}

#[test]
fn uninterested_unchoked_peer_triggers_refill() {
    let start = Instant::now();
    let mut manager = ChokeManager::new(start);

    for n in 1..=5 {
        let peer = addr(n);
        manager.insert(peer, start);
        manager.update_rates(peer, u64::from(n) * 1000, 0);
        manager.set_interested(peer, true, false);
    }

    manager.maybe_round(start + CHOKE_INTERVAL, false);
    assert!(manager.is_unchoked(addr(5)));
    assert!(!manager.is_unchoked(addr(1)));

    // Slot is refilled immediately, without waiting for the next round.
    let decisions = manager.set_interested(addr(5), false, false);
    assert!(decisions.contains(&ChokeDecision {
        addr: addr(5),
        unchoke: false
    }));
    assert!(manager.is_unchoked(addr(1)));
}

#[test]
fn snubbed_peers_lose_regular_slots() {
    let start = Instant::now();
    let mut manager = ChokeManager::new(start);

    for n in 1..=5 {
        let peer = addr(n);
        manager.insert(peer, start);
        manager.update_rates(peer, u64::from(n) * 1000, 0);
        manager.set_interested(peer, true, false);
    }
    manager.set_snubbed(addr(5), true);

    manager.maybe_round(start + CHOKE_INTERVAL, false);
    assert!(!manager.is_unchoked(addr(5)));
    assert!(manager.is_unchoked(addr(1)));
}

#[test]
fn seed_ranking_uses_upload_rate() {
    let start = Instant::now();
    let mut manager = ChokeManager::new(start);

    for n in 1..=5 {
        let peer = addr(n);
        manager.insert(peer, start);
        // Download ranking would favor high n; upload favors low n.
        manager.update_rates(peer, u64::from(n) * 1000, u64::from(6 - n) * 1000);
        manager.set_interested(peer, true, true);
    }

    manager.maybe_round(start + CHOKE_INTERVAL, true);
    assert!(manager.is_unchoked(addr(1)));
    assert!(!manager.is_unchoked(addr(5)));
}

#[test]
fn removing_optimistic_peer_refills_slot() {
    let start = Instant::now();
    let mut manager = ChokeManager::new(start);

    for n in 1..=6 {
        let peer = addr(n);
        manager.insert(peer, start);
        manager.update_rates(peer, u64::from(n) * 1000, 0);
        manager.set_interested(peer, true, false);
    }

    manager.maybe_round(start + OPTIMISTIC_INTERVAL, false);

    // Find the optimistic pick (unchoked but outside the top four).
    let optimistic: Vec<SocketAddr> = (1..=2)
        .map(addr)
        .filter(|&a| manager.is_unchoked(a))
        .collect();

    for peer in optimistic {
        let decisions = manager.remove(peer, false, start + OPTIMISTIC_INTERVAL);
        // The freed slot goes to the other low-rate peer, if any remained.
        for decision in decisions {
            assert!(decision.unchoke);
        }
    }
    assert!(manager.unchoked_count() <= UNCHOKE_SLOTS + 1);
}
