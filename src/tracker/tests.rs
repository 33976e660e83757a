use std::collections::BTreeMap;
use std::net::SocketAddr;

use super::http::{parse_announce_response, parse_scrape_response, scrape_url};
use super::list::EventVerdict;
use super::udp::{
    build_announce_request, build_connect_request, build_scrape_request, parse_connect_response,
    Reply, ACTION_CONNECT, ACTION_ERROR, PROTOCOL_MAGIC,
};
use super::*;
use crate::bencode::{encode, Value};
use crate::constants::SCRAPE_MIN_INTERVAL_SECS;
use crate::peer::PeerId;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn info() -> TrackerInfo {
    TrackerInfo {
        info_hash: [0x11; 20],
        obfuscated_hash: None,
        local_id: PeerId([0x22; 20]),
        key: 0xDEADBEEF,
    }
}

fn params() -> AnnounceParams {
    AnnounceParams {
        numwant: -1,
        uploaded: 1000,
        downloaded: 2000,
        left: 3000,
        port: 6881,
    }
}

#[test]
fn event_wire_values() {
    assert_eq!(TrackerEvent::None.as_str(), "");
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_str(), "completed");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn compact_codec_round_trip() {
    let peers = vec![addr("192.168.1.1:6881"), addr("10.0.0.1:51413")];
    let encoded = response::encode_compact_peers(&peers);
    assert_eq!(encoded.len(), 12);

    let decoded = parse_compact_peers(&encoded);
    assert_eq!(AddressList::new(decoded), AddressList::new(peers));
}

#[test]
fn address_list_sorts_and_dedupes() {
    let list = AddressList::new(vec![
        addr("10.0.0.2:6881"),
        addr("10.0.0.1:6881"),
        addr("10.0.0.2:6881"),
    ]);

    assert_eq!(list.len(), 2);
    assert_eq!(
        list.as_slice(),
        &[addr("10.0.0.1:6881"), addr("10.0.0.2:6881")]
    );
}

// ---------------------------------------------------------------------------
// HTTP responses
// ---------------------------------------------------------------------------

fn bencoded(entries: Vec<(&[u8], Value)>) -> Vec<u8> {
    let dict: BTreeMap<Vec<u8>, Value> = entries
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v))
        .collect();
    encode(&Value::Dict(dict))
}

#[test]
fn announce_response_compact_peers() {
    let peers = response::encode_compact_peers(&[addr("127.0.0.1:6881"), addr("127.0.0.2:6882")]);
    let body = bencoded(vec![
        (b"interval", Value::Integer(1800)),
        (b"complete", Value::Integer(10)),
        (b"incomplete", Value::Integer(5)),
        (b"peers", Value::Bytes(peers)),
    ]);

    let response = parse_announce_response(&body).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(10));
    assert_eq!(response.incomplete, Some(5));
    assert_eq!(response.peers.len(), 2);
}

#[test]
fn announce_response_dict_peers() {
    let peer = Value::Dict(
        [
            (b"ip".to_vec(), Value::Bytes(b"127.0.0.1".to_vec())),
            (b"port".to_vec(), Value::Integer(6881)),
        ]
        .into_iter()
        .collect(),
    );
    let body = bencoded(vec![
        (b"interval", Value::Integer(900)),
        (b"peers", Value::List(vec![peer])),
    ]);

    let response = parse_announce_response(&body).unwrap();
    assert_eq!(response.peers.as_slice(), &[addr("127.0.0.1:6881")]);
}

#[test]
fn announce_failure_reason() {
    let body = bencoded(vec![(
        b"failure reason",
        Value::Bytes(b"torrent not registered".to_vec()),
    )]);

    match parse_announce_response(&body) {
        Err(TrackerError::Failure(msg)) => assert_eq!(msg, "torrent not registered"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn announce_missing_interval_is_invalid() {
    let body = bencoded(vec![(b"peers", Value::Bytes(Vec::new()))]);
    assert!(matches!(
        parse_announce_response(&body),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn scrape_response_counters() {
    let hash = [0x11u8; 20];
    let entry = Value::Dict(
        [
            (b"complete".to_vec(), Value::Integer(42)),
            (b"downloaded".to_vec(), Value::Integer(1000)),
            (b"incomplete".to_vec(), Value::Integer(7)),
        ]
        .into_iter()
        .collect(),
    );
    let files = Value::Dict([(hash.to_vec(), entry)].into_iter().collect());
    let body = bencoded(vec![(b"files", files)]);

    let scrape = parse_scrape_response(&body, &hash).unwrap();
    assert_eq!(scrape.complete, 42);
    assert_eq!(scrape.downloaded, 1000);
    assert_eq!(scrape.incomplete, 7);
}

#[test]
fn scrape_url_derivation() {
    assert_eq!(
        scrape_url("http://tracker.example.com/announce").as_deref(),
        Some("http://tracker.example.com/scrape")
    );
    assert_eq!(
        scrape_url("http://tracker.example.com/announce?extra=1").as_deref(),
        Some("http://tracker.example.com/scrape?extra=1")
    );
    assert_eq!(scrape_url("http://tracker.example.com/peers"), None);
}

#[test]
fn http_tracker_rejects_non_http_urls() {
    assert!(HttpTracker::new("udp://tracker.example.com:80").is_err());
    assert!(HttpTracker::new("ftp://tracker.example.com").is_err());
}

// ---------------------------------------------------------------------------
// UDP packets
// ---------------------------------------------------------------------------

#[test]
fn connect_request_layout() {
    let request = build_connect_request(0x01020304);
    assert_eq!(request.len(), 16);
    assert_eq!(u64::from_be_bytes(request[..8].try_into().unwrap()), PROTOCOL_MAGIC);
    assert_eq!(
        u32::from_be_bytes(request[8..12].try_into().unwrap()),
        ACTION_CONNECT
    );
    assert_eq!(
        u32::from_be_bytes(request[12..16].try_into().unwrap()),
        0x01020304
    );
}

#[test]
fn connect_response_parsing() {
    let mut reply = Vec::new();
    reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    reply.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
    reply.extend_from_slice(&0x1122334455667788u64.to_be_bytes());

    assert_eq!(
        parse_connect_response(&reply, 0xAABBCCDD),
        Reply::Ok(0x1122334455667788)
    );

    // Wrong transaction id: discard, keep waiting.
    assert_eq!(parse_connect_response(&reply, 1), Reply::Ignore);

    // Truncated datagrams are discarded too.
    assert_eq!(parse_connect_response(&reply[..10], 0xAABBCCDD), Reply::Ignore);
}

#[test]
fn announce_request_is_98_bytes_big_endian() {
    let request =
        build_announce_request(0x0102030405060708, 0x99999999, &info(), &params(), TrackerEvent::Started);

    assert_eq!(request.len(), 98);
    assert_eq!(
        u64::from_be_bytes(request[..8].try_into().unwrap()),
        0x0102030405060708
    );
    assert_eq!(u32::from_be_bytes(request[8..12].try_into().unwrap()), 1);
    assert_eq!(&request[16..36], &[0x11; 20]);
    assert_eq!(&request[36..56], &[0x22; 20]);
    assert_eq!(u64::from_be_bytes(request[56..64].try_into().unwrap()), 2000);
    assert_eq!(u64::from_be_bytes(request[64..72].try_into().unwrap()), 3000);
    assert_eq!(u64::from_be_bytes(request[72..80].try_into().unwrap()), 1000);
    // started = 2
    assert_eq!(u32::from_be_bytes(request[80..84].try_into().unwrap()), 2);
    assert_eq!(u32::from_be_bytes(request[88..92].try_into().unwrap()), 0xDEADBEEF);
    assert_eq!(
        i32::from_be_bytes(request[92..96].try_into().unwrap()),
        -1
    );
    assert_eq!(u16::from_be_bytes(request[96..98].try_into().unwrap()), 6881);
}

#[test]
fn announce_response_parsing() {
    let peers = response::encode_compact_peers(&[addr("127.0.0.1:6881")]);
    let mut reply = Vec::new();
    reply.extend_from_slice(&1u32.to_be_bytes());
    reply.extend_from_slice(&7u32.to_be_bytes()); // txid
    reply.extend_from_slice(&1800u32.to_be_bytes()); // interval
    reply.extend_from_slice(&3u32.to_be_bytes()); // leechers
    reply.extend_from_slice(&9u32.to_be_bytes()); // seeders
    reply.extend_from_slice(&peers);

    match udp::parse_announce_response(&reply, 7, false) {
        Reply::Ok(response) => {
            assert_eq!(response.interval, 1800);
            assert_eq!(response.incomplete, Some(3));
            assert_eq!(response.complete, Some(9));
            assert_eq!(response.peers.as_slice(), &[addr("127.0.0.1:6881")]);
        }
        other => panic!("expected announce, got {other:?}"),
    }

    assert_eq!(
        udp::parse_announce_response(&reply, 8, false),
        Reply::Ignore
    );
}

#[test]
fn error_action_carries_message() {
    let mut reply = Vec::new();
    reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
    reply.extend_from_slice(&7u32.to_be_bytes());
    reply.extend_from_slice(b"swarm full");

    assert_eq!(
        udp::parse_announce_response(&reply, 7, false),
        Reply::Failed("swarm full".to_string())
    );
}

#[test]
fn scrape_packet_round_trip() {
    let request = build_scrape_request(0x55, 0x66, &[0x11; 20]);
    assert_eq!(request.len(), 36);

    let mut reply = Vec::new();
    reply.extend_from_slice(&2u32.to_be_bytes());
    reply.extend_from_slice(&0x66u32.to_be_bytes());
    reply.extend_from_slice(&5u32.to_be_bytes());
    reply.extend_from_slice(&100u32.to_be_bytes());
    reply.extend_from_slice(&2u32.to_be_bytes());

    match udp::parse_scrape_response(&reply, 0x66) {
        Reply::Ok(scrape) => {
            assert_eq!(scrape.complete, 5);
            assert_eq!(scrape.downloaded, 100);
            assert_eq!(scrape.incomplete, 2);
        }
        other => panic!("expected scrape, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tracker list
// ---------------------------------------------------------------------------

fn list_with(urls: &[(u32, &str)]) -> TrackerList {
    let mut list = TrackerList::new();
    for (group, url) in urls {
        list.insert(*group, url, false).unwrap();
    }
    list
}

fn assert_grouped(list: &TrackerList) {
    let groups: Vec<u32> = list.iter().map(|t| t.group).collect();
    let mut sorted = groups.clone();
    sorted.sort_unstable();
    assert_eq!(groups, sorted, "groups out of order: {groups:?}");
}

#[test]
fn insert_keeps_groups_ordered() {
    let mut list = TrackerList::new();
    list.insert(1, "http://b.example/announce", false).unwrap();
    list.insert(0, "http://a.example/announce", false).unwrap();
    list.insert(1, "udp://c.example:6969", false).unwrap();
    list.insert(0, "udp://d.example:6969", false).unwrap();

    assert_grouped(&list);
    assert_eq!(list.get(0).unwrap().url, "http://a.example/announce");
    assert_eq!(list.get(1).unwrap().url, "udp://d.example:6969");
    assert_eq!(list.size_group(), 2);
}

#[test]
fn unknown_scheme_skipped_unless_extra() {
    let mut list = TrackerList::new();
    assert_eq!(list.insert(0, "wss://t.example", false).unwrap(), None);
    assert!(list.is_empty());

    assert!(matches!(
        list.insert(0, "wss://t.example", true),
        Err(TrackerError::UnsupportedProtocol(_))
    ));
}

#[test]
fn kind_follows_scheme() {
    let list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "udp://b.example:6969"),
        (0, "dht://"),
    ]);

    assert_eq!(list.get(0).unwrap().kind, TrackerKind::Http);
    assert_eq!(list.get(1).unwrap().kind, TrackerKind::Udp);
    assert_eq!(list.get(2).unwrap().kind, TrackerKind::Dht);
    assert!(!list.get(2).unwrap().is_scrapable());
}

#[test]
fn promote_is_idempotent() {
    let mut list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "http://b.example/announce"),
        (0, "http://c.example/announce"),
    ]);

    let promoted = list.promote(2);
    assert_eq!(promoted, 0);
    assert_eq!(list.get(0).unwrap().url, "http://c.example/announce");

    // Promoting the promoted tracker changes nothing.
    assert_eq!(list.promote(promoted), 0);
    assert_eq!(list.get(0).unwrap().url, "http://c.example/announce");
    assert_grouped(&list);
}

#[test]
fn cycling_a_group_full_circle_is_identity() {
    let mut list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "http://b.example/announce"),
        (0, "http://c.example/announce"),
        (1, "http://z.example/announce"),
    ]);

    let before: Vec<String> = list.iter().map(|t| t.url.clone()).collect();

    list.cycle_group(0);
    assert_eq!(list.get(0).unwrap().url, "http://b.example/announce");
    // The other group is untouched.
    assert_eq!(list.get(3).unwrap().url, "http://z.example/announce");

    list.cycle_group(0);
    list.cycle_group(0);
    let after: Vec<String> = list.iter().map(|t| t.url.clone()).collect();
    assert_eq!(before, after);
}

#[test]
fn randomize_preserves_grouping() {
    let mut list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "http://b.example/announce"),
        (1, "http://c.example/announce"),
        (1, "http://d.example/announce"),
        (2, "http://e.example/announce"),
    ]);

    list.randomize_group_entries();
    assert_grouped(&list);
    assert_eq!(list.len(), 5);
}

#[test]
fn failover_prefers_earliest_retry() {
    let mut list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "http://b.example/announce"),
        (0, "http://c.example/announce"),
    ]);

    // a: two failures (backoff 120s), b: one failure (backoff 60s),
    // c: unfailed but its regular announce is far away.
    list.receive_failed(0, "down", 100);
    list.receive_failed(0, "down", 100);
    list.receive_failed(1, "down", 100);
    list.get_mut(2).unwrap().success_counter = 1;
    list.get_mut(2).unwrap().success_time_last = 0;

    let next = list.find_next_to_request(0).unwrap();
    assert_eq!(list.get(next).unwrap().url, "http://b.example/announce");
}

#[test]
fn unfailed_tracker_wins_when_due_sooner() {
    let mut list = list_with(&[
        (0, "http://a.example/announce"),
        (0, "http://b.example/announce"),
    ]);

    // a failed recently; b has never been asked.
    list.receive_failed(0, "down", 1000);
    let next = list.find_next_to_request(0).unwrap();
    assert_eq!(list.get(next).unwrap().url, "http://b.example/announce");
}

#[test]
fn backoff_grows_and_caps() {
    let mut list = list_with(&[(0, "http://a.example/announce")]);

    list.receive_failed(0, "down", 0);
    assert_eq!(list.get(0).unwrap().failed_time_next(), 60);

    for _ in 0..10 {
        list.receive_failed(0, "down", 0);
    }
    // min(30 * 2^11, 3600) caps at an hour.
    assert_eq!(list.get(0).unwrap().failed_time_next(), 3600);
}

#[test]
fn tracker_failover_scenario() {
    let mut list = list_with(&[
        (0, "http://first.example/announce"),
        (0, "http://second.example/announce"),
    ]);

    for _ in 0..3 {
        let verdict = list.send_event(0, TrackerEvent::Started);
        assert_eq!(verdict, EventVerdict::Dispatch { close_scrape: false });
        list.receive_failed(0, "503 service unavailable", 10);
    }

    let next = list.find_next_to_request(0).unwrap();
    assert_eq!(list.get(next).unwrap().url, "http://second.example/announce");

    list.send_event(next, TrackerEvent::Started);
    let mut peers = AddressList::new(vec![addr("10.0.0.1:6881")]);
    let promoted = list.receive_success(next, &mut peers, Some(1800), 20);

    // The successful tracker now leads its group.
    assert_eq!(promoted, 0);
    assert_eq!(list.get(0).unwrap().url, "http://second.example/announce");
    assert_eq!(list.get(0).unwrap().failed_counter, 0);
    assert_eq!(list.get(0).unwrap().success_counter, 1);
    assert_eq!(list.get(0).unwrap().latest_sum_peers, 1);
    assert_eq!(list.get(1).unwrap().url, "http://first.example/announce");
    assert_eq!(list.get(1).unwrap().failed_counter, 3);
}

#[test]
fn busy_tracker_skips_events_but_scrape_yields() {
    let mut list = list_with(&[(0, "udp://a.example:6969")]);

    assert_eq!(
        list.send_event(0, TrackerEvent::Started),
        EventVerdict::Dispatch { close_scrape: false }
    );
    // Busy with the announce: a second event is a no-op.
    assert_eq!(list.send_event(0, TrackerEvent::Stopped), EventVerdict::Busy);

    list.mark_idle(0);
    list.mark_scraping(0);
    // A scrape in flight is closed to make room for the event.
    assert_eq!(
        list.send_event(0, TrackerEvent::Completed),
        EventVerdict::Dispatch { close_scrape: true }
    );
}

#[test]
fn scrape_suppression_window() {
    let mut list = list_with(&[(0, "udp://a.example:6969")]);

    assert!(list.can_scrape(0, 0));
    list.mark_scraping(0);
    list.receive_scrape_success(0, 10, 2, 100);

    assert!(!list.can_scrape(0, 100 + SCRAPE_MIN_INTERVAL_SECS - 1));
    assert!(list.can_scrape(0, 100 + SCRAPE_MIN_INTERVAL_SECS));

    let tracker = list.get(0).unwrap();
    assert_eq!(tracker.scrape_counter, 1);
    assert_eq!(tracker.scrape_complete, 10);
    assert_eq!(tracker.scrape_incomplete, 2);
}

#[test]
fn disabled_tracker_is_unusable() {
    let mut list = list_with(&[(0, "http://a.example/announce")]);
    list.get_mut(0).unwrap().enabled = false;

    assert_eq!(
        list.send_event(0, TrackerEvent::Started),
        EventVerdict::Unusable
    );
    assert!(list.find_next_to_request(0).is_none());
    assert!(!list.has_usable());
}
