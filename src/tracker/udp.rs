//! UDP tracker worker (BEP-15).
//!
//! Wire packets are built and parsed by pure functions so the codec is
//! testable without sockets; [`UdpTracker`] wraps them in the two-step
//! connect/announce exchange with the standard `15 * 2^n` retransmit
//! schedule. Datagrams whose transaction id or action do not match the
//! outstanding request are discarded, not treated as errors.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout_at;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceResponse, ScrapeResponse, TrackerEvent,
};
use super::{AnnounceParams, TrackerInfo};
use crate::constants::{UDP_CONNECTION_ID_TTL, UDP_MAX_ATTEMPT, UDP_RETRY_BASE};

/// Magic number opening every connect request.
pub const PROTOCOL_MAGIC: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

/// Outcome of parsing one datagram against an outstanding request.
#[derive(Debug, PartialEq)]
pub enum Reply<T> {
    /// The awaited response.
    Ok(T),
    /// Tracker error action with a message.
    Failed(String),
    /// Wrong transaction id or action; keep waiting.
    Ignore,
}

pub fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_MAGIC);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

pub fn parse_connect_response(data: &[u8], transaction_id: u32) -> Reply<u64> {
    let Some((action, tid, mut body)) = split_header(data) else {
        return Reply::Ignore;
    };
    if tid != transaction_id {
        return Reply::Ignore;
    }
    match action {
        ACTION_CONNECT if body.remaining() >= 8 => Reply::Ok(body.get_u64()),
        ACTION_ERROR => Reply::Failed(error_message(body)),
        _ => Reply::Ignore,
    }
}

/// The 98-byte announce request.
pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    info: &TrackerInfo,
    params: &AnnounceParams,
    event: TrackerEvent,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&info.info_hash);
    buf.put_slice(info.local_id.as_bytes());
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_u32(event.as_udp_id());
    buf.put_u32(0); // IP address: let the tracker use the source
    buf.put_u32(info.key);
    buf.put_i32(params.numwant);
    buf.put_u16(params.port);

    debug_assert_eq!(buf.len(), 98);
    buf.to_vec()
}

pub fn parse_announce_response(
    data: &[u8],
    transaction_id: u32,
    ipv6: bool,
) -> Reply<AnnounceResponse> {
    let Some((action, tid, mut body)) = split_header(data) else {
        return Reply::Ignore;
    };
    if tid != transaction_id {
        return Reply::Ignore;
    }
    match action {
        ACTION_ANNOUNCE if body.remaining() >= 12 => {
            let interval = body.get_u32();
            let leechers = body.get_u32();
            let seeders = body.get_u32();

            let mut response = AnnounceResponse::new(interval);
            response.complete = Some(seeders);
            response.incomplete = Some(leechers);
            response.peers.extend(if ipv6 {
                parse_compact_peers6(body)
            } else {
                parse_compact_peers(body)
            });
            Reply::Ok(response)
        }
        ACTION_ERROR => Reply::Failed(error_message(body)),
        _ => Reply::Ignore,
    }
}

pub fn build_scrape_request(connection_id: u64, transaction_id: u32, info_hash: &[u8; 20]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(36);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_SCRAPE);
    buf.put_u32(transaction_id);
    buf.put_slice(info_hash);
    buf.to_vec()
}

pub fn parse_scrape_response(data: &[u8], transaction_id: u32) -> Reply<ScrapeResponse> {
    let Some((action, tid, mut body)) = split_header(data) else {
        return Reply::Ignore;
    };
    if tid != transaction_id {
        return Reply::Ignore;
    }
    match action {
        ACTION_SCRAPE if body.remaining() >= 12 => Reply::Ok(ScrapeResponse {
            complete: body.get_u32(),
            downloaded: body.get_u32(),
            incomplete: body.get_u32(),
        }),
        ACTION_ERROR => Reply::Failed(error_message(body)),
        _ => Reply::Ignore,
    }
}

fn split_header(data: &[u8]) -> Option<(u32, u32, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let tid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Some((action, tid, &data[8..]))
}

fn error_message(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

/// A UDP tracker endpoint with its cached connection id.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    /// Resolves a `udp://host:port/...` URL and binds a socket of the
    /// matching address family.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let authority = parse_udp_url(url)?;

        let addr = lookup_host(authority)
            .await
            .map_err(TrackerError::Io)?
            .next()
            .ok_or_else(|| TrackerError::InvalidUrl(format!("unresolvable: {url}")))?;

        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        Ok(Self {
            socket,
            addr,
            connection: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn announce(
        &mut self,
        info: &TrackerInfo,
        params: &AnnounceParams,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::random();
        let request = build_announce_request(connection_id, transaction_id, info, params, event);
        let ipv6 = self.addr.is_ipv6();

        self.exchange(&request, |data| {
            parse_announce_response(data, transaction_id, ipv6)
        })
        .await
    }

    pub async fn scrape(&mut self, info: &TrackerInfo) -> Result<ScrapeResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::random();
        let request = build_scrape_request(connection_id, transaction_id, &info.info_hash);

        self.exchange(&request, |data| {
            parse_scrape_response(data, transaction_id)
        })
        .await
    }

    /// Returns the cached connection id, running the connect exchange when
    /// it is missing or older than its 60s validity.
    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, at)) = self.connection {
            if at.elapsed() < UDP_CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::random();
        let request = build_connect_request(transaction_id);

        let id = self
            .exchange(&request, |data| parse_connect_response(data, transaction_id))
            .await?;
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Sends `request` and waits for a matching reply, retransmitting on the
    /// BEP-15 schedule: attempt `n` waits `15 * 2^n` seconds, giving up
    /// after attempt 8.
    async fn exchange<T>(
        &self,
        request: &[u8],
        mut parse: impl FnMut(&[u8]) -> Reply<T>,
    ) -> Result<T, TrackerError> {
        let mut buf = vec![0u8; 4096];

        for attempt in 0..=UDP_MAX_ATTEMPT {
            self.socket.send(request).await?;

            let deadline = tokio::time::Instant::now() + UDP_RETRY_BASE * (1 << attempt);

            loop {
                let received = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => break, // retransmit
                };

                match parse(&buf[..received]) {
                    Reply::Ok(value) => return Ok(value),
                    Reply::Failed(msg) => return Err(TrackerError::Failure(msg)),
                    Reply::Ignore => continue,
                }
            }
        }

        Err(TrackerError::Timeout)
    }
}

fn parse_udp_url(url: &str) -> Result<String, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() || !authority.contains(':') {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }

    Ok(authority.to_string())
}
