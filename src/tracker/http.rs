use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceResponse, ScrapeResponse, TrackerEvent,
};
use super::{AnnounceParams, TrackerInfo};
use crate::bencode::decode;
use crate::constants::{HTTP_TRACKER_TIMEOUT, USER_AGENT};

/// An HTTP(S) tracker worker (BEP-3, compact responses per BEP-23).
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        Self::with_timeout(url, HTTP_TRACKER_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(
        &self,
        info: &TrackerInfo,
        params: &AnnounceParams,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        // The peer id's Display is already the percent-encoded wire form.
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={:08x}",
            self.url,
            url_encode(&info.info_hash),
            info.local_id,
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            info.key,
        );

        // Negative numwant leaves the choice to the server.
        if params.numwant >= 0 {
            url.push_str(&format!("&numwant={}", params.numwant));
        }

        let event_str = event.as_str();
        if !event_str.is_empty() {
            url.push_str(&format!("&event={event_str}"));
        }

        tracing::trace!(url = %self.url, event = event_str, "http announce");

        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;

        parse_announce_response(&bytes)
    }

    pub async fn scrape(&self, info: &TrackerInfo) -> Result<ScrapeResponse, TrackerError> {
        let url = scrape_url(&self.url).ok_or(TrackerError::ScrapeUnsupported)?;
        let url = format!("{}?info_hash={}", url, url_encode(&info.info_hash));

        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;

        parse_scrape_response(&bytes, &info.info_hash)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Parses a bencoded announce reply.
pub fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(bytes)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("expected dict".into()))?;

    if let Some(failure) = dict.get(b"failure reason".as_slice()).and_then(|v| v.as_str()) {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer())
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?
        as u32;

    let mut response = AnnounceResponse::new(interval);

    response.min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.complete = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    if let Some(peers) = dict.get(b"peers".as_slice()) {
        if let Some(bytes) = peers.as_bytes() {
            response.peers.extend(parse_compact_peers(bytes));
        } else if let Some(list) = peers.as_list() {
            // Dictionary peer model from the original BEP-3 form.
            let addrs = list.iter().filter_map(|peer| {
                let dict = peer.as_dict()?;
                let ip = dict.get(b"ip".as_slice())?.as_str()?.parse().ok()?;
                let port = dict.get(b"port".as_slice())?.as_integer()? as u16;
                Some(std::net::SocketAddr::new(ip, port))
            });
            response.peers.extend(addrs);
        }
    }

    if let Some(peers6) = dict.get(b"peers6".as_slice()).and_then(|v| v.as_bytes()) {
        response.peers.extend(parse_compact_peers6(peers6));
    }

    Ok(response)
}

/// Parses a bencoded scrape reply, returning the counters for `info_hash`.
pub fn parse_scrape_response(
    bytes: &[u8],
    info_hash: &[u8; 20],
) -> Result<ScrapeResponse, TrackerError> {
    let value = decode(bytes)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("expected dict".into()))?;

    if let Some(failure) = dict.get(b"failure reason".as_slice()).and_then(|v| v.as_str()) {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let files = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| TrackerError::InvalidResponse("missing files".into()))?;

    let entry = files
        .get(info_hash.as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| TrackerError::InvalidResponse("info hash not in scrape".into()))?;

    let field = |name: &[u8]| {
        entry
            .get(name)
            .and_then(|v| v.as_integer())
            .unwrap_or(0) as u32
    };

    Ok(ScrapeResponse {
        complete: field(b"complete"),
        downloaded: field(b"downloaded"),
        incomplete: field(b"incomplete"),
    })
}

/// Derives the scrape URL from an announce URL: the last path segment must
/// start with `announce` (BEP-48 convention).
pub fn scrape_url(announce: &str) -> Option<String> {
    let (base, last) = announce.rsplit_once('/')?;
    if let Some(rest) = last.strip_prefix("announce") {
        Some(format!("{base}/scrape{rest}"))
    } else {
        None
    }
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}
