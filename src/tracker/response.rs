use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Announce lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    /// The `event` query value for HTTP announces; empty means omit.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// The 32-bit event field of BEP-15 announces.
    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Peer endpoints from one announce, deduplicated and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
}

impl AddressList {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        let mut list = Self { addrs };
        list.normalize();
        list
    }

    /// Sorts and drops duplicates. Constructors run this; it is idempotent.
    pub fn normalize(&mut self) {
        self.addrs.sort_unstable();
        self.addrs.dedup();
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.addrs.iter()
    }

    pub fn as_slice(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn extend(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        self.addrs.extend(addrs);
        self.normalize();
    }
}

impl IntoIterator for AddressList {
    type Item = SocketAddr;
    type IntoIter = std::vec::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce.
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeder count, when reported.
    pub complete: Option<u32>,
    /// Leecher count, when reported.
    pub incomplete: Option<u32>,
    pub peers: AddressList,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            peers: AddressList::default(),
        }
    }
}

/// Aggregate swarm counters from a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub downloaded: u32,
    pub incomplete: u32,
}

/// Parses 6-byte compact IPv4 peer entries (BEP-23).
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses 18-byte compact IPv6 peer entries.
pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)
        })
        .collect()
}

/// Encodes addresses back to the compact IPv4 form. Tests use this to build
/// tracker replies.
pub fn encode_compact_peers(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}
