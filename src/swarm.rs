//! Swarm orchestration.
//!
//! [`Swarm::spawn`] starts one torrent session: an actor task that owns every
//! piece of shared state (peer table, choke manager, delegator, tracker list,
//! throttles) and a set of I/O tasks that only move bytes. Peer tasks pump
//! whole wire messages over bounded channels; tracker workers run their
//! announce in the background and post the outcome back the same way. All
//! protocol decisions happen on the actor, so ordering within one peer is
//! wire order and nothing races.
//!
//! Closing a peer is synchronous from the actor's point of view: its chunk
//! pins, delegator reservations, throttle nodes, and table entry go away in
//! the same turn, and later events from that address are dropped on the
//! floor. Host callbacks therefore never fire for a closed peer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::bandwidth::{NodeId, Throttle};
use crate::chunks::ChunkStore;
use crate::config::SwarmConfig;
use crate::constants::{
    CHANNEL_CAPACITY, KEEPALIVE_INTERVAL, PEER_COOL_DOWN, SWEEP_INTERVAL, THROTTLE_TICK,
    TRACKER_TICK,
};
use crate::peer::{
    BlockRequest, ChokeDecision, ChokeManager, ErrorKind, Handshake, Message, PeerConnection,
    PeerError, PeerTransport, RequestDelegator,
};
use crate::tracker::dht::DhtTracker;
use crate::tracker::list::EventVerdict;
use crate::tracker::{
    AddressList, AnnounceParams, AnnounceResponse, DhtPeerSource, HttpTracker, ScrapeResponse,
    TrackerError, TrackerEvent, TrackerInfo, TrackerKind, TrackerList, UdpTracker,
};

/// Host callbacks. Invoked from the actor task; keep them quick.
#[allow(unused_variables)]
pub trait SwarmHandler: Send + 'static {
    fn on_tracker_success(&mut self, url: &str, peers: &AddressList) {}
    fn on_tracker_failure(&mut self, url: &str, msg: &str) {}
    fn on_scrape_success(&mut self, url: &str, scrape: ScrapeResponse) {}
    fn on_scrape_failure(&mut self, url: &str, msg: &str) {}
    fn on_tracker_enabled(&mut self, url: &str) {}
    fn on_tracker_disabled(&mut self, url: &str) {}
    fn on_piece_complete(&mut self, index: u32, ok: bool) {}
    fn on_peer_connected(&mut self, addr: SocketAddr) {}
    fn on_peer_disconnected(&mut self, addr: SocketAddr) {}
    fn on_download_complete(&mut self) {}
    fn on_storage_error(&mut self, addr: SocketAddr, msg: &str) {}
}

enum Command {
    Start,
    Stop,
    Scrape,
    AddTracker {
        group: u32,
        url: String,
        extra: bool,
        reply: oneshot::Sender<Result<(), TrackerError>>,
    },
    AddPeers(Vec<SocketAddr>),
    SetTrackerEnabled {
        url: String,
        enabled: bool,
    },
    SetSnubbed {
        addr: SocketAddr,
        snubbed: bool,
    },
    Shutdown,
}

enum PeerEvent {
    Connected {
        addr: SocketAddr,
        peer_id: Option<crate::peer::PeerId>,
        down_node: NodeId,
        commands: mpsc::Sender<PeerCommand>,
    },
    ConnectFailed {
        addr: SocketAddr,
        communication: bool,
    },
    Message {
        addr: SocketAddr,
        message: Message,
    },
    Closed {
        addr: SocketAddr,
        error: Option<PeerError>,
    },
}

enum PeerCommand {
    Send(Message),
    Close,
}

enum TrackerMsg {
    Announce {
        url: String,
        token: u64,
        result: Result<AnnounceResponse, TrackerError>,
    },
    Scrape {
        url: String,
        token: u64,
        result: Result<ScrapeResponse, TrackerError>,
    },
}

#[derive(Clone)]
enum Worker {
    Http(Arc<HttpTracker>),
    Udp(Arc<tokio::sync::Mutex<Option<UdpTracker>>>),
    Dht(Arc<DhtTracker>),
}

struct Inflight {
    token: u64,
    abort: AbortHandle,
}

struct PeerEntry {
    conn: PeerConnection,
    commands: mpsc::Sender<PeerCommand>,
}

/// Handle to a running swarm.
#[derive(Clone)]
pub struct SwarmHandle {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl SwarmHandle {
    /// Address incoming peers can reach us on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begins participation: the `started` event goes to the trackers and
    /// announce scheduling starts.
    pub async fn start(&self) {
        let _ = self.commands.send(Command::Start).await;
    }

    /// Sends `stopped` to the trackers and closes every peer.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    /// Dispatches a scrape to every scrapable tracker outside its
    /// suppression window.
    pub async fn scrape(&self) {
        let _ = self.commands.send(Command::Scrape).await;
    }

    pub async fn add_tracker(
        &self,
        group: u32,
        url: &str,
        extra: bool,
    ) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::AddTracker {
                group,
                url: url.to_string(),
                extra,
                reply,
            })
            .await;
        rx.await
            .unwrap_or_else(|_| Err(TrackerError::InvalidResponse("swarm gone".into())))
    }

    /// Seeds the candidate pool directly (peer exchange, manual peers).
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.commands.send(Command::AddPeers(peers)).await;
    }

    pub async fn set_tracker_enabled(&self, url: &str, enabled: bool) {
        let _ = self
            .commands
            .send(Command::SetTrackerEnabled {
                url: url.to_string(),
                enabled,
            })
            .await;
    }

    pub async fn set_snubbed(&self, addr: SocketAddr, snubbed: bool) {
        let _ = self.commands.send(Command::SetSnubbed { addr, snubbed }).await;
    }

    /// Stops the swarm and tears the actor down.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

pub struct Swarm;

impl Swarm {
    /// Binds the listen socket and spawns the session actor.
    pub async fn spawn(
        config: SwarmConfig,
        info: TrackerInfo,
        store: Arc<dyn ChunkStore>,
        dht: Option<Arc<dyn DhtPeerSource>>,
        handler: Box<dyn SwarmHandler>,
    ) -> std::io::Result<SwarmHandle> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tracker_tx, tracker_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let actor = SwarmActor::new(config, info, store, dht, handler, local_addr, peer_tx.clone());

        tokio::spawn(accept_loop(
            listener,
            actor.info.clone(),
            actor.down_throttle.clone(),
            peer_tx.clone(),
        ));
        tokio::spawn(actor.run(command_rx, peer_rx, tracker_rx, tracker_tx));

        Ok(SwarmHandle {
            commands: command_tx,
            local_addr,
        })
    }
}

struct SwarmActor {
    config: SwarmConfig,
    info: TrackerInfo,
    store: Arc<dyn ChunkStore>,
    dht: Option<Arc<dyn DhtPeerSource>>,
    handler: Box<dyn SwarmHandler>,
    local_addr: SocketAddr,

    delegator: RequestDelegator,
    choke: ChokeManager,
    trackers: TrackerList,
    workers: HashMap<String, Worker>,
    inflight: HashMap<String, Inflight>,
    next_token: u64,
    pending_event: Option<TrackerEvent>,

    peers: HashMap<SocketAddr, PeerEntry>,
    known_peers: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    cooldown: HashMap<SocketAddr, Instant>,

    down_throttle: Throttle,
    up_throttle: Throttle,
    peer_tx: mpsc::Sender<PeerEvent>,

    started: bool,
    /// Cleared by `stop`; gates new connections in both directions.
    active: bool,
    /// An invariant broke; the swarm aborts at the next loop turn.
    fatal: bool,
    start_time: Instant,
    uploaded: u64,
    downloaded: u64,
    aggregate_down_rate: u64,
}

impl SwarmActor {
    fn new(
        config: SwarmConfig,
        info: TrackerInfo,
        store: Arc<dyn ChunkStore>,
        dht: Option<Arc<dyn DhtPeerSource>>,
        handler: Box<dyn SwarmHandler>,
        local_addr: SocketAddr,
        peer_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let piece_count = store.piece_count();
        let piece_length = store.piece_size(0);
        let total_length: u64 = (0..piece_count).map(|i| u64::from(store.piece_size(i))).sum();

        let mut delegator = RequestDelegator::new(piece_count, piece_length, total_length);
        // Resume: trust whatever already verifies in the store.
        for index in 0..piece_count {
            if matches!(store.finish_piece(index), Ok(true)) {
                delegator.set_have(index);
            }
        }

        let now = Instant::now();
        Self {
            down_throttle: Throttle::new(config.download_limit),
            up_throttle: Throttle::new(config.upload_limit),
            config,
            info,
            store,
            dht,
            handler,
            local_addr,
            delegator,
            choke: ChokeManager::new(now),
            trackers: TrackerList::new(),
            workers: HashMap::new(),
            inflight: HashMap::new(),
            next_token: 0,
            pending_event: None,
            peers: HashMap::new(),
            known_peers: HashSet::new(),
            connecting: HashSet::new(),
            cooldown: HashMap::new(),
            peer_tx,
            started: false,
            active: true,
            fatal: false,
            start_time: now,
            uploaded: 0,
            downloaded: 0,
            aggregate_down_rate: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut tracker_msgs: mpsc::Receiver<TrackerMsg>,
        tracker_tx: mpsc::Sender<TrackerMsg>,
    ) {
        let mut throttle_tick = tokio::time::interval(THROTTLE_TICK);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        let mut tracker_tick = tokio::time::interval(TRACKER_TICK);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if self.handle_command(command, &tracker_tx) {
                        break;
                    }
                }
                Some(event) = peer_events.recv() => self.handle_peer_event(event),
                Some(msg) = tracker_msgs.recv() => self.handle_tracker_msg(msg),
                _ = throttle_tick.tick() => self.handle_throttle_tick(),
                _ = sweep_tick.tick() => self.handle_sweep(),
                _ = tracker_tick.tick() => self.handle_tracker_tick(&tracker_tx),
                else => break,
            }

            if self.fatal {
                tracing::error!("aborting swarm after internal error");
                break;
            }
        }

        self.close_all_peers();
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command, tracker_tx: &mpsc::Sender<TrackerMsg>) -> bool {
        match command {
            Command::Start => {
                if !self.started {
                    // Shuffle once so metainfo ordering carries no bias.
                    self.trackers.randomize_group_entries();
                }
                self.started = true;
                self.active = true;
                self.pending_event = Some(TrackerEvent::Started);
                self.handle_tracker_tick(tracker_tx);
                self.connect_pump();
            }
            Command::Stop => {
                self.started = false;
                self.active = false;
                self.broadcast_event(TrackerEvent::Stopped, tracker_tx);
                self.close_all_peers();
            }
            Command::Scrape => {
                let now = self.now_secs();
                for index in 0..self.trackers.len() {
                    if self.trackers.can_scrape(index, now) {
                        self.dispatch_scrape(index, tracker_tx);
                    }
                }
            }
            Command::AddTracker {
                group,
                url,
                extra,
                reply,
            } => {
                let result = self.add_tracker(group, &url, extra);
                let _ = reply.send(result);
            }
            Command::AddPeers(peers) => {
                self.known_peers.extend(peers);
                self.connect_pump();
            }
            Command::SetTrackerEnabled { url, enabled } => {
                if let Some(index) = self.trackers.find_url(&url) {
                    let tracker = self.trackers.get_mut(index).unwrap();
                    if tracker.enabled != enabled {
                        tracker.enabled = enabled;
                        if enabled {
                            self.handler.on_tracker_enabled(&url);
                        } else {
                            self.handler.on_tracker_disabled(&url);
                        }
                    }
                }
            }
            Command::SetSnubbed { addr, snubbed } => self.set_snubbed(addr, snubbed),
            Command::Shutdown => {
                self.broadcast_event(TrackerEvent::Stopped, tracker_tx);
                return true;
            }
        }
        false
    }

    fn add_tracker(&mut self, group: u32, url: &str, extra: bool) -> Result<(), TrackerError> {
        if url.starts_with("dht://") && self.dht.is_none() {
            if extra {
                return Err(TrackerError::UnsupportedProtocol(url.to_string()));
            }
            return Ok(());
        }

        let Some(index) = self.trackers.insert(group, url, extra)? else {
            return Ok(());
        };

        let worker = match self.trackers.get(index).unwrap().kind {
            TrackerKind::Http => Worker::Http(Arc::new(HttpTracker::new(url)?)),
            TrackerKind::Udp => Worker::Udp(Arc::new(tokio::sync::Mutex::new(None))),
            TrackerKind::Dht => Worker::Dht(Arc::new(DhtTracker::new(
                self.dht.clone().expect("dht checked above"),
            ))),
        };
        self.workers.insert(url.to_string(), worker);
        self.handler.on_tracker_enabled(url);
        Ok(())
    }

    fn set_snubbed(&mut self, addr: SocketAddr, snubbed: bool) {
        let Some(entry) = self.peers.get_mut(&addr) else {
            return;
        };
        // One choke-manager consultation per transition.
        if entry.conn.set_snubbed(snubbed) {
            self.choke.set_snubbed(addr, snubbed);
        }
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                addr,
                peer_id,
                down_node,
                commands,
            } => self.handle_connected(addr, peer_id, down_node, commands),
            PeerEvent::ConnectFailed {
                addr,
                communication,
            } => {
                self.connecting.remove(&addr);
                if communication {
                    self.cooldown.insert(addr, Instant::now() + PEER_COOL_DOWN);
                }
                self.connect_pump();
            }
            PeerEvent::Message { addr, message } => {
                if !self.peers.contains_key(&addr) {
                    return; // closed while the event was in flight
                }
                if let Err(error) = self.handle_message(addr, message) {
                    self.teardown_peer(addr, Some(error));
                }
            }
            PeerEvent::Closed { addr, error } => {
                if self.peers.contains_key(&addr) {
                    self.teardown_peer(addr, error);
                } else {
                    self.connecting.remove(&addr);
                }
            }
        }
    }

    fn handle_connected(
        &mut self,
        addr: SocketAddr,
        peer_id: Option<crate::peer::PeerId>,
        down_node: NodeId,
        commands: mpsc::Sender<PeerCommand>,
    ) {
        self.connecting.remove(&addr);
        self.known_peers.insert(addr);

        if !self.active
            || self.peers.len() >= self.config.max_peers
            || self.peers.contains_key(&addr)
        {
            let _ = commands.try_send(PeerCommand::Close);
            return;
        }

        let up_node = self.up_throttle.insert_node();
        self.up_throttle.activate(up_node);

        let now = Instant::now();
        let piece_count = self.delegator.have().piece_count();
        let conn = PeerConnection::new(addr, peer_id, piece_count, down_node, up_node, now);

        // They learn what we have up front.
        if self.delegator.have().count() > 0 {
            let _ = commands.try_send(PeerCommand::Send(Message::Bitfield(
                self.delegator.have().to_bytes(),
            )));
        }

        self.peers.insert(addr, PeerEntry { conn, commands });
        self.choke.insert(addr, now);
        self.handler.on_peer_connected(addr);
        tracing::debug!(%addr, "peer connected");
    }

    fn handle_message(&mut self, addr: SocketAddr, message: Message) -> Result<(), PeerError> {
        let now = Instant::now();

        match message {
            Message::KeepAlive | Message::Port(_) | Message::Extended { .. } => {
                self.conn(addr)?.note_read(0, now);
            }
            Message::Choke => {
                let returned = self.conn(addr)?.on_choke();
                if !returned.is_empty() {
                    self.delegator.return_blocks(addr);
                }
            }
            Message::Unchoke => {
                self.conn(addr)?.on_unchoke();
                self.fill_requests(addr);
            }
            Message::Interested => {
                self.conn(addr)?.set_peer_interested(true);
                let decisions = self
                    .choke
                    .set_interested(addr, true, self.delegator.is_complete());
                self.apply_choke_decisions(decisions);
            }
            Message::NotInterested => {
                self.conn(addr)?.set_peer_interested(false);
                let decisions = self
                    .choke
                    .set_interested(addr, false, self.delegator.is_complete());
                self.apply_choke_decisions(decisions);
            }
            Message::Have { piece } => {
                if self.conn(addr)?.on_have(piece)? {
                    self.delegator.peer_has(piece);
                }
                self.update_interest(addr);
                self.fill_requests(addr);
            }
            Message::Bitfield(bits) => {
                self.conn(addr)?.set_bitfield(&bits)?;
                let bitfield = self.conn(addr)?.bitfield.clone();
                self.delegator.peer_connected(&bitfield);
                self.update_interest(addr);
                self.fill_requests(addr);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                if u64::from(begin) + u64::from(length) > u64::from(self.store.piece_size(index)) {
                    return Err(PeerError::Protocol(format!(
                        "request beyond piece end: {index} {begin} {length}"
                    )));
                }
                let request = BlockRequest::new(index, begin, length);
                let have = self.delegator.have().clone();
                let queued = self.conn(addr)?.queue_request(request, &have)?;
                if queued {
                    self.try_upload(addr);
                }
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.conn(addr)?.on_cancel(BlockRequest::new(index, begin, length));
            }
            Message::Piece { index, begin, data } => {
                self.handle_block(addr, index, begin, data, now)?;
            }
        }
        Ok(())
    }

    fn handle_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: bytes::Bytes,
        now: Instant,
    ) -> Result<(), PeerError> {
        let store = self.store.clone();
        let matched = self
            .conn(addr)?
            .on_block(store.as_ref(), index, begin, &data, now)?;

        let Some(block) = matched else {
            return Ok(());
        };
        self.downloaded += u64::from(block.length);

        let (filled, cancels) = self.delegator.record_block(addr, block);
        for (holder, cancelled) in cancels {
            if let Some(entry) = self.peers.get_mut(&holder) {
                entry.conn.request_list.retain(|r| *r != cancelled);
                let _ = entry.commands.try_send(PeerCommand::Send(Message::Cancel {
                    index: cancelled.piece,
                    begin: cancelled.offset,
                    length: cancelled.length,
                }));
            }
        }

        if filled {
            self.finish_piece(index);
        }
        self.fill_requests(addr);
        Ok(())
    }

    fn finish_piece(&mut self, index: u32) {
        let ok = match self.store.finish_piece(index) {
            Ok(ok) => ok,
            Err(error) => {
                tracing::warn!(piece = index, %error, "piece verification failed to run");
                false
            }
        };

        // Peers holding this piece's chunk pinned are done with it now.
        for entry in self.peers.values_mut() {
            if entry.conn.down_chunk_index() == Some(index) {
                entry.conn.release_down_chunk();
            }
        }

        let outcome = self.delegator.piece_completed(index, ok);
        self.handler.on_piece_complete(index, ok);

        for banned in outcome.banned {
            tracing::debug!(%banned, "peer exceeded hash-failure strikes");
            self.teardown_peer(
                banned,
                Some(PeerError::Protocol("too many failed pieces".into())),
            );
        }

        if ok {
            let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
            for addr in addrs {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    let _ = entry
                        .commands
                        .try_send(PeerCommand::Send(Message::Have { piece: index }));
                }
                self.update_interest(addr);
            }

            if self.delegator.is_complete() {
                tracing::debug!("download complete");
                self.pending_event = Some(TrackerEvent::Completed);
                self.handler.on_download_complete();
            }
        }
    }

    /// Keeps invariant: interested iff the selector wants something the
    /// peer has.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(entry) = self.peers.get_mut(&addr) else {
            return;
        };
        let want = self.delegator.wants_any(&entry.conn.bitfield);
        if want == entry.conn.am_interested {
            return;
        }
        entry.conn.am_interested = want;
        let message = if want {
            Message::Interested
        } else {
            Message::NotInterested
        };
        let _ = entry.commands.try_send(PeerCommand::Send(message));

        if !want {
            let returned = std::mem::take(&mut entry.conn.request_list);
            if !returned.is_empty() {
                self.delegator.return_blocks(addr);
            }
        }
    }

    /// Tops the request pipeline up from the delegator.
    fn fill_requests(&mut self, addr: SocketAddr) {
        let endgame = self.delegator.in_endgame();
        let now = Instant::now();

        loop {
            let Some(entry) = self.peers.get_mut(&addr) else {
                return;
            };
            if !entry.conn.should_request(endgame, self.aggregate_down_rate)
                || !entry.conn.wants_more_requests(now)
            {
                return;
            }

            let bitfield = entry.conn.bitfield.clone();
            let Some(block) = self.delegator.delegate(addr, &bitfield) else {
                return;
            };

            let entry = self.peers.get_mut(&addr).expect("checked above");
            entry.conn.push_request(block);
            let _ = entry.commands.try_send(PeerCommand::Send(Message::Request {
                index: block.piece,
                begin: block.offset,
                length: block.length,
            }));
        }
    }

    /// Serves queued blocks while upload quota lasts.
    fn try_upload(&mut self, addr: SocketAddr) {
        let now = Instant::now();
        let store = self.store.clone();

        loop {
            let Some(entry) = self.peers.get_mut(&addr) else {
                return;
            };
            if entry.conn.am_choking {
                return;
            }
            let Some(next) = entry.conn.next_send() else {
                return;
            };

            let quota = self.up_throttle.quota(entry.conn.up_node);
            if quota < next.length {
                entry.conn.up_starved = true;
                self.up_throttle.deactivate(entry.conn.up_node);
                return;
            }

            match entry.conn.take_block(store.as_ref(), now) {
                Ok(Some((request, data))) => {
                    self.up_throttle.used(entry.conn.up_node, now, request.length);
                    self.uploaded += u64::from(request.length);
                    let _ = entry.commands.try_send(PeerCommand::Send(Message::Piece {
                        index: request.piece,
                        begin: request.offset,
                        data,
                    }));
                }
                Ok(None) => return,
                Err(error) => {
                    let msg = error.to_string();
                    if error.kind() == ErrorKind::Storage {
                        self.handler.on_storage_error(addr, &msg);
                    }
                    self.teardown_peer(addr, Some(error));
                    return;
                }
            }
        }
    }

    fn apply_choke_decisions(&mut self, decisions: Vec<ChokeDecision>) {
        for decision in decisions {
            let Some(entry) = self.peers.get_mut(&decision.addr) else {
                continue;
            };
            entry.conn.set_am_choking(!decision.unchoke);
            let message = if decision.unchoke {
                Message::Unchoke
            } else {
                Message::Choke
            };
            let _ = entry.commands.try_send(PeerCommand::Send(message));
        }
    }

    fn conn(&mut self, addr: SocketAddr) -> Result<&mut PeerConnection, PeerError> {
        self.peers
            .get_mut(&addr)
            .map(|entry| &mut entry.conn)
            .ok_or_else(|| PeerError::Internal(format!("no connection record for {addr}")))
    }

    /// Removes a peer and everything it holds, in one turn.
    fn teardown_peer(&mut self, addr: SocketAddr, error: Option<PeerError>) {
        let Some(mut entry) = self.peers.remove(&addr) else {
            return;
        };
        let now = Instant::now();

        match &error {
            Some(error) => {
                tracing::debug!(%addr, %error, kind = ?error.kind(), "peer dropped");
                match error.kind() {
                    ErrorKind::Communication => {
                        self.cooldown.insert(addr, now + PEER_COOL_DOWN);
                    }
                    ErrorKind::Storage => {
                        self.handler.on_storage_error(addr, &error.to_string());
                    }
                    ErrorKind::Internal => self.fatal = true,
                    _ => {}
                }
            }
            None => tracing::debug!(%addr, "peer closed"),
        }

        entry.conn.close();
        let _ = entry.commands.try_send(PeerCommand::Close);

        self.delegator.peer_disconnected(addr, &entry.conn.bitfield);
        self.delegator.forget_peer(addr);
        self.down_throttle.erase_node(entry.conn.down_node);
        self.up_throttle.erase_node(entry.conn.up_node);

        let decisions = self.choke.remove(addr, self.delegator.is_complete(), now);
        self.apply_choke_decisions(decisions);

        self.handler.on_peer_disconnected(addr);
        self.connect_pump();
    }

    fn close_all_peers(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.teardown_peer(addr, None);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn handle_throttle_tick(&mut self) {
        let now = Instant::now();
        self.down_throttle.tick(now);
        let woken = self.up_throttle.tick(now);

        if woken.is_empty() {
            return;
        }
        let resumed: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.conn.up_starved && woken.contains(&entry.conn.up_node))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in resumed {
            if let Some(entry) = self.peers.get_mut(&addr) {
                entry.conn.up_starved = false;
            }
            self.try_upload(addr);
        }
    }

    fn handle_sweep(&mut self) {
        let now = Instant::now();
        self.cooldown.retain(|_, until| *until > now);

        let mut idle = Vec::new();
        let mut aggregate = 0u64;
        for (addr, entry) in self.peers.iter_mut() {
            let outcome = entry.conn.sweep(now);
            if outcome.idle {
                idle.push(*addr);
                continue;
            }
            let down = entry.conn.down_rate(now);
            let up = entry.conn.up_rate(now);
            aggregate += down;
            self.choke.update_rates(*addr, down, up);
        }
        self.aggregate_down_rate = aggregate;

        for addr in idle {
            self.teardown_peer(addr, Some(PeerError::Timeout));
        }

        let decisions = self.choke.maybe_round(now, self.delegator.is_complete());
        self.apply_choke_decisions(decisions);

        // Re-request for peers whose pipelines drained or whose stall
        // cleared.
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.fill_requests(addr);
        }

        self.connect_pump();
    }

    // ------------------------------------------------------------------
    // Trackers
    // ------------------------------------------------------------------

    fn now_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn announce_params(&self) -> AnnounceParams {
        let have = self.delegator.have();
        let left: u64 = (0..have.piece_count() as u32)
            .filter(|&i| !have.has(i as usize))
            .map(|i| u64::from(self.delegator.piece_size(i)))
            .sum();

        AnnounceParams {
            numwant: self.config.numwant,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left,
            port: self.local_addr.port(),
        }
    }

    /// Sends a lifecycle event to the leading usable tracker of every group.
    fn broadcast_event(&mut self, event: TrackerEvent, tracker_tx: &mpsc::Sender<TrackerMsg>) {
        for group in 0..self.trackers.size_group() {
            let begin = self.trackers.begin_group(group);
            let end = self.trackers.end_group(group);
            let Some(index) = (begin..end).find(|&i| {
                self.trackers
                    .get(i)
                    .is_some_and(|t| t.is_usable() && !t.is_busy_not_scrape())
            }) else {
                continue;
            };

            match self.trackers.send_event(index, event) {
                EventVerdict::Dispatch { close_scrape } => {
                    if close_scrape {
                        self.abort_inflight(index);
                    }
                    self.dispatch_announce(index, event, tracker_tx);
                }
                EventVerdict::Busy | EventVerdict::Unusable => {}
            }
        }
    }

    fn handle_tracker_tick(&mut self, tracker_tx: &mpsc::Sender<TrackerMsg>) {
        if !self.started {
            return;
        }

        if let Some(event) = self.pending_event.take() {
            self.broadcast_event(event, tracker_tx);
            return;
        }

        // One regular announce at a time.
        if self.trackers.has_active_not_scrape() {
            return;
        }
        let Some(index) = self.trackers.find_next_to_request(0) else {
            return;
        };
        if self.trackers.get(index).unwrap().request_time_next() > self.now_secs() {
            return;
        }

        if let EventVerdict::Dispatch { close_scrape } =
            self.trackers.send_event(index, TrackerEvent::None)
        {
            if close_scrape {
                self.abort_inflight(index);
            }
            self.dispatch_announce(index, TrackerEvent::None, tracker_tx);
        }
    }

    fn abort_inflight(&mut self, index: usize) {
        let url = self.trackers.get(index).unwrap().url.clone();
        if let Some(inflight) = self.inflight.remove(&url) {
            inflight.abort.abort();
        }
    }

    fn dispatch_announce(
        &mut self,
        index: usize,
        event: TrackerEvent,
        tracker_tx: &mpsc::Sender<TrackerMsg>,
    ) {
        let url = self.trackers.get(index).unwrap().url.clone();
        let Some(worker) = self.workers.get(&url).cloned() else {
            self.trackers.mark_idle(index);
            return;
        };

        let params = self.announce_params();
        let info = self.info.clone();
        let token = self.next_token;
        self.next_token += 1;
        let tx = tracker_tx.clone();
        let task_url = url.clone();

        let handle = tokio::spawn(async move {
            let result = run_announce(&worker, &task_url, &info, &params, event).await;
            let _ = tx
                .send(TrackerMsg::Announce {
                    url: task_url,
                    token,
                    result,
                })
                .await;
        });

        self.inflight.insert(
            url,
            Inflight {
                token,
                abort: handle.abort_handle(),
            },
        );
    }

    fn dispatch_scrape(&mut self, index: usize, tracker_tx: &mpsc::Sender<TrackerMsg>) {
        let url = self.trackers.get(index).unwrap().url.clone();
        let Some(worker) = self.workers.get(&url).cloned() else {
            return;
        };

        self.trackers.mark_scraping(index);
        let info = self.info.clone();
        let token = self.next_token;
        self.next_token += 1;
        let tx = tracker_tx.clone();
        let task_url = url.clone();

        let handle = tokio::spawn(async move {
            let result = run_scrape(&worker, &task_url, &info).await;
            let _ = tx
                .send(TrackerMsg::Scrape {
                    url: task_url,
                    token,
                    result,
                })
                .await;
        });

        self.inflight.insert(
            url,
            Inflight {
                token,
                abort: handle.abort_handle(),
            },
        );
    }

    fn handle_tracker_msg(&mut self, msg: TrackerMsg) {
        match msg {
            TrackerMsg::Announce { url, token, result } => {
                if !self.claim_inflight(&url, token) {
                    return; // disowned or superseded
                }
                let Some(index) = self.trackers.find_url(&url) else {
                    return;
                };
                let now = self.now_secs();

                match result {
                    Ok(response) => {
                        let mut peers = response.peers.clone();
                        let new_index =
                            self.trackers
                                .receive_success(index, &mut peers, Some(response.interval), now);

                        let before = self.known_peers.len();
                        self.known_peers.extend(peers.iter().copied());
                        let new_peers = self.known_peers.len() - before;
                        self.trackers.set_latest_new_peers(new_index, new_peers);

                        tracing::debug!(url = %url, peers = peers.len(), new_peers, "tracker peers received");
                        self.handler.on_tracker_success(&url, &peers);
                        self.connect_pump();
                    }
                    Err(error) => {
                        let msg = error.to_string();
                        self.trackers.receive_failed(index, &msg, now);
                        self.handler.on_tracker_failure(&url, &msg);
                    }
                }
            }
            TrackerMsg::Scrape { url, token, result } => {
                if !self.claim_inflight(&url, token) {
                    return;
                }
                let Some(index) = self.trackers.find_url(&url) else {
                    return;
                };
                let now = self.now_secs();

                match result {
                    Ok(scrape) => {
                        self.trackers.receive_scrape_success(
                            index,
                            scrape.complete,
                            scrape.incomplete,
                            now,
                        );
                        self.handler.on_scrape_success(&url, scrape);
                    }
                    Err(error) => {
                        let msg = error.to_string();
                        self.trackers.receive_scrape_failed(index, &msg);
                        self.handler.on_scrape_failure(&url, &msg);
                    }
                }
            }
        }
    }

    /// Validates a worker message against the in-flight table; stale tokens
    /// belong to disowned or closed requests.
    fn claim_inflight(&mut self, url: &str, token: u64) -> bool {
        match self.inflight.get(url) {
            Some(inflight) if inflight.token == token => {
                self.inflight.remove(url);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Outbound connections
    // ------------------------------------------------------------------

    fn connect_pump(&mut self) {
        if !self.active {
            return;
        }
        while self.peers.len() + self.connecting.len() < self.config.min_peers {
            let candidate = self.known_peers.iter().copied().find(|addr| {
                !self.peers.contains_key(addr)
                    && !self.connecting.contains(addr)
                    && !self.cooldown.contains_key(addr)
                    && *addr != self.local_addr
            });
            let Some(addr) = candidate else {
                return;
            };

            self.connecting.insert(addr);
            tokio::spawn(connect_outbound(
                addr,
                self.info.clone(),
                self.down_throttle.clone(),
                self.peer_tx.clone(),
            ));
        }
    }
}

// ----------------------------------------------------------------------
// Worker shims
// ----------------------------------------------------------------------

async fn run_announce(
    worker: &Worker,
    url: &str,
    info: &TrackerInfo,
    params: &AnnounceParams,
    event: TrackerEvent,
) -> Result<AnnounceResponse, TrackerError> {
    match worker {
        Worker::Http(http) => http.announce(info, params, event).await,
        Worker::Udp(cell) => {
            let mut guard = cell.lock().await;
            if guard.is_none() {
                *guard = Some(UdpTracker::connect(url).await?);
            }
            guard.as_mut().unwrap().announce(info, params, event).await
        }
        Worker::Dht(dht) => dht.announce(info, params).await,
    }
}

async fn run_scrape(
    worker: &Worker,
    url: &str,
    info: &TrackerInfo,
) -> Result<ScrapeResponse, TrackerError> {
    match worker {
        Worker::Http(http) => http.scrape(info).await,
        Worker::Udp(cell) => {
            let mut guard = cell.lock().await;
            if guard.is_none() {
                *guard = Some(UdpTracker::connect(url).await?);
            }
            guard.as_mut().unwrap().scrape(info).await
        }
        Worker::Dht(dht) => dht.scrape(info),
    }
}

// ----------------------------------------------------------------------
// Peer I/O tasks
// ----------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    info: TrackerInfo,
    down_throttle: Throttle,
    events: mpsc::Sender<PeerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handshake_incoming(
                    stream,
                    addr,
                    info.clone(),
                    down_throttle.clone(),
                    events.clone(),
                ));
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                return;
            }
        }
    }
}

async fn handshake_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    info: TrackerInfo,
    down_throttle: Throttle,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut transport = PeerTransport::new(stream);

    let theirs = match transport.receive_handshake().await {
        Ok(handshake) => handshake,
        Err(_) => return,
    };
    if theirs.info_hash != info.info_hash {
        return;
    }
    let ours = Handshake::new(info.info_hash, *info.local_id.as_bytes());
    if transport.send_handshake(&ours).await.is_err() {
        return;
    }

    run_peer(addr, transport, theirs.peer_id, down_throttle, events).await;
}

async fn connect_outbound(
    addr: SocketAddr,
    info: TrackerInfo,
    down_throttle: Throttle,
    events: mpsc::Sender<PeerEvent>,
) {
    let attempt = async {
        let stream = TcpStream::connect(addr).await.map_err(PeerError::Io)?;
        let mut transport = PeerTransport::new(stream);

        let ours = Handshake::new(info.info_hash, *info.local_id.as_bytes());
        transport.send_handshake(&ours).await?;
        let theirs = transport.receive_handshake().await?;
        if theirs.info_hash != info.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok((transport, theirs))
    };

    match attempt.await {
        Ok((transport, theirs)) => {
            run_peer(addr, transport, theirs.peer_id, down_throttle, events).await;
        }
        Err(error) => {
            let _ = events
                .send(PeerEvent::ConnectFailed {
                    addr,
                    communication: error.kind() == ErrorKind::Communication,
                })
                .await;
        }
    }
}

/// Message pump for one connected peer: reads whole messages into the actor,
/// writes actor commands to the wire, and gates incoming piece payloads on
/// the download throttle.
async fn run_peer(
    addr: SocketAddr,
    mut transport: PeerTransport,
    peer_id: [u8; 20],
    down_throttle: Throttle,
    events: mpsc::Sender<PeerEvent>,
) {
    let down_node = down_throttle.insert_node();
    down_throttle.activate(down_node);

    let (command_tx, mut command_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let connected = events
        .send(PeerEvent::Connected {
            addr,
            peer_id: crate::peer::PeerId::from_bytes(&peer_id),
            down_node,
            commands: command_tx,
        })
        .await;
    if connected.is_err() {
        down_throttle.erase_node(down_node);
        return;
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let error = loop {
        tokio::select! {
            result = transport.receive_message() => match result {
                Ok(message) => {
                    if let Message::Piece { ref data, .. } = message {
                        // Quota-bounded passes; backpressure stops the read
                        // loop while the bucket refills.
                        let mut remaining = data.len() as u32;
                        while remaining > 0 {
                            let granted = down_throttle.acquire(down_node, remaining).await;
                            if granted == 0 {
                                break;
                            }
                            remaining -= granted;
                        }
                    }
                    if events.send(PeerEvent::Message { addr, message }).await.is_err() {
                        break None;
                    }
                }
                Err(error) => break Some(error),
            },
            command = command_rx.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    if let Err(error) = transport.send_message(&message).await {
                        break Some(error);
                    }
                }
                Some(PeerCommand::Close) | None => break None,
            },
            _ = keepalive.tick() => {
                if let Err(error) = transport.send_message(&Message::KeepAlive).await {
                    break Some(error);
                }
            }
        }
    };

    down_throttle.erase_node(down_node);
    let _ = events.send(PeerEvent::Closed { addr, error }).await;
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::chunks::MemoryChunkStore;
    use crate::peer::PeerId;

    struct NullHandler;
    impl SwarmHandler for NullHandler {}

    struct CompletionHandler {
        complete: Option<oneshot::Sender<()>>,
    }

    impl SwarmHandler for CompletionHandler {
        fn on_download_complete(&mut self) {
            if let Some(tx) = self.complete.take() {
                let _ = tx.send(());
            }
        }
    }

    fn piece_hashes(piece_length: usize, data: &[u8]) -> Vec<[u8; 20]> {
        data.chunks(piece_length)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect()
    }

    fn test_config() -> SwarmConfig {
        SwarmConfig {
            listen_port: 0,
            min_peers: 1,
            max_peers: 8,
            ..SwarmConfig::default()
        }
    }

    fn loopback(handle: &SwarmHandle) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), handle.local_addr().port())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_swarms_transfer_a_torrent() {
        const PIECE_LENGTH: usize = 16384;
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        let info_hash = [7u8; 20];

        let seed_store = MemoryChunkStore::seeded(PIECE_LENGTH as u32, &data);
        let leech_store = MemoryChunkStore::new(
            PIECE_LENGTH as u32,
            data.len() as u64,
            piece_hashes(PIECE_LENGTH, &data),
        );

        let seed = Swarm::spawn(
            test_config(),
            TrackerInfo::new(info_hash, PeerId::generate()),
            seed_store,
            None,
            Box::new(NullHandler),
        )
        .await
        .unwrap();

        let (complete_tx, complete_rx) = oneshot::channel();
        let leech = Swarm::spawn(
            test_config(),
            TrackerInfo::new(info_hash, PeerId::generate()),
            leech_store.clone(),
            None,
            Box::new(CompletionHandler {
                complete: Some(complete_tx),
            }),
        )
        .await
        .unwrap();

        leech.add_peers(vec![loopback(&seed)]).await;

        tokio::time::timeout(Duration::from_secs(30), complete_rx)
            .await
            .expect("download should complete")
            .unwrap();

        // Every piece verifies and the payload round-tripped intact.
        for index in 0..3 {
            assert!(leech_store.finish_piece(index).unwrap());
        }
        let last = leech_store.get(2, false).unwrap();
        let got = last.read_at(0, last.len()).unwrap();
        assert_eq!(&got[..], &data[2 * PIECE_LENGTH..]);

        leech.shutdown().await;
        seed.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_info_hash_is_rejected() {
        let store = MemoryChunkStore::seeded(16384, &[0u8; 16384]);
        let seed = Swarm::spawn(
            test_config(),
            TrackerInfo::new([1u8; 20], PeerId::generate()),
            store,
            None,
            Box::new(NullHandler),
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(loopback(&seed)).await.unwrap();
        let mut transport = PeerTransport::new(stream);
        transport
            .send_handshake(&Handshake::new([2u8; 20], [3u8; 20]))
            .await
            .unwrap();

        // The swarm drops mismatched handshakes without replying.
        assert!(transport.receive_handshake().await.is_err());
        seed.shutdown().await;
    }
}
