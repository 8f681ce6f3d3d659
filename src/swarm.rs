//! The swarm manager: the single-writer actor that owns every peer
//! connection and all shared download state.
//!
//! Peer sessions own only their sockets; they forward decoded messages here
//! on one ordered channel and receive outbound messages on their own bounded
//! channels. The manager routes inbound messages, drives the piece picker,
//! the hash verifier, and the choker, talks to the embedder-provided file
//! assembler, and emits events. Because every piece of shared state is
//! mutated on this task only, ownership forms a tree and no locks are held
//! across suspension points.

use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task, time,
};

use crate::{
    availability::AvailabilityIndex,
    choker::{Choker, PeerRank},
    conf::Conf,
    counter::ThruputCounter,
    error::*,
    peer::{
        codec::Message, session::Session, ConnState, PeerConnection,
        SessionEvent,
    },
    piece_picker::PiecePicker,
    piece_store::{AddResult, PieceState, PieceStore},
    torrent::TorrentInfo,
    verifier::{HashVerifier, Verdict, VerifyJob},
    BlockInfo, PeerId, PieceIndex,
};

/// How long peer sessions get to flush when the swarm shuts down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The source recorded for blocks read back from our own storage during a
/// recheck. Never a real peer, so it can't be penalized.
const LOCAL_SOURCE: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// The storage seam the embedder provides. Writes must be durable when they
/// return; reads may miss if the assembler has not seen the piece.
///
/// Calls are made on the blocking pool, never on the manager task, so
/// implementations are free to do real file IO inline.
pub trait FileAssembler: Send + Sync + 'static {
    fn write_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> std::io::Result<()>;

    fn read_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> std::io::Result<Option<Vec<u8>>>;

    /// The pieces already present on disk, consulted once at startup.
    fn existing_pieces(&self) -> std::io::Result<BTreeSet<PieceIndex>>;
}

/// The persisted state the engine consumes and produces: which pieces are
/// verified, tied to the torrent they belong to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub info_hash: crate::Sha1Hash,
    pub verified_pieces: BTreeSet<PieceIndex>,
}

/// Events delivered to the embedder. Handlers must not block: they run on
/// the embedder's own task, but the channel is how the manager stays
/// responsive.
#[derive(Debug)]
pub enum SwarmEvent {
    PeerConnected {
        addr: SocketAddr,
        peer_id: PeerId,
    },
    PeerDisconnected {
        addr: SocketAddr,
        reason: Option<Error>,
    },
    PieceVerified {
        piece_index: PieceIndex,
    },
    DownloadComplete,
    StatsTick(SwarmStats),
    /// A storage fault stopped the torrent; only a new swarm resumes it.
    Paused {
        reason: String,
    },
}

/// Aggregate swarm statistics, emitted on every stats tick.
#[derive(Clone, Debug)]
pub struct SwarmStats {
    /// Verified fraction of the torrent, `0.0..=1.0`.
    pub progress: f64,
    /// Smoothed aggregate rates, bytes per second.
    pub download_rate: f64,
    pub upload_rate: f64,
    /// All-time payload byte totals.
    pub downloaded_payload_bytes: u64,
    pub uploaded_payload_bytes: u64,
    pub peer_count: usize,
    pub pieces_missing: usize,
    /// Requested or downloading.
    pub pieces_pending: usize,
    /// Complete but not yet hash checked.
    pub pieces_complete: usize,
    pub pieces_verified: usize,
    pub in_endgame: bool,
    /// Mean number of peers per piece.
    pub average_availability: f64,
    /// Frequency of the rarest piece any peer has.
    pub rarest_availability: u32,
}

/// Commands the handle can send the manager.
enum Command {
    AddPeer(SocketAddr),
    RehashAll,
    Checkpoint(oneshot::Sender<Checkpoint>),
    Shutdown,
}

/// The embedder's handle to a running swarm.
#[derive(Clone)]
pub struct SwarmHandle {
    cmd_chan: UnboundedSender<Command>,
}

impl SwarmHandle {
    /// Feeds a candidate endpoint from peer discovery. Duplicates and
    /// blocklisted endpoints are ignored; discovery should stop pushing
    /// once the connection limit is reached.
    pub fn add_candidate_peer(&self, addr: SocketAddr) -> Result<()> {
        self.cmd_chan
            .send(Command::AddPeer(addr))
            .map_err(|_| Error::Shutdown)
    }

    /// Rechecks every verified piece, e.g. after resuming from an untrusted
    /// state.
    pub fn rehash_all(&self) -> Result<()> {
        self.cmd_chan
            .send(Command::RehashAll)
            .map_err(|_| Error::Shutdown)
    }

    /// Snapshots the verified piece set for persisting.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let (reply_chan, reply_port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Checkpoint(reply_chan))
            .map_err(|_| Error::Shutdown)?;
        reply_port.await.map_err(|_| Error::Shutdown)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan
            .send(Command::Shutdown)
            .map_err(|_| Error::Shutdown)
    }
}

/// Results of file assembler calls made off the manager task.
enum StorageResult {
    ExistingPieces(std::io::Result<BTreeSet<PieceIndex>>),
    WriteDone {
        piece_index: PieceIndex,
        result: std::io::Result<()>,
    },
    ReadDone {
        addr: SocketAddr,
        block: BlockInfo,
        data: Option<Vec<u8>>,
    },
    RehashRead {
        piece_index: PieceIndex,
        data: Option<Vec<u8>>,
    },
}

pub struct Swarm {
    conf: Conf,
    torrent: Arc<TorrentInfo>,
    connections: HashMap<SocketAddr, PeerConnection>,
    store: PieceStore,
    avail: AvailabilityIndex,
    picker: PiecePicker,
    choker: Choker,
    verifier: HashVerifier,
    verdict_port: UnboundedReceiver<Verdict>,
    /// Cloned into every session; all sessions funnel into `event_port`.
    event_chan: mpsc::Sender<SessionEvent>,
    event_port: mpsc::Receiver<SessionEvent>,
    cmd_port: UnboundedReceiver<Command>,
    alert_chan: UnboundedSender<SwarmEvent>,
    assembler: Arc<dyn FileAssembler>,
    storage_chan: UnboundedSender<StorageResult>,
    storage_port: UnboundedReceiver<StorageResult>,
    /// Recently failed peers and when they were blocked.
    blocklist: HashMap<SocketAddr, Instant>,
    /// Pieces currently being re-checked from storage rather than freshly
    /// downloaded; they are not written back on success.
    rehashing: std::collections::HashSet<PieceIndex>,
    downloaded: ThruputCounter,
    uploaded: ThruputCounter,
    rng: StdRng,
    paused: bool,
    download_complete_emitted: bool,
    trusted_resume: bool,
    last_stats: Instant,
}

impl Swarm {
    /// Creates a swarm for the torrent, returning it together with the
    /// embedder's command handle and the event stream.
    ///
    /// If a checkpoint matching the torrent is given, its verified pieces
    /// are restored without re-hashing; otherwise the assembler's existing
    /// pieces are re-checked at startup.
    pub fn new(
        conf: Conf,
        torrent: Arc<TorrentInfo>,
        assembler: Arc<dyn FileAssembler>,
        checkpoint: Option<Checkpoint>,
    ) -> (Self, SwarmHandle, UnboundedReceiver<SwarmEvent>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (event_chan, event_port) =
            mpsc::channel(conf.event_channel_len);
        let (storage_chan, storage_port) = mpsc::unbounded_channel();
        let (verifier, verdict_port) = HashVerifier::new(
            conf.hash_workers,
            conf.hash_queue_len,
            conf.hash_chunk_len,
        );

        let mut store = PieceStore::new(
            Arc::clone(&torrent),
            conf.block_len,
            conf.streaming_mode,
        );
        let mut trusted_resume = false;
        if let Some(checkpoint) = checkpoint {
            if checkpoint.info_hash == torrent.info_hash {
                store.restore_verified(&checkpoint.verified_pieces);
                trusted_resume = true;
            } else {
                log::warn!("Checkpoint is for a different torrent, ignoring");
            }
        }

        let swarm = Self {
            avail: AvailabilityIndex::new(torrent.piece_count()),
            picker: PiecePicker::new(&conf),
            choker: Choker::new(
                conf.max_upload_slots,
                conf.optimistic_interval,
            ),
            store,
            verifier,
            verdict_port,
            connections: HashMap::new(),
            event_chan,
            event_port,
            cmd_port,
            alert_chan,
            assembler,
            storage_chan,
            storage_port,
            blocklist: HashMap::new(),
            rehashing: std::collections::HashSet::new(),
            downloaded: ThruputCounter::default(),
            uploaded: ThruputCounter::default(),
            rng: StdRng::from_entropy(),
            paused: false,
            download_complete_emitted: false,
            trusted_resume,
            last_stats: Instant::now(),
            torrent,
            conf,
        };
        let handle = SwarmHandle { cmd_chan };
        (swarm, handle, alert_port)
    }

    /// Runs the manager until shutdown.
    pub async fn run(mut self) -> Result<()> {
        log::info!(
            "Starting swarm for torrent {}",
            hex::encode(self.torrent.info_hash)
        );

        if !self.trusted_resume {
            self.probe_existing_pieces();
        }
        // a resumed torrent may already be inside the endgame window
        self.picker.update_endgame(&self.store);

        let mut unchoke_tick = time::interval_at(
            time::Instant::now() + self.conf.unchoke_interval,
            self.conf.unchoke_interval,
        );
        unchoke_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut stats_tick = time::interval_at(
            time::Instant::now() + self.conf.stats_interval,
            self.conf.stats_interval,
        );
        stats_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        self.last_stats = Instant::now();

        loop {
            tokio::select! {
                event = self.event_port.recv() => {
                    if let Some(event) = event {
                        self.handle_session_event(event).await;
                    }
                }
                verdict = self.verdict_port.recv() => {
                    if let Some(verdict) = verdict {
                        self.handle_verdict(verdict).await;
                    }
                }
                result = self.storage_port.recv() => {
                    if let Some(result) = result {
                        self.handle_storage_result(result).await;
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::AddPeer(addr)) => self.add_peer(addr),
                        Some(Command::RehashAll) => self.rehash_all().await,
                        Some(Command::Checkpoint(reply_chan)) => {
                            let _ = reply_chan.send(self.checkpoint());
                        }
                        // the handle going away stops the swarm
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = unchoke_tick.tick() => self.choke_tick(),
                _ = stats_tick.tick() => self.stats_tick(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            info_hash: self.torrent.info_hash,
            verified_pieces: self.store.verified().clone(),
        }
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.alert_chan.send(event);
    }

    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    fn add_peer(&mut self, addr: SocketAddr) {
        if self.connections.contains_key(&addr) {
            return;
        }
        if self.connections.len() >= self.conf.max_connections {
            log::warn!("Connection limit reached, ignoring peer {}", addr);
            return;
        }
        if let Some(blocked_at) = self.blocklist.get(&addr) {
            if blocked_at.elapsed() < self.conf.blocklist_ttl {
                log::debug!("Peer {} is blocklisted, ignoring", addr);
                return;
            }
            self.blocklist.remove(&addr);
        }

        let (cmd_chan, cmd_port) = mpsc::channel(self.conf.peer_channel_len);
        let session = Session::new(
            addr,
            Arc::clone(&self.torrent),
            self.conf.client_id,
            self.conf.clone(),
            self.event_chan.clone(),
            cmd_port,
        );
        let task = tokio::spawn(session.run());
        self.connections
            .insert(addr, PeerConnection::new(addr, &self.conf, cmd_chan, task));
    }

    /// Tears down a connection and scrubs it from every index. Blocklists
    /// the peer for protocol-level misbehavior to prevent reconnect churn.
    fn disconnect(&mut self, addr: SocketAddr, reason: Option<Error>) {
        let conn = match self.connections.remove(&addr) {
            Some(conn) => conn,
            None => return,
        };
        match &reason {
            Some(error) => {
                log::info!("Disconnecting peer {}: {}", addr, error)
            }
            None => log::info!("Peer {} disconnected", addr),
        }
        if let Some(peer_id) = &conn.peer_id {
            log::debug!(
                "Peer {} id was {}",
                addr,
                String::from_utf8_lossy(peer_id)
            );
        }

        // flushed requests are not re-sent to this peer; the blocks become
        // pickable again right away
        for (block, _) in conn.outstanding_requests.iter() {
            self.store.clear_requested(*block, &addr);
        }
        conn.shutdown();

        self.avail.drop_peer(&addr);
        self.choker.drop_peer(&addr);
        if reason
            .as_ref()
            .map(Error::is_blocklistable)
            .unwrap_or(false)
        {
            self.blocklist.insert(addr, Instant::now());
        }
        self.emit(SwarmEvent::PeerDisconnected { addr, reason });
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { addr, peer_id } => {
                self.handle_connected(addr, peer_id)
            }
            SessionEvent::Message { addr, msg } => {
                self.handle_msg(addr, msg).await
            }
            SessionEvent::Disconnected { addr, error } => {
                self.disconnect(addr, error)
            }
        }
    }

    /// Outbound bring-up after the handshakes check out: announce our
    /// pieces and start the peer unchoked so reciprocation can be observed.
    fn handle_connected(&mut self, addr: SocketAddr, peer_id: PeerId) {
        if !self.connections.contains_key(&addr) {
            return;
        }
        self.avail.insert_peer(addr);
        let own_bitfield = self.store.own_bitfield();
        let mut failed = false;
        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.peer_id = Some(peer_id);
            conn.state = ConnState::HandshakeReceived;

            failed = conn.send(Message::Bitfield(own_bitfield)).is_err();
            if !failed {
                conn.bitfield_sent = true;
                conn.state = ConnState::BitfieldSent;
                conn.sync_online_state();
                failed = conn.send_unchoke().is_err();
            }
        }
        if failed {
            self.disconnect(addr, Some(Error::SendFailed));
        } else {
            self.emit(SwarmEvent::PeerConnected { addr, peer_id });
        }
    }

    // ------------------------------------------------------------------
    // inbound dispatch
    // ------------------------------------------------------------------

    async fn handle_msg(&mut self, addr: SocketAddr, msg: Message) {
        let conn = match self.connections.get_mut(&addr) {
            Some(conn) => conn,
            None => return,
        };

        // A peer that starts talking without a bitfield implicitly has no
        // pieces; the availability entry stays empty and the exchange is
        // considered done.
        if !conn.bitfield_received && !matches!(msg, Message::Bitfield(_)) {
            conn.bitfield_received = true;
            conn.state = ConnState::BitfieldReceived;
            conn.sync_online_state();
        }

        match msg {
            // the session already refreshed its activity clock
            Message::KeepAlive => {}
            Message::Choke => {
                let conn = self.conn_mut(&addr);
                if !conn.peer_choking {
                    log::info!("Peer {} choked us", addr);
                    conn.peer_choking = true;
                    conn.sync_online_state();
                }
            }
            Message::Unchoke => {
                let conn = self.conn_mut(&addr);
                if conn.peer_choking {
                    log::info!("Peer {} unchoked us", addr);
                    conn.peer_choking = false;
                    conn.sync_online_state();
                    self.refill(addr);
                }
            }
            Message::Interested => {
                let conn = self.conn_mut(&addr);
                if !conn.peer_interested {
                    log::info!("Peer {} is interested", addr);
                    conn.peer_interested = true;
                    self.enforce_choke_bound(addr);
                }
            }
            Message::NotInterested => {
                let conn = self.conn_mut(&addr);
                if conn.peer_interested {
                    log::info!("Peer {} is not interested", addr);
                    conn.peer_interested = false;
                }
            }
            Message::Have { piece_index } => self.handle_have(addr, piece_index),
            Message::Bitfield(bitfield) => {
                self.handle_bitfield(addr, bitfield)
            }
            Message::Request(block) => self.serve_request(addr, block),
            Message::Block {
                piece_index,
                offset,
                data,
            } => self.handle_block(addr, piece_index, offset, data).await,
            Message::Cancel(block) => {
                self.conn_mut(&addr).pending_uploads.remove(&block);
            }
        }
    }

    /// The connection is known to exist within a dispatch step.
    fn conn_mut(&mut self, addr: &SocketAddr) -> &mut PeerConnection {
        self.connections
            .get_mut(addr)
            .expect("dispatch for unknown connection")
    }

    fn handle_have(&mut self, addr: SocketAddr, piece_index: PieceIndex) {
        self.avail.record_have(addr, piece_index);
        let lacking = !self.store.is_verified(piece_index);
        let mut failed = false;
        if let Some(conn) = self.connections.get_mut(&addr) {
            if lacking && !conn.am_interested {
                log::info!("Interested in peer {}", addr);
                conn.am_interested = true;
                failed = conn.send(Message::Interested).is_err();
            }
        }
        if failed {
            self.disconnect(addr, Some(Error::SendFailed));
        } else {
            self.refill(addr);
        }
    }

    fn handle_bitfield(&mut self, addr: SocketAddr, bitfield: crate::Bitfield) {
        // only valid directly after the handshake
        if self.conn_mut(&addr).bitfield_received {
            self.disconnect(
                addr,
                Some(Error::Protocol("bitfield not after handshake")),
            );
            return;
        }

        log::info!("Received bitfield from peer {}", addr);
        self.avail.update_bitfield(addr, &bitfield);

        let interesting = bitfield
            .iter_ones()
            .any(|piece_index| !self.store.is_verified(piece_index));

        let mut failed = false;
        {
            let conn = self.conn_mut(&addr);
            conn.bitfield_received = true;
            conn.state = ConnState::BitfieldReceived;
            conn.sync_online_state();
            if interesting && !conn.am_interested {
                log::info!("Interested in peer {}", addr);
                conn.am_interested = true;
                failed = conn.send(Message::Interested).is_err();
            }
        }
        if failed {
            self.disconnect(addr, Some(Error::SendFailed));
        } else {
            self.refill(addr);
        }
    }

    // ------------------------------------------------------------------
    // serving uploads
    // ------------------------------------------------------------------

    /// Serves an inbound request, or drops it silently, which the protocol
    /// allows: when choking the peer, when overloaded, or when neither the
    /// store nor the assembler can produce the bytes in time.
    fn serve_request(&mut self, addr: SocketAddr, block: BlockInfo) {
        let max_pending = self.conf.max_pending_uploads;
        match self.connections.get(&addr) {
            Some(conn) if conn.am_choking => {
                log::debug!(
                    "Dropping request from choked peer {}: {:?}",
                    addr,
                    block
                );
                return;
            }
            Some(conn) if conn.pending_uploads.len() >= max_pending => {
                log::debug!("Upload queue of peer {} full, dropping", addr);
                return;
            }
            Some(_) => {}
            None => return,
        }

        if let Some(data) =
            self.store.get_block(block.piece_index, block.offset, block.len)
        {
            self.send_served_block(addr, block, data);
        } else if !self.paused {
            self.conn_mut(&addr).pending_uploads.insert(block);
            self.spawn_upload_read(addr, block);
        }
    }

    fn send_served_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    ) {
        let sent = {
            let conn = self.conn_mut(&addr);
            let sent = conn
                .send(Message::Block {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .is_ok();
            if sent {
                conn.uploaded.record(block.len as u64);
            }
            sent
        };
        if sent {
            self.uploaded.record(block.len as u64);
        } else {
            self.disconnect(addr, Some(Error::SendFailed));
        }
    }

    fn spawn_upload_read(&self, addr: SocketAddr, block: BlockInfo) {
        let assembler = Arc::clone(&self.assembler);
        let storage_chan = self.storage_chan.clone();
        let timeout = self.conf.upload_read_timeout;
        tokio::spawn(async move {
            let read = task::spawn_blocking(move || {
                assembler.read_block(block.piece_index, block.offset, block.len)
            });
            let data = match time::timeout(timeout, read).await {
                Ok(Ok(Ok(Some(data))))
                    if data.len() == block.len as usize =>
                {
                    Some(data)
                }
                _ => None,
            };
            let _ = storage_chan.send(StorageResult::ReadDone {
                addr,
                block,
                data,
            });
        });
    }

    // ------------------------------------------------------------------
    // download path
    // ------------------------------------------------------------------

    async fn handle_block(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        let now = Instant::now();
        let block_info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };

        let solicited = {
            let conn = self.conn_mut(&addr);
            conn.on_block_received(block_info, now)
        };
        if solicited.is_none() {
            // an in-flight block whose request expired or was cancelled, or
            // an unsolicited block; either way it is not ours to store
            log::debug!(
                "Peer {} sent block we did not request: {:?}",
                addr,
                block_info
            );
            return;
        }

        self.conn_mut(&addr).downloaded.record(block_info.len as u64);
        self.downloaded.record(block_info.len as u64);

        let add_result = match self.store.add_block(block_info, data, addr) {
            Ok(result) => result,
            Err(error) => {
                // a solicited block always fits the layout; this peer is
                // not speaking our dialect
                self.disconnect(addr, Some(error));
                return;
            }
        };

        // the first copy of an endgame block obsoletes the duplicates
        if self.picker.in_endgame() {
            self.cancel_duplicates(block_info, addr);
        }

        if add_result == AddResult::StoredComplete {
            log::info!("Piece {} complete via peer {}", piece_index, addr);
            self.queue_verification(piece_index).await;
        }

        self.refill(addr);
    }

    /// Sends CANCELs for a block to every other peer it is still requested
    /// from. Ordered per peer before any subsequent refill, so a cancel
    /// always precedes the next overlapping request.
    fn cancel_duplicates(&mut self, block: BlockInfo, winner: SocketAddr) {
        let holders = self.store.duplicate_holders(block, &winner);
        let mut failed = Vec::new();
        for holder in holders {
            if let Some(conn) = self.connections.get_mut(&holder) {
                log::debug!(
                    "Cancelling duplicate {:?} at peer {}",
                    block,
                    holder
                );
                if conn.cancel(block).is_err() {
                    failed.push(holder);
                }
            }
            self.store.clear_requested(block, &holder);
        }
        for holder in failed {
            self.disconnect(holder, Some(Error::SendFailed));
        }
    }

    async fn queue_verification(&mut self, piece_index: PieceIndex) {
        let data = match self.store.piece(piece_index).assemble() {
            Some(data) => data,
            None => {
                log::error!(
                    "Complete piece {} has no data to verify",
                    piece_index
                );
                return;
            }
        };
        self.queue_verification_with(piece_index, data).await;
    }

    async fn handle_verdict(&mut self, verdict: Verdict) {
        let piece_index = verdict.piece_index;
        if self.store.state(piece_index) != PieceState::Complete {
            log::warn!("Stale verdict for piece {}", piece_index);
            return;
        }

        if verdict.is_valid {
            self.handle_piece_verified(piece_index);
        } else {
            self.handle_piece_failed(piece_index);
        }

        // either outcome can open pipeline slots: verification lifts the
        // in-flight cap, failure returns blocks to the pool
        self.refill_all();
    }

    fn handle_piece_verified(&mut self, piece_index: PieceIndex) {
        log::info!("Piece {} verified", piece_index);
        let contributors = self.store.contributors(piece_index);
        self.store.mark_verified(piece_index);
        self.picker.update_endgame(&self.store);

        // a good piece clears its peers' failure strikes
        for contributor in &contributors {
            if let Some(conn) = self.connections.get_mut(contributor) {
                conn.hash_failures = 0;
            }
        }

        self.emit(SwarmEvent::PieceVerified { piece_index });
        self.broadcast_have(piece_index);

        if self.rehashing.remove(&piece_index) {
            // the bytes came from storage in the first place
            self.store.evict(piece_index);
        } else if !self.paused {
            if let Some(data) = self.store.piece(piece_index).assemble() {
                self.spawn_write(piece_index, data);
            }
        }

        if self.store.all_verified() && !self.download_complete_emitted {
            log::info!("Download complete");
            self.download_complete_emitted = true;
            self.emit(SwarmEvent::DownloadComplete);
        }
    }

    fn handle_piece_failed(&mut self, piece_index: PieceIndex) {
        log::warn!("Piece {} failed hash verification", piece_index);
        self.rehashing.remove(&piece_index);
        let contributors = self.store.mark_failed(piece_index);

        let mut to_disconnect = Vec::new();
        for contributor in contributors {
            self.avail
                .penalize(&contributor, self.conf.reliability_penalty);
            if let Some(score) = self.avail.reliability(&contributor) {
                log::info!(
                    "Peer {} reliability down to {:.2}",
                    contributor,
                    score
                );
            }
            if let Some(conn) = self.connections.get_mut(&contributor) {
                conn.hash_failures += 1;
                if conn.hash_failures >= self.conf.max_peer_hash_failures {
                    to_disconnect.push(contributor);
                }
            }
        }
        for addr in to_disconnect {
            self.disconnect(
                addr,
                Some(Error::HashVerificationFailed(piece_index)),
            );
        }
    }

    /// Announces a fresh piece to every connection that is past the
    /// availability exchange, except those that advertised the piece
    /// themselves.
    fn broadcast_have(&mut self, piece_index: PieceIndex) {
        // peers that advertised the piece themselves are suppressed
        let holders: std::collections::HashSet<SocketAddr> =
            self.avail.peers_with(piece_index).copied().collect();
        let mut failed = Vec::new();
        for (addr, conn) in self.connections.iter() {
            if !conn.state.may_receive_have() || holders.contains(addr) {
                continue;
            }
            if conn.send_have(piece_index).is_err() {
                failed.push(*addr);
            }
        }
        for addr in failed {
            self.disconnect(addr, Some(Error::SendFailed));
        }
    }

    // ------------------------------------------------------------------
    // pipelining
    // ------------------------------------------------------------------

    /// Refills the peer's request pipeline if it has open slots. This is
    /// the pull model: it runs when something just made slots or blocks
    /// available, never on a timer of its own.
    fn refill(&mut self, addr: SocketAddr) {
        if self.paused {
            return;
        }
        let open_slots = match self.connections.get(&addr) {
            Some(conn) if conn.can_request() => conn.open_slots(),
            _ => return,
        };
        let peer_pieces = match self.avail.peer_pieces(&addr) {
            Some(pieces) => pieces.clone(),
            None => return,
        };

        let mut blocks = Vec::new();
        self.picker.pick_blocks(
            addr,
            &peer_pieces,
            open_slots,
            &mut self.store,
            &self.avail,
            &mut blocks,
        );
        if blocks.is_empty() {
            return;
        }
        log::debug!(
            "Requesting {} block(s) from peer {}",
            blocks.len(),
            addr
        );

        let now = Instant::now();
        let mut failed = false;
        if let Some(conn) = self.connections.get_mut(&addr) {
            for block in blocks {
                if conn.queue_request(block, now).is_err() {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.disconnect(addr, Some(Error::SendFailed));
        }
    }

    fn refill_all(&mut self) {
        let addrs: Vec<SocketAddr> =
            self.connections.keys().copied().collect();
        for addr in addrs {
            self.refill(addr);
        }
    }

    // ------------------------------------------------------------------
    // choking
    // ------------------------------------------------------------------

    fn choke_tick(&mut self) {
        let seeding = self.store.all_verified();
        let ranks: Vec<PeerRank> = self
            .connections
            .values()
            .filter(|conn| conn.state.is_online())
            .map(|conn| PeerRank {
                peer_key: conn.addr,
                download_rate: conn.downloaded.rate(),
                upload_rate: conn.uploaded.rate(),
                peer_interested: conn.peer_interested,
            })
            .collect();

        let decision =
            self.choker
                .tick(&ranks, seeding, Instant::now(), &mut self.rng);
        log::debug!(
            "Choke tick: {} unchoke(s), {} choke(s), optimistic {:?}",
            decision.unchoke.len(),
            decision.choke.len(),
            self.choker.optimistic()
        );

        let mut failed = Vec::new();
        for addr in &decision.choke {
            if let Some(conn) = self.connections.get_mut(addr) {
                if conn.send_choke().is_err() {
                    failed.push(*addr);
                }
            }
        }
        for addr in &decision.unchoke {
            if let Some(conn) = self.connections.get_mut(addr) {
                if conn.send_unchoke().is_err() {
                    failed.push(*addr);
                }
            }
        }
        for addr in failed {
            self.disconnect(addr, Some(Error::SendFailed));
        }
    }

    /// Keeps the unchoked-and-interested population within the slot budget
    /// between ticks. New connections start unchoked to observe
    /// reciprocation, but once a peer declares interest it has to fit.
    fn enforce_choke_bound(&mut self, addr: SocketAddr) {
        let unchoked_interested = self
            .connections
            .values()
            .filter(|conn| !conn.am_choking && conn.peer_interested)
            .count();
        if unchoked_interested > self.conf.max_upload_slots + 1 {
            if let Some(conn) = self.connections.get_mut(&addr) {
                let _ = conn.send_choke();
            }
        }
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    fn stats_tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_stats);
        self.last_stats = now;

        self.downloaded.sample(elapsed);
        self.uploaded.sample(elapsed);
        for conn in self.connections.values_mut() {
            conn.downloaded.sample(elapsed);
            conn.uploaded.sample(elapsed);
        }

        self.sweep_request_timeouts(now);
        let blocklist_ttl = self.conf.blocklist_ttl;
        self.blocklist.retain(|_, blocked_at| {
            now.duration_since(*blocked_at) < blocklist_ttl
        });
        // the availability index tracks connected peers only
        debug_assert!(self.avail.peer_count() <= self.connections.len());

        self.emit(SwarmEvent::StatsTick(self.build_stats()));
        self.refill_all();
    }

    /// Expires overdue requests and detects snubs. Both shrink the culprit
    /// peer's pipeline; repeated snubbing disconnects it.
    fn sweep_request_timeouts(&mut self, now: Instant) {
        let mut cleared: Vec<(BlockInfo, SocketAddr)> = Vec::new();
        let mut snubbed: Vec<SocketAddr> = Vec::new();
        let request_timeout = self.conf.request_timeout;
        let snub_timeout = self.conf.snub_timeout;
        let max_snub_count = self.conf.max_snub_count;

        for (addr, conn) in self.connections.iter_mut() {
            let expired: Vec<(BlockInfo, u32)> = conn
                .outstanding_requests
                .iter()
                .filter(|(_, info)| {
                    now.duration_since(info.requested_at)
                        > request_timeout
                })
                .map(|(block, info)| (*block, info.retry_count))
                .collect();
            if !expired.is_empty() {
                conn.shrink_pipeline();
                for (block, retry_count) in expired {
                    log::debug!(
                        "Request {:?} to peer {} timed out (retry {})",
                        block,
                        addr,
                        retry_count
                    );
                    conn.outstanding_requests.remove(&block);
                    conn.timed_out_requests += 1;
                    cleared.push((block, *addr));
                }
            }

            // a snub is an unchoked peer sitting on our requests without
            // delivering anything for a whole window
            if !conn.peer_choking && !conn.outstanding_requests.is_empty() {
                if now.duration_since(conn.last_snub_check)
                    >= snub_timeout
                {
                    conn.snub_count += 1;
                    conn.last_snub_check = now;
                    conn.shrink_pipeline();
                    log::info!(
                        "Peer {} snubbed us ({} in a row, last block {:?} ago)",
                        addr,
                        conn.snub_count,
                        conn.last_block_at.map(|at| now.duration_since(at))
                    );
                    if conn.snub_count >= max_snub_count {
                        snubbed.push(*addr);
                    }
                }
            } else {
                conn.last_snub_check = now;
            }
        }

        for (block, addr) in cleared {
            self.store.clear_requested(block, &addr);
        }
        for addr in snubbed {
            self.disconnect(addr, Some(Error::PeerTimeout));
        }
    }

    fn build_stats(&self) -> SwarmStats {
        let counts = self.store.state_counts();
        let piece_count = self.store.piece_count();
        SwarmStats {
            progress: if piece_count == 0 {
                1.0
            } else {
                counts.verified as f64 / piece_count as f64
            },
            download_rate: self.downloaded.rate(),
            upload_rate: self.uploaded.rate(),
            downloaded_payload_bytes: self.downloaded.total(),
            uploaded_payload_bytes: self.uploaded.total(),
            peer_count: self.connections.len(),
            pieces_missing: counts.missing,
            pieces_pending: counts.requested + counts.downloading,
            pieces_complete: counts.complete,
            pieces_verified: counts.verified,
            in_endgame: self.picker.in_endgame(),
            average_availability: self.avail.average_frequency(),
            rarest_availability: self.avail.rarest_frequency(),
        }
    }

    // ------------------------------------------------------------------
    // storage
    // ------------------------------------------------------------------

    fn pause(&mut self, error: Error) {
        debug_assert!(error.is_fatal());
        if !self.paused {
            log::error!("Pausing torrent: {}", error);
            self.paused = true;
            self.emit(SwarmEvent::Paused {
                reason: error.to_string(),
            });
        }
    }

    fn probe_existing_pieces(&self) {
        let assembler = Arc::clone(&self.assembler);
        let storage_chan = self.storage_chan.clone();
        tokio::spawn(async move {
            let result =
                task::spawn_blocking(move || assembler.existing_pieces())
                    .await
                    .unwrap_or_else(|_| Ok(BTreeSet::new()));
            let _ =
                storage_chan.send(StorageResult::ExistingPieces(result));
        });
    }

    /// Reads a whole piece back from the assembler, block by block, off the
    /// manager task.
    fn spawn_rehash_read(&self, piece_index: PieceIndex) {
        let assembler = Arc::clone(&self.assembler);
        let storage_chan = self.storage_chan.clone();
        let piece_len = match self.torrent.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => return,
        };
        let block_size = self.store.block_size();
        tokio::spawn(async move {
            let data = task::spawn_blocking(move || {
                let mut data = Vec::with_capacity(piece_len as usize);
                let mut offset = 0;
                while offset < piece_len {
                    let len = block_size.min(piece_len - offset);
                    match assembler.read_block(piece_index, offset, len) {
                        Ok(Some(block))
                            if block.len() == len as usize =>
                        {
                            data.extend_from_slice(&block)
                        }
                        _ => return None,
                    }
                    offset += len;
                }
                Some(data)
            })
            .await
            .unwrap_or(None);
            let _ = storage_chan.send(StorageResult::RehashRead {
                piece_index,
                data,
            });
        });
    }

    /// Writes a verified piece through the assembler off the manager task.
    fn spawn_write(&self, piece_index: PieceIndex, data: Vec<u8>) {
        let assembler = Arc::clone(&self.assembler);
        let storage_chan = self.storage_chan.clone();
        let block_size = self.store.block_size();
        tokio::spawn(async move {
            let result = task::spawn_blocking(move || {
                let mut offset = 0u32;
                while (offset as usize) < data.len() {
                    let end =
                        (offset as usize + block_size as usize).min(data.len());
                    assembler.write_block(
                        piece_index,
                        offset,
                        &data[offset as usize..end],
                    )?;
                    offset = end as u32;
                }
                Ok(())
            })
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "write task failed",
                ))
            });
            let _ = storage_chan.send(StorageResult::WriteDone {
                piece_index,
                result,
            });
        });
    }

    async fn handle_storage_result(&mut self, result: StorageResult) {
        match result {
            StorageResult::ExistingPieces(Ok(pieces)) => {
                for piece_index in pieces {
                    if piece_index < self.store.piece_count()
                        && !self.store.is_verified(piece_index)
                    {
                        log::info!(
                            "Rechecking piece {} found on disk",
                            piece_index
                        );
                        self.rehashing.insert(piece_index);
                        self.spawn_rehash_read(piece_index);
                    }
                }
            }
            StorageResult::ExistingPieces(Err(error)) => {
                self.pause(Error::StorageUnavailable(format!(
                    "storage probe failed: {}",
                    error
                )));
            }
            StorageResult::WriteDone {
                piece_index,
                result: Ok(()),
            } => {
                // the piece is durable; its memory can be reclaimed
                self.store.evict(piece_index);
            }
            StorageResult::WriteDone {
                piece_index,
                result: Err(error),
            } => {
                self.pause(Error::StorageUnavailable(format!(
                    "writing piece {} failed: {}",
                    piece_index, error
                )));
            }
            StorageResult::ReadDone { addr, block, data } => {
                self.finish_upload_read(addr, block, data);
            }
            StorageResult::RehashRead { piece_index, data } => {
                self.finish_rehash_read(piece_index, data).await;
            }
        }
    }

    fn finish_upload_read(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Option<Vec<u8>>,
    ) {
        let still_wanted = match self.connections.get_mut(&addr) {
            Some(conn) => {
                conn.pending_uploads.remove(&block) && !conn.am_choking
            }
            None => false,
        };
        match data {
            Some(data) if still_wanted => {
                self.send_served_block(addr, block, data)
            }
            // a miss or a cancelled/choked request is silently dropped
            _ => {}
        }
    }

    async fn finish_rehash_read(
        &mut self,
        piece_index: PieceIndex,
        data: Option<Vec<u8>>,
    ) {
        let data = match data {
            Some(data) => data,
            None => {
                log::warn!(
                    "Could not read piece {} back from storage",
                    piece_index
                );
                self.rehashing.remove(&piece_index);
                return;
            }
        };

        match self.store.state(piece_index) {
            // startup recheck: thread the bytes through the store so the
            // piece walks the normal state machine
            PieceState::Missing => {
                let mut complete = false;
                for block in self.store.missing_blocks(piece_index) {
                    let start = block.offset as usize;
                    let end = start + block.len as usize;
                    if end > data.len() {
                        break;
                    }
                    match self.store.add_block(
                        block,
                        data[start..end].to_vec(),
                        LOCAL_SOURCE,
                    ) {
                        Ok(AddResult::StoredComplete) => complete = true,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                if complete {
                    self.queue_verification(piece_index).await;
                } else {
                    self.rehashing.remove(&piece_index);
                }
            }
            // full recheck of an evicted piece: hand the bytes straight to
            // the verifier
            PieceState::Complete => {
                self.queue_verification_with(piece_index, data).await;
            }
            _ => {
                self.rehashing.remove(&piece_index);
            }
        }
    }

    /// Moves every verified piece back to complete and re-checks it, from
    /// memory where possible and from storage otherwise.
    async fn rehash_all(&mut self) {
        log::info!("Re-checking all verified pieces");
        for piece_index in self.store.rehash_all() {
            self.rehashing.insert(piece_index);
            if let Some(data) = self.store.piece(piece_index).assemble() {
                self.queue_verification_with(piece_index, data).await;
            } else {
                self.spawn_rehash_read(piece_index);
            }
        }
    }

    /// Hands a piece to the verifier pool; backpressures when the hash
    /// queue is full.
    async fn queue_verification_with(
        &mut self,
        piece_index: PieceIndex,
        data: Vec<u8>,
    ) {
        let expected_hash = match self.torrent.piece_hash(piece_index) {
            Ok(hash) => hash,
            Err(_) => return,
        };
        if let Err(error) = self
            .verifier
            .verify(VerifyJob {
                piece_index,
                data,
                expected_hash,
            })
            .await
        {
            log::warn!("Could not queue piece {}: {}", piece_index, error);
        }
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    async fn shutdown(self) {
        log::info!("Shutting down swarm");
        let mut handles = Vec::with_capacity(self.connections.len());
        for (_, conn) in self.connections {
            conn.shutdown();
            handles.push(conn.task);
        }
        // sessions get a grace period for their final flushes
        let _ =
            time::timeout(SHUTDOWN_GRACE, future::join_all(handles)).await;

        // the verifier joins its workers with its own bounded timeout
        let verifier = self.verifier;
        let _ = task::spawn_blocking(move || verifier.shutdown()).await;
        log::info!("Swarm shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAssembler;

    impl FileAssembler for NullAssembler {
        fn write_block(
            &self,
            _piece_index: PieceIndex,
            _offset: u32,
            _data: &[u8],
        ) -> std::io::Result<()> {
            Ok(())
        }

        fn read_block(
            &self,
            _piece_index: PieceIndex,
            _offset: u32,
            _len: u32,
        ) -> std::io::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn existing_pieces(&self) -> std::io::Result<BTreeSet<PieceIndex>> {
            Ok(BTreeSet::new())
        }
    }

    fn torrent() -> Arc<TorrentInfo> {
        Arc::new(
            TorrentInfo::new([7; 20], 32, 64, vec![[0; 20]; 2]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_checkpoint_restores_verified_pieces() {
        let mut verified = BTreeSet::new();
        verified.insert(1);
        let checkpoint = Checkpoint {
            info_hash: [7; 20],
            verified_pieces: verified.clone(),
        };
        let (swarm, _handle, _events) = Swarm::new(
            Conf::default(),
            torrent(),
            Arc::new(NullAssembler),
            Some(checkpoint),
        );
        assert!(swarm.trusted_resume);
        assert_eq!(swarm.store.verified(), &verified);
        assert_eq!(swarm.checkpoint().verified_pieces, verified);
    }

    #[tokio::test]
    async fn test_mismatched_checkpoint_is_ignored() {
        let checkpoint = Checkpoint {
            info_hash: [9; 20],
            verified_pieces: std::iter::once(0).collect(),
        };
        let (swarm, _handle, _events) = Swarm::new(
            Conf::default(),
            torrent(),
            Arc::new(NullAssembler),
            Some(checkpoint),
        );
        assert!(!swarm.trusted_resume);
        assert_eq!(swarm.store.num_verified(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_run() {
        let (swarm, handle, _events) = Swarm::new(
            Conf::default(),
            torrent(),
            Arc::new(NullAssembler),
            None,
        );
        handle.shutdown().unwrap();
        time::timeout(Duration::from_secs(5), swarm.run())
            .await
            .expect("run did not stop on shutdown")
            .unwrap();
    }
}
