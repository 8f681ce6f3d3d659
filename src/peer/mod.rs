//! A single peer connection.
//!
//! A connection is split in two along the ownership tree: the [`session`]
//! task owns the socket and nothing else, while the [`PeerConnection`]
//! record here is owned by the swarm manager and holds all shared-state
//! bookkeeping (the connection state machine, the request pipeline, and the
//! transfer counters). The two halves talk only through channels, so there
//! are no reference cycles between a connection and the manager.

pub mod codec;
pub(crate) mod session;

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{conf::Conf, counter::ThruputCounter, error::*, BlockInfo, PeerId};

use codec::Message;

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// The peer connection has not been started yet.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// Our handshake is on the wire, the peer's is awaited.
    HandshakeSent,
    /// The peer's handshake arrived and checked out.
    HandshakeReceived,
    /// We have announced our own piece availability.
    BitfieldSent,
    /// The peer's piece availability is known (an actual bitfield, or the
    /// first non-bitfield message standing in for an empty one).
    BitfieldReceived,
    /// Bitfields are exchanged and the peer is not choking us.
    Active,
    /// Bitfields are exchanged but the peer is choking us. Outstanding
    /// requests are kept; the peer may still deliver blocks in flight.
    Choked,
    /// The connection is being torn down due to an error.
    Error,
}

impl ConnState {
    /// Whether the session is past the availability exchange and operating.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnState::Active | ConnState::Choked)
    }

    /// Whether the peer may be sent a HAVE announcement.
    pub fn may_receive_have(&self) -> bool {
        matches!(
            self,
            ConnState::BitfieldSent
                | ConnState::BitfieldReceived
                | ConnState::Active
                | ConnState::Choked
        )
    }
}

impl Default for ConnState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Bookkeeping of one request we sent and have not seen answered.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RequestInfo {
    pub requested_at: Instant,
    pub retry_count: u32,
}

/// What the manager can tell a session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Write the message to the peer.
    Send(Message),
    /// Flush and close the connection.
    Shutdown,
}

/// What a session task reports to the manager. Every event carries the
/// session's address so one ordered channel serves all peers.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The handshakes were exchanged and validated.
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// A decoded message from the peer.
    Message { addr: SocketAddr, msg: Message },
    /// The session ended; `error` is `None` on a clean close initiated by
    /// either side.
    Disconnected {
        addr: SocketAddr,
        error: Option<Error>,
    },
}

/// The manager-owned half of a peer connection.
pub(crate) struct PeerConnection {
    pub addr: SocketAddr,
    pub state: ConnState,
    /// Set once the handshake arrives.
    pub peer_id: Option<PeerId>,

    pub am_choking: bool,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    pub bitfield_sent: bool,
    pub bitfield_received: bool,

    /// The requests we sent that have not been answered by a block or
    /// cancelled. Never exceeds `pipeline_depth`.
    pub outstanding_requests: HashMap<BlockInfo, RequestInfo>,
    /// The adaptive pipeline depth, kept within the configured bounds.
    pub pipeline_depth: usize,

    pub downloaded: ThruputCounter,
    pub uploaded: ThruputCounter,
    pub last_block_at: Option<Instant>,
    /// When the current snub observation window started.
    pub last_snub_check: Instant,
    pub snub_count: u32,
    /// Consecutive failed pieces this peer contributed blocks to.
    pub hash_failures: u32,
    pub completed_requests: u64,
    pub timed_out_requests: u64,
    /// Requests from the peer whose data is being fetched from storage.
    pub pending_uploads: std::collections::HashSet<BlockInfo>,

    min_pipeline_depth: usize,
    max_pipeline_depth: usize,
    rtt_target: Duration,
    success_rate_target: f64,

    cmd_chan: mpsc::Sender<SessionCommand>,
    pub task: JoinHandle<()>,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        conf: &Conf,
        cmd_chan: mpsc::Sender<SessionCommand>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            addr,
            state: ConnState::Connecting,
            peer_id: None,
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            bitfield_sent: false,
            bitfield_received: false,
            outstanding_requests: HashMap::new(),
            pipeline_depth: conf.pipeline_depth,
            downloaded: ThruputCounter::default(),
            uploaded: ThruputCounter::default(),
            last_block_at: None,
            last_snub_check: Instant::now(),
            snub_count: 0,
            hash_failures: 0,
            completed_requests: 0,
            timed_out_requests: 0,
            pending_uploads: std::collections::HashSet::new(),
            min_pipeline_depth: conf.min_pipeline_depth,
            max_pipeline_depth: conf.max_pipeline_depth,
            rtt_target: conf.pipeline_rtt_target,
            success_rate_target: conf.pipeline_success_rate,
            cmd_chan,
            task,
        }
    }

    /// Hands a message to the session task for writing. The channel is
    /// bounded; a peer that cannot drain its writer in time is treated as
    /// failed rather than allowed to buffer without limit.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.cmd_chan
            .try_send(SessionCommand::Send(msg))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::SendFailed,
                mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
            })
    }

    /// Asks the session to flush and close.
    pub fn shutdown(&self) {
        let _ = self.cmd_chan.try_send(SessionCommand::Shutdown);
    }

    pub fn open_slots(&self) -> usize {
        self.pipeline_depth
            .saturating_sub(self.outstanding_requests.len())
    }

    /// Whether the pipeline may be refilled right now.
    pub fn can_request(&self) -> bool {
        self.state == ConnState::Active
            && self.am_interested
            && !self.peer_choking
            && self.open_slots() > 0
    }

    /// Writes a REQUEST and registers it in the pipeline.
    pub fn queue_request(&mut self, block: BlockInfo, now: Instant) -> Result<()> {
        debug_assert!(self.outstanding_requests.len() < self.pipeline_depth);
        self.outstanding_requests.insert(
            block,
            RequestInfo {
                requested_at: now,
                retry_count: 0,
            },
        );
        self.send(Message::Request(block))
    }

    /// Writes a CANCEL if the block is still outstanding.
    pub fn cancel(&mut self, block: BlockInfo) -> Result<()> {
        if self.outstanding_requests.remove(&block).is_some() {
            self.send(Message::Cancel(block))?;
        }
        Ok(())
    }

    pub fn send_have(&self, piece_index: crate::PieceIndex) -> Result<()> {
        self.send(Message::Have { piece_index })
    }

    pub fn send_choke(&mut self) -> Result<()> {
        if !self.am_choking {
            self.send(Message::Choke)?;
            self.am_choking = true;
        }
        Ok(())
    }

    pub fn send_unchoke(&mut self) -> Result<()> {
        if self.am_choking {
            self.send(Message::Unchoke)?;
            self.am_choking = false;
        }
        Ok(())
    }

    /// Registers a solicited block delivery and adapts the pipeline depth:
    /// fast, reliable links get one more slot, up to the cap.
    ///
    /// Returns the fulfilled request entry, or `None` for a block we never
    /// asked for.
    pub fn on_block_received(
        &mut self,
        block: BlockInfo,
        now: Instant,
    ) -> Option<RequestInfo> {
        let info = self.outstanding_requests.remove(&block)?;
        self.completed_requests += 1;
        self.last_block_at = Some(now);
        self.last_snub_check = now;
        self.snub_count = 0;

        let rtt = now.duration_since(info.requested_at);
        if rtt < self.rtt_target
            && self.request_success_rate() > self.success_rate_target
        {
            self.pipeline_depth =
                (self.pipeline_depth + 1).min(self.max_pipeline_depth);
        }
        Some(info)
    }

    /// Halves the pipeline depth after a timeout or snub.
    pub fn shrink_pipeline(&mut self) {
        self.pipeline_depth =
            (self.pipeline_depth / 2).max(self.min_pipeline_depth);
    }

    /// The fraction of requests that completed rather than timed out.
    pub fn request_success_rate(&self) -> f64 {
        let total = self.completed_requests + self.timed_out_requests;
        if total == 0 {
            1.0
        } else {
            self.completed_requests as f64 / total as f64
        }
    }

    /// Re-derives the online state once both bitfields are exchanged, and
    /// keeps Active/Choked in step with `peer_choking` afterwards.
    pub fn sync_online_state(&mut self) {
        if self.bitfield_sent && self.bitfield_received {
            self.state = if self.peer_choking {
                ConnState::Choked
            } else {
                ConnState::Active
            };
        }
    }
}
