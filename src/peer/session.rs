//! The per-peer IO task.
//!
//! A session owns its socket and two channel ends, nothing more. It dials,
//! exchanges handshakes, switches the framed stream from the handshake codec
//! to the peer message codec, and then loops: decoded inbound messages are
//! forwarded to the manager, outbound messages handed down by the manager
//! are written to the sink. Keep-alives and the idle disconnect are handled
//! here because they are properties of the socket, not of shared state.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{conf::Conf, error::*, torrent::TorrentInfo, PeerId};

use super::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    ConnState, SessionCommand, SessionEvent,
};

pub(crate) struct Session {
    addr: SocketAddr,
    torrent: Arc<TorrentInfo>,
    client_id: PeerId,
    conf: Conf,
    event_chan: mpsc::Sender<SessionEvent>,
    cmd_port: mpsc::Receiver<SessionCommand>,
    state: ConnState,
}

impl Session {
    pub fn new(
        addr: SocketAddr,
        torrent: Arc<TorrentInfo>,
        client_id: PeerId,
        conf: Conf,
        event_chan: mpsc::Sender<SessionEvent>,
        cmd_port: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        Self {
            addr,
            torrent,
            client_id,
            conf,
            event_chan,
            cmd_port,
            state: ConnState::Disconnected,
        }
    }

    /// Runs the session to completion and always reports the outcome to the
    /// manager, including failures to connect in the first place.
    pub async fn run(mut self) {
        let addr = self.addr;
        let error = match self.start().await {
            Ok(()) => None,
            Err(e) => {
                log::info!("Peer {} session ended: {}", addr, e);
                Some(e)
            }
        };
        self.state = match error {
            Some(_) => ConnState::Error,
            None => ConnState::Disconnected,
        };
        let _ = self
            .event_chan
            .send(SessionEvent::Disconnected { addr, error })
            .await;
    }

    async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = ConnState::Connecting;
        let socket = time::timeout(
            self.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::ConnectFailed)?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we send the first handshake
        let handshake =
            Handshake::new(self.torrent.info_hash, self.client_id);
        socket.send(handshake).await?;
        self.state = ConnState::HandshakeSent;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            time::timeout(self.conf.handshake_timeout, socket.next())
                .await
                .map_err(|_| Error::Timeout)?
                .ok_or(Error::HandshakeFailed)??;
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // the codec already checked the protocol string; the info hash must
        // be our torrent's
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InfoHashMismatch);
        }
        self.state = ConnState::HandshakeReceived;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        self.event_chan
            .send(SessionEvent::Connected {
                addr: self.addr,
                peer_id: peer_handshake.peer_id,
            })
            .await
            .map_err(|_| Error::Shutdown)?;

        // Now that we have the handshake, we need to switch to the peer
        // message codec and keep the buffers of the original codec, as they
        // may already contain bytes of whatever the peer sent after its
        // handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(
            old_parts.io,
            PeerCodec::new(
                Arc::clone(&self.torrent),
                self.conf.max_block_len,
            ),
        );
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run_loop(socket).await
    }

    /// The main session loop: read frames, forward them, drain outbound
    /// commands, keep the link alive.
    async fn run_loop(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        let mut last_read = Instant::now();
        let mut last_write = Instant::now();

        // the tick drives both keep-alive sends and the idle check, so it
        // has to fire a few times per keep-alive window
        let tick_len = self.conf.keep_alive_interval.min(
            self.conf.idle_timeout / 4,
        );
        let mut tick = time::interval(tick_len.max(time::Duration::from_millis(50)));
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        // EOF: the peer hung up
                        None => return Ok(()),
                    };
                    last_read = Instant::now();
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    self.event_chan
                        .send(SessionEvent::Message {
                            addr: self.addr,
                            msg,
                        })
                        .await
                        .map_err(|_| Error::Shutdown)?;
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(msg)) => {
                            sink.send(msg).await?;
                            last_write = Instant::now();
                        }
                        Some(SessionCommand::Shutdown) | None => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            // flush whatever is still buffered before
                            // closing the socket
                            let _ = sink.flush().await;
                            return Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_read) > self.conf.idle_timeout {
                        log::info!("Peer {} idle, disconnecting", self.addr);
                        return Err(Error::PeerTimeout);
                    }
                    if now.duration_since(last_write)
                        >= self.conf.keep_alive_interval
                    {
                        log::debug!("Sending keep alive to peer {}", self.addr);
                        sink.send(Message::KeepAlive).await?;
                        last_write = Instant::now();
                    }
                }
            }
        }
    }
}
