//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::{piece_picker::Strategy, PeerId};

/// The default swarmtorrent client id.
pub const SWARMTORRENT_CLIENT_ID: &PeerId = b"swt-0000000000000000";

/// The configuration of a swarm and all its parts.
///
/// The engine consumes a plain value; any process-wide configuration store
/// belongs to the embedder. The defaults are sensible for real swarms, tests
/// shrink the intervals.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to peers.
    pub client_id: PeerId,

    /// The length of the blocks pieces are split into for download. The
    /// widely used and accepted value is 16 KiB.
    pub block_len: u32,

    /// The largest block a peer may request from us or send to us. Anything
    /// larger is a protocol violation.
    pub max_block_len: u32,

    /// The initial number of outstanding requests kept on a peer link.
    pub pipeline_depth: usize,
    /// The bounds within which a peer's pipeline depth is adapted.
    pub min_pipeline_depth: usize,
    pub max_pipeline_depth: usize,
    /// Block round trips faster than this grow the pipeline.
    pub pipeline_rtt_target: Duration,
    /// The request success rate (completed vs timed out) that must hold for
    /// the pipeline to grow.
    pub pipeline_success_rate: f64,

    /// The max number of connected peers the swarm should have. Peer
    /// discovery must stop pushing candidates once this is reached.
    pub max_connections: usize,

    /// The number of regular (tit-for-tat) upload slots.
    pub max_upload_slots: usize,
    /// The max number of upload reads in flight towards one peer; requests
    /// beyond it are silently dropped, which the protocol allows.
    pub max_pending_uploads: usize,
    /// How long a storage read may take before the pending upload is dropped.
    pub upload_read_timeout: Duration,

    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// A keep-alive must be sent after this much write-silence.
    pub keep_alive_interval: Duration,
    /// A connection with no traffic in either direction for this long is
    /// torn down.
    pub idle_timeout: Duration,
    /// An unchoked peer delivering no block for this long despite outstanding
    /// requests is snubbed.
    pub snub_timeout: Duration,
    /// Snubs tolerated before the peer is disconnected.
    pub max_snub_count: u32,
    /// An outstanding request older than this is abandoned and re-picked.
    pub request_timeout: Duration,

    pub unchoke_interval: Duration,
    pub optimistic_interval: Duration,
    pub stats_interval: Duration,

    /// The piece selection strategy.
    pub strategy: Strategy,
    /// Biases selection towards the front of the torrent for playback.
    pub streaming_mode: bool,
    /// The verified fraction at which endgame mode latches.
    pub endgame_threshold: f64,
    /// How many peers the same block may be requested from in endgame.
    pub endgame_duplicates: usize,

    /// The number of SHA-1 worker threads.
    pub hash_workers: usize,
    /// The capacity of the queue feeding the hash workers; producers
    /// backpressure when it is full.
    pub hash_queue_len: usize,
    /// SHA-1 is fed in chunks of this size to stay cache friendly.
    pub hash_chunk_len: usize,

    /// Soft cap on pieces sitting complete-but-unverified in memory; the
    /// picker stops starting new pieces beyond it.
    pub max_in_flight_pieces: usize,

    /// Consecutive hash failures attributed to one peer before disconnecting
    /// it.
    pub max_peer_hash_failures: u32,
    /// How much a peer's reliability score drops per failed piece it
    /// contributed to.
    pub reliability_penalty: f64,
    /// How long a misbehaving peer stays blocklisted.
    pub blocklist_ttl: Duration,

    /// Capacity of the channel on which peer sessions forward decoded
    /// messages to the swarm manager.
    pub event_channel_len: usize,
    /// Capacity of each session's outbound message channel.
    pub peer_channel_len: usize,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            client_id: *SWARMTORRENT_CLIENT_ID,
            block_len: 0x4000,
            max_block_len: 0x2_0000,
            pipeline_depth: 16,
            min_pipeline_depth: 4,
            max_pipeline_depth: 128,
            pipeline_rtt_target: Duration::from_millis(100),
            pipeline_success_rate: 0.95,
            max_connections: 80,
            max_upload_slots: 4,
            max_pending_uploads: 8,
            upload_read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(120),
            snub_timeout: Duration::from_secs(30),
            max_snub_count: 3,
            request_timeout: Duration::from_secs(30),
            unchoke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(5),
            strategy: Strategy::RarestFirst,
            streaming_mode: false,
            endgame_threshold: 0.95,
            endgame_duplicates: 4,
            hash_workers: num_cpus().min(4),
            hash_queue_len: 128,
            hash_chunk_len: 0x4_0000,
            max_in_flight_pieces: 64,
            max_peer_hash_failures: 10,
            reliability_penalty: 0.1,
            blocklist_ttl: Duration::from_secs(600),
            event_channel_len: 512,
            peer_channel_len: 64,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
