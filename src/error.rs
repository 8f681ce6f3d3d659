//! Error types surfaced at the public seams of the engine.
//!
//! Every peer-scoped error is recovered locally by disconnecting that peer;
//! only storage faults are fatal to the swarm.

use thiserror::Error;

use crate::PieceIndex;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur in the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The TCP connection to the peer could not be established.
    #[error("could not connect to peer: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The peer's handshake was malformed.
    #[error("peer handshake failed")]
    HandshakeFailed,

    /// The peer's handshake advertised a different torrent.
    #[error("peer handshake info hash mismatch")]
    InfoHashMismatch,

    /// The peer violated the wire protocol (bad frame, bad length, or an
    /// out-of-range piece or block reference).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The connect or handshake attempt did not complete in time.
    #[error("peer operation timed out")]
    Timeout,

    /// The peer was idle, stopped responding to keep-alives, or snubbed us.
    #[error("peer timed out")]
    PeerTimeout,

    /// Too many pieces sit complete-but-unverified in memory. A signal to
    /// back off, never fatal: the picker simply stops starting new pieces
    /// until verification catches up.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The peer's outbound queue overflowed, i.e. the peer is not draining
    /// its writer fast enough to keep the connection worth having.
    #[error("peer outbound queue overflowed")]
    SendFailed,

    /// A completed piece did not match its expected SHA-1 hash.
    #[error("piece {0} failed hash verification")]
    HashVerificationFailed(PieceIndex),

    /// A block offset that does not fall on a registered block boundary.
    #[error("invalid block offset")]
    InvalidBlockOffset,

    /// A block whose length does not match the registered block length.
    #[error("invalid block length")]
    InvalidBlockLength,

    /// The piece index is not within the torrent's piece count.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// The file assembler could not serve a read or write. This pauses the
    /// torrent and is reported to the embedder.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The engine is shutting down and can no longer accept work.
    #[error("engine shut down")]
    Shutdown,

    /// An IO error on the peer socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the error pauses the whole torrent rather than just
    /// terminating a single peer connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }

    /// Returns true if the offending peer should be blocklisted for a while
    /// to prevent reconnection churn.
    ///
    /// Covers handshake and protocol violations, keep-alive/snub timeouts,
    /// and the hash-failure strike-out, which only reaches a disconnect
    /// once the per-peer failure threshold is hit.
    pub(crate) fn is_blocklistable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed
                | Error::InfoHashMismatch
                | Error::Protocol(_)
                | Error::PeerTimeout
                | Error::HashVerificationFailed(_)
        )
    }
}
