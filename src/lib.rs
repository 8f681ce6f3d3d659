// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod availability;
mod choker;
pub mod conf;
mod counter;
pub mod error;
pub mod peer;
mod piece_picker;
mod piece_store;
pub mod swarm;
pub mod torrent;
mod verifier;

use bitvec::prelude::{BitVec, Msb0};

pub use crate::{
    conf::Conf,
    error::{Error, Result},
    piece_picker::Strategy,
    swarm::{
        Checkpoint, FileAssembler, Swarm, SwarmEvent, SwarmHandle, SwarmStats,
    },
    torrent::TorrentInfo,
};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. At most the configured block length,
    /// 16 KiB by default.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece for the given nominal
    /// block length.
    pub fn index_in_piece(&self, block_size: u32) -> usize {
        // we need to use "lower than or equal" as this may be the last block in
        // which case it may be shorter than the nominal block length
        debug_assert!(self.len <= block_size);
        debug_assert!(self.len > 0);
        (self.offset / block_size) as usize
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the nominal block length, the returned
/// value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the nominal block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, block_size: u32, index: usize) -> u32 {
    let block_offset = index as u32 * block_size;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, block_size)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32, block_size: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (block_size as usize - 1)) / block_size as usize
}
