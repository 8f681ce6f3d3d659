//! The in-memory store of partially and fully downloaded pieces.
//!
//! Each piece is split into blocks at construction and walks the state
//! machine below. The store is owned by the swarm manager; nothing else
//! mutates piece state.
//!
//! ```text
//! Missing ──select──► Requested ──first block──► Downloading
//!     ▲                                               │ all blocks received
//!     │                                               ▼
//!     │                                           Complete ──hash ok──► Verified
//!     └────────────────hash fail (blocks cleared)─────┘
//! ```
//!
//! `Verified` is terminal in normal operation; only a hash failure or a full
//! recheck moves a piece backwards.

use std::{
    collections::{BTreeSet, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use crate::{
    block_count, block_len, error::*, torrent::TorrentInfo, Bitfield,
    BlockInfo, PieceIndex,
};

/// States of a piece download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceState {
    /// We don't have this piece and nobody is working on it.
    Missing,
    /// The piece has been selected and requests for it are on the wire.
    Requested,
    /// At least one of the piece's blocks has arrived.
    Downloading,
    /// All blocks have arrived but the hash has not been checked yet.
    Complete,
    /// The piece hash matched the metainfo.
    Verified,
}

/// A block within a piece and its download bookkeeping.
#[derive(Clone, Debug)]
pub(crate) struct PieceBlock {
    pub offset: u32,
    pub len: u32,
    pub data: Option<Vec<u8>>,
    pub received: bool,
    /// The peers the block is currently requested from. More than one entry
    /// only occurs in endgame mode.
    pub requested_from: HashSet<SocketAddr>,
    /// The peer whose copy of the block we kept; failed pieces are
    /// attributed to their block sources.
    pub source: Option<SocketAddr>,
}

impl PieceBlock {
    fn new(offset: u32, len: u32) -> Self {
        Self {
            offset,
            len,
            data: None,
            received: false,
            requested_from: HashSet::new(),
            source: None,
        }
    }

    fn clear(&mut self) {
        self.data = None;
        self.received = false;
        self.requested_from.clear();
        self.source = None;
    }
}

/// A piece with its fixed block layout and download state.
#[derive(Clone, Debug)]
pub(crate) struct PieceData {
    pub index: PieceIndex,
    pub len: u32,
    /// The blocks tiling `[0, len)`, ordered by offset. The layout is fixed
    /// at construction; the last block may be short.
    pub blocks: Vec<PieceBlock>,
    pub state: PieceState,
    pub hash_verified: bool,
    /// Higher priority pieces are picked first within equal rarity.
    pub priority: i32,
    /// How many times the piece has been selected for download.
    pub request_count: u32,
    /// How many times the piece has failed hash verification.
    pub fail_count: u32,
}

impl PieceData {
    fn new(index: PieceIndex, len: u32, block_size: u32) -> Self {
        let count = block_count(len, block_size);
        let blocks = (0..count)
            .map(|block_index| {
                PieceBlock::new(
                    block_index as u32 * block_size,
                    block_len(len, block_size, block_index),
                )
            })
            .collect();
        Self {
            index,
            len,
            blocks,
            state: PieceState::Missing,
            hash_verified: false,
            priority: 0,
            request_count: 0,
            fail_count: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|block| block.received)
    }

    /// Concatenates the block data in offset order. `None` if any block is
    /// missing or has been evicted.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len as usize);
        for block in &self.blocks {
            data.extend_from_slice(block.data.as_deref()?);
        }
        Some(data)
    }
}

/// The result of storing a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AddResult {
    /// The block was already present and the incoming copy was dropped.
    Duplicate,
    /// The block was stored but the piece is still missing others.
    StoredPartial,
    /// The block completed its piece; it should now be hash checked.
    StoredComplete,
}

/// Snapshot of how many pieces sit in each state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PieceStateCounts {
    pub missing: usize,
    pub requested: usize,
    pub downloading: usize,
    pub complete: usize,
    pub verified: usize,
}

pub(crate) struct PieceStore {
    torrent: Arc<TorrentInfo>,
    block_size: u32,
    pieces: Vec<PieceData>,
    completed: BTreeSet<PieceIndex>,
    verified: BTreeSet<PieceIndex>,
}

impl PieceStore {
    pub fn new(
        torrent: Arc<TorrentInfo>,
        block_size: u32,
        streaming_mode: bool,
    ) -> Self {
        let piece_count = torrent.piece_count();
        let mut pieces = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            // the index is always in bounds here
            let len = torrent.piece_len(index).expect("piece out of bounds");
            let mut piece = PieceData::new(index, len, block_size);
            if streaming_mode {
                // bias the front of the file for playback, with a modest
                // boost for the last piece as many formats keep their index
                // there
                piece.priority = if index == 0 {
                    1000
                } else if index == piece_count - 1 {
                    100
                } else {
                    (1000 - index as i32).max(0)
                };
            }
            pieces.push(piece);
        }
        Self {
            torrent,
            block_size,
            pieces,
            completed: BTreeSet::new(),
            verified: BTreeSet::new(),
        }
    }

    pub fn piece(&self, index: PieceIndex) -> &PieceData {
        &self.pieces[index]
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Stores a block received from the given peer.
    ///
    /// Fails with `InvalidBlockOffset` if the offset is not a registered
    /// block start and with `InvalidBlockLength` if the data length does not
    /// match the block's registered length.
    pub fn add_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
        from: SocketAddr,
    ) -> Result<AddResult> {
        let piece = self
            .pieces
            .get_mut(block_info.piece_index)
            .ok_or(Error::InvalidPieceIndex)?;

        if block_info.offset % self.block_size != 0 {
            return Err(Error::InvalidBlockOffset);
        }
        debug_assert_eq!(piece.index, block_info.piece_index);
        let block_index = (block_info.offset / self.block_size) as usize;
        let block = piece
            .blocks
            .get_mut(block_index)
            .ok_or(Error::InvalidBlockOffset)?;
        debug_assert_eq!(block.offset, block_info.offset);
        if data.len() != block.len as usize {
            return Err(Error::InvalidBlockLength);
        }

        // the request towards this peer is fulfilled either way
        block.requested_from.remove(&from);
        if block.received {
            return Ok(AddResult::Duplicate);
        }
        block.data = Some(data);
        block.received = true;
        block.source = Some(from);

        // a first block moves a selected (or unselected, in case of an
        // unsolicited but valid block) piece to downloading
        if let PieceState::Missing | PieceState::Requested = piece.state {
            piece.state = PieceState::Downloading;
        }

        if piece.is_complete() {
            piece.state = PieceState::Complete;
            self.completed.insert(block_info.piece_index);
            Ok(AddResult::StoredComplete)
        } else {
            Ok(AddResult::StoredPartial)
        }
    }

    /// Returns the requested bytes if the piece is verified and still held
    /// in memory; the caller falls back to disk otherwise.
    pub fn get_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<Vec<u8>> {
        let piece = self.pieces.get(piece_index)?;
        if piece.state != PieceState::Verified {
            return None;
        }
        let end = offset.checked_add(len)?;
        if end > piece.len {
            return None;
        }

        // the requested range may span block boundaries
        let mut data = Vec::with_capacity(len as usize);
        for block in &piece.blocks {
            let block_end = block.offset + block.len;
            if block_end <= offset || block.offset >= end {
                continue;
            }
            let src = block.data.as_deref()?;
            let from = offset.max(block.offset) - block.offset;
            let to = end.min(block_end) - block.offset;
            data.extend_from_slice(&src[from as usize..to as usize]);
        }
        debug_assert_eq!(data.len(), len as usize);
        Some(data)
    }

    /// The blocks of the piece that have not been received yet, in offset
    /// order.
    pub fn missing_blocks(&self, piece_index: PieceIndex) -> Vec<BlockInfo> {
        self.pieces[piece_index]
            .blocks
            .iter()
            .filter(|block| !block.received)
            .map(|block| BlockInfo {
                piece_index,
                offset: block.offset,
                len: block.len,
            })
            .collect()
    }

    /// Marks a missing piece as selected for download.
    pub fn mark_requested(&mut self, piece_index: PieceIndex) {
        let piece = &mut self.pieces[piece_index];
        if piece.state == PieceState::Missing {
            piece.state = PieceState::Requested;
            piece.request_count += 1;
            log::trace!(
                "Piece {} selected (selection {})",
                piece_index,
                piece.request_count
            );
        }
    }

    /// Records that the block has a request on the wire towards the peer.
    pub fn note_requested(&mut self, block: BlockInfo, peer_key: SocketAddr) {
        let block_index = (block.offset / self.block_size) as usize;
        self.pieces[block.piece_index].blocks[block_index]
            .requested_from
            .insert(peer_key);
    }

    /// Forgets a request that expired or died with its connection, making
    /// the block pickable again.
    pub fn clear_requested(&mut self, block: BlockInfo, peer_key: &SocketAddr) {
        let block_index = (block.offset / self.block_size) as usize;
        self.pieces[block.piece_index].blocks[block_index]
            .requested_from
            .remove(peer_key);
    }

    /// The peers a block is currently requested from, other than the given
    /// one. These receive cancels when the block arrives in endgame.
    pub fn duplicate_holders(
        &self,
        block: BlockInfo,
        except: &SocketAddr,
    ) -> Vec<SocketAddr> {
        let block_index = (block.offset / self.block_size) as usize;
        self.pieces[block.piece_index].blocks[block_index]
            .requested_from
            .iter()
            .filter(|peer_key| *peer_key != except)
            .copied()
            .collect()
    }

    /// The union of peers whose blocks make up the piece as currently held.
    pub fn contributors(&self, piece_index: PieceIndex) -> HashSet<SocketAddr> {
        self.pieces[piece_index]
            .blocks
            .iter()
            .filter_map(|block| block.source)
            .collect()
    }

    /// Promotes a complete piece whose hash matched. Any endgame requests
    /// still recorded on its blocks are forgotten.
    pub fn mark_verified(&mut self, piece_index: PieceIndex) {
        let piece = &mut self.pieces[piece_index];
        debug_assert_eq!(piece.state, PieceState::Complete);
        piece.state = PieceState::Verified;
        piece.hash_verified = true;
        for block in piece.blocks.iter_mut() {
            block.requested_from.clear();
        }
        self.verified.insert(piece_index);
    }

    /// Demotes a complete piece whose hash did not match: all block data is
    /// dropped and the piece becomes missing again.
    ///
    /// Returns the union of peers whose blocks made up the piece, so their
    /// reliability can be reduced.
    pub fn mark_failed(
        &mut self,
        piece_index: PieceIndex,
    ) -> HashSet<SocketAddr> {
        let piece = &mut self.pieces[piece_index];
        let contributors = piece
            .blocks
            .iter()
            .filter_map(|block| block.source)
            .collect();
        piece.state = PieceState::Missing;
        piece.hash_verified = false;
        piece.fail_count += 1;
        for block in piece.blocks.iter_mut() {
            block.clear();
        }
        self.completed.remove(&piece_index);
        self.verified.remove(&piece_index);
        contributors
    }

    /// Drops the block data of a verified piece once it is durably written;
    /// later requests for it are served from disk.
    pub fn evict(&mut self, piece_index: PieceIndex) {
        let piece = &mut self.pieces[piece_index];
        debug_assert_eq!(piece.state, PieceState::Verified);
        for block in piece.blocks.iter_mut() {
            block.data = None;
        }
    }

    /// Moves every verified piece back to complete so it can be hash checked
    /// again, e.g. for a full recheck on resume. Returns the affected
    /// indices.
    pub fn rehash_all(&mut self) -> Vec<PieceIndex> {
        let indices: Vec<_> = self.verified.iter().copied().collect();
        for &index in &indices {
            let piece = &mut self.pieces[index];
            piece.state = PieceState::Complete;
            piece.hash_verified = false;
        }
        self.verified.clear();
        indices
    }

    /// Restores pieces recorded in a trusted checkpoint as verified without
    /// holding their data in memory.
    pub fn restore_verified(&mut self, indices: &BTreeSet<PieceIndex>) {
        for &index in indices {
            if index >= self.pieces.len() {
                continue;
            }
            let piece = &mut self.pieces[index];
            piece.state = PieceState::Verified;
            piece.hash_verified = true;
            for block in piece.blocks.iter_mut() {
                block.received = true;
                block.data = None;
            }
            self.completed.insert(index);
            self.verified.insert(index);
        }
    }

    pub fn state(&self, piece_index: PieceIndex) -> PieceState {
        self.pieces[piece_index].state
    }

    pub fn is_verified(&self, piece_index: PieceIndex) -> bool {
        self.verified.contains(&piece_index)
    }

    pub fn verified(&self) -> &BTreeSet<PieceIndex> {
        &self.verified
    }

    pub fn num_verified(&self) -> usize {
        self.verified.len()
    }

    pub fn all_verified(&self) -> bool {
        self.verified.len() == self.pieces.len()
    }

    /// The number of pieces sitting complete in memory awaiting
    /// verification. Bounded by the in-flight cap via picker backpressure.
    pub fn num_unverified_complete(&self) -> usize {
        debug_assert!(self.verified.len() <= self.completed.len());
        self.completed.len() - self.verified.len()
    }

    /// Our own piece availability, announced to peers after the handshake.
    pub fn own_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.pieces.len());
        for &index in &self.verified {
            bitfield.set(index, true);
        }
        bitfield
    }

    pub fn state_counts(&self) -> PieceStateCounts {
        let mut counts = PieceStateCounts::default();
        for piece in &self.pieces {
            match piece.state {
                PieceState::Missing => counts.missing += 1,
                PieceState::Requested => counts.requested += 1,
                PieceState::Downloading => counts.downloading += 1,
                PieceState::Complete => counts.complete += 1,
                PieceState::Verified => counts.verified += 1,
            }
        }
        counts
    }
}
