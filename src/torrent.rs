//! The immutable description of the torrent the swarm is downloading.

use crate::{error::*, PieceIndex, Sha1Hash};

/// Information about a torrent's content, constructed once per torrent by the
/// embedder (from a metainfo file or magnet metadata exchange) and shared with
/// every part of the engine.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    /// The SHA-1 hash of the torrent's info dictionary.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece. A power of two, typically between
    /// 16 KiB and 4 MiB.
    pub piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub total_len: u64,
    /// The expected SHA-1 hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
}

impl TorrentInfo {
    /// Constructs the torrent description, verifying that the piece hash
    /// count matches the download length.
    pub fn new(
        info_hash: Sha1Hash,
        piece_len: u32,
        total_len: u64,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<Self> {
        let expected_count =
            (total_len + piece_len as u64 - 1) / piece_len as u64;
        if piece_len == 0
            || total_len == 0
            || piece_hashes.len() as u64 != expected_count
        {
            return Err(Error::InvalidPieceIndex);
        }
        Ok(Self {
            info_hash,
            piece_len,
            total_len,
            piece_hashes,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub fn last_piece_len(&self) -> u32 {
        (self.total_len
            - self.piece_len as u64 * (self.piece_count() as u64 - 1))
            as u32
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count() - 1 {
            Ok(self.last_piece_len())
        } else if index < self.piece_count() - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent", index);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the expected hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(Error::InvalidPieceIndex)
    }

    /// The number of bytes a peer bitfield for this torrent must be.
    pub(crate) fn bitfield_byte_len(&self) -> usize {
        (self.piece_count() + 7) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(piece_len: u32, total_len: u64) -> TorrentInfo {
        let count = ((total_len + piece_len as u64 - 1) / piece_len as u64)
            as usize;
        TorrentInfo::new(
            [0xab; 20],
            piece_len,
            total_len,
            vec![[0; 20]; count],
        )
        .unwrap()
    }

    #[test]
    fn test_piece_len() {
        // 3 full length pieces, 1 smaller piece
        let info = torrent(4, 3 * 4 + 2);
        assert_eq!(info.piece_count(), 4);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_exact_multiple_last_piece() {
        let info = torrent(4, 16);
        assert_eq!(info.piece_count(), 4);
        assert_eq!(info.last_piece_len(), 4);
    }

    #[test]
    fn test_hash_count_mismatch_rejected() {
        assert!(TorrentInfo::new([0; 20], 4, 16, vec![[0; 20]; 3]).is_err());
    }

    #[test]
    fn test_bitfield_byte_len() {
        assert_eq!(torrent(4, 9 * 4).bitfield_byte_len(), 2);
        assert_eq!(torrent(4, 8 * 4).bitfield_byte_len(), 1);
    }
}
