//! Tracks which pieces each peer has and how many peers have each piece.
//!
//! The index is the input of rarest-first selection and of the HAVE
//! broadcast suppression. It is owned and mutated only by the swarm manager
//! task, so the accounting invariant `frequency(p) == |{peer : p in
//! peer.pieces}|` holds between any two manager steps.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use crate::{Bitfield, PieceIndex};

/// What we know about one peer's piece availability.
#[derive(Clone, Debug)]
pub(crate) struct PeerAvailability {
    /// The pieces the peer claims to have.
    pub pieces: Bitfield,
    /// When the peer last told us something about its pieces.
    pub last_updated: Instant,
    /// Starts at 1 and drops towards 0 as pieces this peer contributed to
    /// fail verification.
    pub reliability_score: f64,
}

impl PeerAvailability {
    fn new(piece_count: usize) -> Self {
        Self {
            pieces: Bitfield::repeat(false, piece_count),
            last_updated: Instant::now(),
            reliability_score: 1.0,
        }
    }
}

pub(crate) struct AvailabilityIndex {
    piece_count: usize,
    peers: HashMap<SocketAddr, PeerAvailability>,
    /// For each piece, the number of tracked peers that have it.
    frequency: Vec<u32>,
}

impl AvailabilityIndex {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            peers: HashMap::new(),
            frequency: vec![0; piece_count],
        }
    }

    /// Starts tracking a peer with an empty piece set. A no-op if the peer is
    /// already tracked.
    pub fn insert_peer(&mut self, peer_key: SocketAddr) {
        let piece_count = self.piece_count;
        self.peers
            .entry(peer_key)
            .or_insert_with(|| PeerAvailability::new(piece_count));
    }

    /// Replaces the peer's piece set with the given bitfield, adjusting the
    /// frequency histogram by the difference. O(piece count).
    ///
    /// The bitfield must already be validated and truncated to the piece
    /// count by the codec.
    pub fn update_bitfield(
        &mut self,
        peer_key: SocketAddr,
        bitfield: &Bitfield,
    ) {
        debug_assert_eq!(bitfield.len(), self.piece_count);
        let piece_count = self.piece_count;
        let peer = self
            .peers
            .entry(peer_key)
            .or_insert_with(|| PeerAvailability::new(piece_count));

        for index in 0..piece_count {
            let had = peer.pieces[index];
            let has = bitfield[index];
            if has && !had {
                self.frequency[index] += 1;
            } else if !has && had {
                self.frequency[index] -= 1;
            }
        }
        peer.pieces.clear();
        peer.pieces.extend_from_bitslice(bitfield);
        peer.last_updated = Instant::now();
    }

    /// Records a single piece announcement. Idempotent: the frequency only
    /// grows if the piece is newly added. Returns whether it was new.
    pub fn record_have(
        &mut self,
        peer_key: SocketAddr,
        piece_index: PieceIndex,
    ) -> bool {
        debug_assert!(piece_index < self.piece_count);
        let piece_count = self.piece_count;
        let peer = self
            .peers
            .entry(peer_key)
            .or_insert_with(|| PeerAvailability::new(piece_count));
        peer.last_updated = Instant::now();
        if peer.pieces[piece_index] {
            false
        } else {
            peer.pieces.set(piece_index, true);
            self.frequency[piece_index] += 1;
            true
        }
    }

    /// Stops tracking a peer, giving back every piece it contributed to the
    /// frequency histogram.
    pub fn drop_peer(&mut self, peer_key: &SocketAddr) {
        if let Some(peer) = self.peers.remove(peer_key) {
            log::debug!(
                "Dropping peer {} ({} piece(s), last update {:?} ago)",
                peer_key,
                peer.pieces.count_ones(),
                peer.last_updated.elapsed()
            );
            for index in peer.pieces.iter_ones() {
                self.frequency[index] -= 1;
            }
        }
    }

    pub fn frequency(&self, piece_index: PieceIndex) -> u32 {
        self.frequency[piece_index]
    }

    /// Iterates over the keys of peers that have the piece.
    pub fn peers_with(
        &self,
        piece_index: PieceIndex,
    ) -> impl Iterator<Item = &SocketAddr> {
        self.peers
            .iter()
            .filter(move |(_, peer)| peer.pieces[piece_index])
            .map(|(peer_key, _)| peer_key)
    }

    pub fn peer_pieces(&self, peer_key: &SocketAddr) -> Option<&Bitfield> {
        self.peers.get(peer_key).map(|peer| &peer.pieces)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Lowers the peer's reliability score, flooring at zero.
    pub fn penalize(&mut self, peer_key: &SocketAddr, penalty: f64) {
        if let Some(peer) = self.peers.get_mut(peer_key) {
            peer.reliability_score =
                (peer.reliability_score - penalty).max(0.0);
        }
    }

    pub fn reliability(&self, peer_key: &SocketAddr) -> Option<f64> {
        self.peers.get(peer_key).map(|peer| peer.reliability_score)
    }

    /// The mean piece frequency across the torrent, a health indicator of
    /// the swarm.
    pub fn average_frequency(&self) -> f64 {
        if self.frequency.is_empty() {
            return 0.0;
        }
        self.frequency.iter().map(|&freq| freq as u64).sum::<u64>() as f64
            / self.frequency.len() as f64
    }

    /// The frequency of the rarest piece that at least one peer has.
    pub fn rarest_frequency(&self) -> u32 {
        self.frequency
            .iter()
            .copied()
            .filter(|&freq| freq > 0)
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn addr(host: u8) -> SocketAddr {
        format!("127.0.0.{}:6881", host).parse().unwrap()
    }

    fn bitfield(piece_count: usize, pieces: &[PieceIndex]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, piece_count);
        for &piece in pieces {
            bitfield.set(piece, true);
        }
        bitfield
    }

    /// Recomputes the frequency histogram from scratch and compares it to
    /// the incrementally maintained one.
    fn assert_accounting(index: &AvailabilityIndex) {
        for piece in 0..index.piece_count {
            let actual = index
                .peers
                .values()
                .filter(|peer| peer.pieces[piece])
                .count() as u32;
            assert_eq!(
                index.frequency(piece),
                actual,
                "frequency mismatch at piece {}",
                piece
            );
        }
    }

    #[test]
    fn test_bitfield_and_have_update_frequency() {
        let mut index = AvailabilityIndex::new(4);
        index.update_bitfield(addr(1), &bitfield(4, &[0, 1, 2]));
        index.update_bitfield(addr(2), &bitfield(4, &[1, 2, 3]));
        assert_eq!(index.frequency(0), 1);
        assert_eq!(index.frequency(1), 2);
        assert_eq!(index.frequency(2), 2);
        assert_eq!(index.frequency(3), 1);

        // idempotent have
        assert!(index.record_have(addr(1), 3));
        assert!(!index.record_have(addr(1), 3));
        assert_eq!(index.frequency(3), 2);
        assert_accounting(&index);
    }

    #[test]
    fn test_replacing_bitfield_reconciles_frequency() {
        let mut index = AvailabilityIndex::new(4);
        index.update_bitfield(addr(1), &bitfield(4, &[0, 1]));
        index.update_bitfield(addr(1), &bitfield(4, &[1, 2]));
        assert_eq!(index.frequency(0), 0);
        assert_eq!(index.frequency(1), 1);
        assert_eq!(index.frequency(2), 1);
        assert_accounting(&index);
    }

    #[test]
    fn test_drop_peer_gives_back_pieces() {
        let mut index = AvailabilityIndex::new(4);
        index.update_bitfield(addr(1), &bitfield(4, &[0, 1, 2, 3]));
        index.update_bitfield(addr(2), &bitfield(4, &[0]));
        index.drop_peer(&addr(1));
        assert_eq!(index.frequency(0), 1);
        assert_eq!(index.frequency(1), 0);
        assert_eq!(index.peer_count(), 1);
        assert_accounting(&index);

        // dropping an unknown peer is a no-op
        index.drop_peer(&addr(9));
        assert_accounting(&index);
    }

    #[test]
    fn test_peers_with() {
        let mut index = AvailabilityIndex::new(4);
        index.update_bitfield(addr(1), &bitfield(4, &[0, 2]));
        index.update_bitfield(addr(2), &bitfield(4, &[2]));
        let mut with_2: Vec<_> = index.peers_with(2).copied().collect();
        with_2.sort();
        assert_eq!(with_2, vec![addr(1), addr(2)]);
        assert_eq!(index.peers_with(1).count(), 0);
    }

    #[test]
    fn test_penalize_floors_at_zero() {
        let mut index = AvailabilityIndex::new(1);
        index.insert_peer(addr(1));
        for _ in 0..20 {
            index.penalize(&addr(1), 0.1);
        }
        assert_eq!(index.reliability(&addr(1)), Some(0.0));
    }

    // The bulletproof accounting target: any sequence of updates keeps the
    // histogram equal to a from-scratch recount.
    #[test]
    fn test_accounting_invariant_under_random_ops() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let piece_count = 13;
        let mut index = AvailabilityIndex::new(piece_count);

        for _ in 0..2000 {
            let peer = addr(rng.gen_range(0..8));
            match rng.gen_range(0..4) {
                0 => {
                    let pieces: Vec<_> = (0..piece_count)
                        .filter(|_| rng.gen_bool(0.4))
                        .collect();
                    index.update_bitfield(
                        peer,
                        &bitfield(piece_count, &pieces),
                    );
                }
                1 => {
                    index.record_have(peer, rng.gen_range(0..piece_count));
                }
                2 => index.drop_peer(&peer),
                _ => index.insert_peer(peer),
            }
            assert_accounting(&index);
        }
    }
}
