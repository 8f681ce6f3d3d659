//! Picks which blocks to request from which peer.
//!
//! The picker runs on every pipeline refill opportunity: when a peer has
//! open pipeline slots, is active, and is not choking us. It owns no piece
//! state itself; it reads availability and drives the piece store's state
//! machine, which is what keeps two peers from being assigned the same
//! missing piece outside endgame.

use std::net::SocketAddr;

use crate::{
    availability::AvailabilityIndex,
    conf::Conf,
    piece_store::{PieceBlock, PieceState, PieceStore},
    Bitfield, BlockInfo, PieceIndex,
};

/// The order in which pieces are picked from the swarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Walk a global cursor over the piece space.
    RoundRobin,
    /// Prefer the piece fewest peers have. The default, and what keeps a
    /// swarm healthy.
    RarestFirst,
    /// Strictly ascending piece order, availability ignored.
    Sequential,
}

pub(crate) struct PiecePicker {
    strategy: Strategy,
    endgame_threshold: f64,
    endgame_duplicates: usize,
    max_in_flight_pieces: usize,
    /// The endgame latch. Monotonic: once set it stays set until the
    /// download completes.
    in_endgame: bool,
    /// The round-robin cursor.
    next_piece_hint: PieceIndex,
}

impl PiecePicker {
    pub fn new(conf: &Conf) -> Self {
        Self {
            strategy: conf.strategy,
            endgame_threshold: conf.endgame_threshold,
            endgame_duplicates: conf.endgame_duplicates,
            max_in_flight_pieces: conf.max_in_flight_pieces,
            in_endgame: false,
            next_piece_hint: 0,
        }
    }

    pub fn in_endgame(&self) -> bool {
        self.in_endgame
    }

    /// Latches endgame mode once the verified fraction reaches the threshold
    /// while at least one piece is still unverified. Never unlatches.
    pub fn update_endgame(&mut self, store: &PieceStore) {
        if self.in_endgame {
            return;
        }
        let piece_count = store.piece_count();
        let verified = store.num_verified();
        if piece_count > 0
            && verified < piece_count
            && verified as f64 / piece_count as f64 >= self.endgame_threshold
        {
            log::info!(
                "Endgame mode latched at {}/{} verified pieces",
                verified,
                piece_count
            );
            self.in_endgame = true;
        }
    }

    /// Fills `blocks` with up to `open_slots` requests for the peer,
    /// marking each one in the store.
    ///
    /// Outside endgame a block is assigned to at most one peer at a time; in
    /// endgame the same block may go to up to `endgame_duplicates` peers.
    pub fn pick_blocks(
        &mut self,
        peer_key: SocketAddr,
        peer_pieces: &Bitfield,
        open_slots: usize,
        store: &mut PieceStore,
        avail: &AvailabilityIndex,
        blocks: &mut Vec<BlockInfo>,
    ) {
        let mut slots = open_slots;
        // the soft cap on complete-but-unverified pieces backpressures the
        // picker by stopping new pieces from being started
        let can_start_new =
            store.num_unverified_complete() < self.max_in_flight_pieces;

        while slots > 0 {
            let piece_index = match self.pick_piece(
                peer_key,
                peer_pieces,
                store,
                avail,
                can_start_new,
            ) {
                Some(index) => index,
                None => break,
            };

            // the Missing -> Requested transition is what keeps other peers
            // off this piece until it has blocks to spare
            store.mark_requested(piece_index);

            let picked: Vec<_> = store
                .piece(piece_index)
                .blocks
                .iter()
                .filter(|block| self.is_pickable_block(block, &peer_key))
                .take(slots)
                .map(|block| BlockInfo {
                    piece_index,
                    offset: block.offset,
                    len: block.len,
                })
                .collect();
            debug_assert!(!picked.is_empty());

            for block in picked {
                store.note_requested(block, peer_key);
                blocks.push(block);
                slots -= 1;
            }
        }
    }

    fn is_pickable_block(
        &self,
        block: &PieceBlock,
        peer_key: &SocketAddr,
    ) -> bool {
        if block.received {
            return false;
        }
        if self.in_endgame {
            // duplicates are fine, but not to the same peer twice and not
            // beyond the duplicate cap
            !block.requested_from.contains(peer_key)
                && block.requested_from.len() < self.endgame_duplicates
        } else {
            block.requested_from.is_empty()
        }
    }

    /// Picks the best piece the peer has that still has a block to give to
    /// it, per the configured strategy.
    fn pick_piece(
        &mut self,
        peer_key: SocketAddr,
        peer_pieces: &Bitfield,
        store: &PieceStore,
        avail: &AvailabilityIndex,
        can_start_new: bool,
    ) -> Option<PieceIndex> {
        let piece_count = store.piece_count();
        let is_candidate = |index: PieceIndex| {
            if !peer_pieces[index] {
                return false;
            }
            let piece = store.piece(index);
            match piece.state {
                PieceState::Missing => {
                    if !can_start_new {
                        return false;
                    }
                }
                PieceState::Requested | PieceState::Downloading => {}
                PieceState::Complete | PieceState::Verified => return false,
            }
            piece.blocks.iter().any(|block| {
                self.is_pickable_block(block, &peer_key)
            })
        };

        match self.strategy {
            Strategy::Sequential => {
                // lowest index wins, frequency ignored
                (0..piece_count).find(|&index| is_candidate(index))
            }
            Strategy::RoundRobin => {
                let start = self.next_piece_hint % piece_count.max(1);
                let found = (start..piece_count)
                    .chain(0..start)
                    .find(|&index| is_candidate(index));
                if let Some(index) = found {
                    self.next_piece_hint = (index + 1) % piece_count;
                }
                found
            }
            Strategy::RarestFirst => {
                let mut best: Option<(i64, PieceIndex)> = None;
                for index in 0..piece_count {
                    if !is_candidate(index) {
                        continue;
                    }
                    // lower frequency scores higher, priority biases the
                    // front of the file in streaming mode; ties break
                    // towards the lower index
                    let score = (1000 - avail.frequency(index) as i64)
                        + store.piece(index).priority as i64;
                    let better = match best {
                        Some((best_score, best_index)) => {
                            score > best_score
                                || (score == best_score && index < best_index)
                        }
                        None => true,
                    };
                    if better {
                        best = Some((score, index));
                    }
                }
                best.map(|(_, index)| index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentInfo;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const BLOCK_SIZE: u32 = 16;
    const PIECE_LEN: u32 = 32;

    fn conf(strategy: Strategy) -> Conf {
        Conf {
            strategy,
            ..Conf::default()
        }
    }

    fn fixtures(
        piece_count: usize,
        streaming: bool,
    ) -> (PieceStore, AvailabilityIndex) {
        let torrent = Arc::new(
            TorrentInfo::new(
                [0; 20],
                PIECE_LEN,
                PIECE_LEN as u64 * piece_count as u64,
                vec![[0; 20]; piece_count],
            )
            .unwrap(),
        );
        (
            PieceStore::new(torrent, BLOCK_SIZE, streaming),
            AvailabilityIndex::new(piece_count),
        )
    }

    fn addr(host: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", host).parse().unwrap()
    }

    fn bitfield(piece_count: usize, pieces: &[PieceIndex]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, piece_count);
        for &piece in pieces {
            bitfield.set(piece, true);
        }
        bitfield
    }

    fn pick(
        picker: &mut PiecePicker,
        peer: SocketAddr,
        pieces: &Bitfield,
        slots: usize,
        store: &mut PieceStore,
        avail: &AvailabilityIndex,
    ) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        picker.pick_blocks(peer, pieces, slots, store, avail, &mut blocks);
        blocks
    }

    #[test]
    fn test_rarest_first_two_peers() {
        // peer A has pieces 0,1,2; peer B has 1,2,3; frequency [1,2,2,1]
        let (mut store, mut avail) = fixtures(4, false);
        let a = addr(1);
        let b = addr(2);
        let a_pieces = bitfield(4, &[0, 1, 2]);
        let b_pieces = bitfield(4, &[1, 2, 3]);
        avail.update_bitfield(a, &a_pieces);
        avail.update_bitfield(b, &b_pieces);

        let mut picker = PiecePicker::new(&conf(Strategy::RarestFirst));
        // both rarest pieces tie at frequency 1; the lower index wins for A
        let picked = pick(&mut picker, a, &a_pieces, 2, &mut store, &avail);
        assert!(picked.iter().all(|block| block.piece_index == 0));
        assert_eq!(store.state(0), PieceState::Requested);

        // B does not have piece 0, so it gets the other rarest piece
        let picked = pick(&mut picker, b, &b_pieces, 2, &mut store, &avail);
        assert!(picked.iter().all(|block| block.piece_index == 3));
    }

    #[test]
    fn test_no_duplicate_assignment_outside_endgame() {
        let (mut store, mut avail) = fixtures(1, false);
        let a = addr(1);
        let b = addr(2);
        let pieces = bitfield(1, &[0]);
        avail.update_bitfield(a, &pieces);
        avail.update_bitfield(b, &pieces);

        let mut picker = PiecePicker::new(&conf(Strategy::RarestFirst));
        let picked_a = pick(&mut picker, a, &pieces, 8, &mut store, &avail);
        assert_eq!(picked_a.len(), 2);
        // every block of the only piece is on the wire towards A; B gets
        // nothing until a request times out or fails
        let picked_b = pick(&mut picker, b, &pieces, 8, &mut store, &avail);
        assert!(picked_b.is_empty());
    }

    #[test]
    fn test_blocks_picked_in_offset_order() {
        let (mut store, mut avail) = fixtures(1, false);
        let a = addr(1);
        let pieces = bitfield(1, &[0]);
        avail.update_bitfield(a, &pieces);

        let mut picker = PiecePicker::new(&conf(Strategy::RarestFirst));
        let picked = pick(&mut picker, a, &pieces, 1, &mut store, &avail);
        assert_eq!(
            picked,
            vec![BlockInfo {
                piece_index: 0,
                offset: 0,
                len: 16
            }]
        );
        let picked = pick(&mut picker, a, &pieces, 1, &mut store, &avail);
        assert_eq!(
            picked,
            vec![BlockInfo {
                piece_index: 0,
                offset: 16,
                len: 16
            }]
        );
    }

    #[test]
    fn test_picking_spills_into_next_piece() {
        let (mut store, mut avail) = fixtures(2, false);
        let a = addr(1);
        let pieces = bitfield(2, &[0, 1]);
        avail.update_bitfield(a, &pieces);

        let mut picker = PiecePicker::new(&conf(Strategy::RarestFirst));
        let picked = pick(&mut picker, a, &pieces, 4, &mut store, &avail);
        assert_eq!(picked.len(), 4);
        assert_eq!(
            picked.iter().filter(|b| b.piece_index == 0).count(),
            2
        );
        assert_eq!(
            picked.iter().filter(|b| b.piece_index == 1).count(),
            2
        );
    }

    #[test]
    fn test_sequential_ignores_rarity() {
        let (mut store, mut avail) = fixtures(3, false);
        let a = addr(1);
        let pieces = bitfield(3, &[0, 1, 2]);
        avail.update_bitfield(a, &pieces);
        // make piece 2 the rarest by adding peers with the others
        for host in 2..5 {
            avail.update_bitfield(addr(host), &bitfield(3, &[0, 1]));
        }

        let mut picker = PiecePicker::new(&conf(Strategy::Sequential));
        let picked = pick(&mut picker, a, &pieces, 2, &mut store, &avail);
        assert!(picked.iter().all(|block| block.piece_index == 0));
    }

    #[test]
    fn test_round_robin_advances_cursor() {
        let (mut store, mut avail) = fixtures(3, false);
        let a = addr(1);
        let pieces = bitfield(3, &[0, 1, 2]);
        avail.update_bitfield(a, &pieces);

        let mut picker = PiecePicker::new(&conf(Strategy::RoundRobin));
        let first = pick(&mut picker, a, &pieces, 2, &mut store, &avail);
        assert!(first.iter().all(|block| block.piece_index == 0));
        let second = pick(&mut picker, a, &pieces, 2, &mut store, &avail);
        assert!(second.iter().all(|block| block.piece_index == 1));
        let third = pick(&mut picker, a, &pieces, 2, &mut store, &avail);
        assert!(third.iter().all(|block| block.piece_index == 2));
    }

    #[test]
    fn test_streaming_mode_prefers_front() {
        let (mut store, mut avail) = fixtures(4, true);
        let a = addr(1);
        let pieces = bitfield(4, &[0, 1, 2, 3]);
        avail.update_bitfield(a, &pieces);
        // piece 3 is rarer, but the streaming gradient overrides rarity
        avail.update_bitfield(addr(2), &bitfield(4, &[0, 1, 2]));

        let mut picker = PiecePicker::new(&conf(Strategy::RarestFirst));
        let picked = pick(&mut picker, a, &pieces, 2, &mut store, &avail);
        assert!(picked.iter().all(|block| block.piece_index == 0));
    }

    #[test]
    fn test_endgame_latch_is_monotonic() {
        let (mut store, avail) = fixtures(4, false);
        let _ = avail;
        let mut conf = conf(Strategy::RarestFirst);
        conf.endgame_threshold = 0.75;
        let mut picker = PiecePicker::new(&conf);

        picker.update_endgame(&store);
        assert!(!picker.in_endgame());

        for piece_index in 0..3 {
            store
                .add_block(
                    BlockInfo {
                        piece_index,
                        offset: 0,
                        len: 16,
                    },
                    vec![0; 16],
                    addr(1),
                )
                .unwrap();
            store
                .add_block(
                    BlockInfo {
                        piece_index,
                        offset: 16,
                        len: 16,
                    },
                    vec![0; 16],
                    addr(1),
                )
                .unwrap();
            store.mark_verified(piece_index);
        }
        picker.update_endgame(&store);
        assert!(picker.in_endgame());

        // failing a piece afterwards must not unlatch it
        picker.update_endgame(&store);
        assert!(picker.in_endgame());
    }

    #[test]
    fn test_endgame_duplicates_capped() {
        let (mut store, mut avail) = fixtures(1, false);
        let pieces = bitfield(1, &[0]);
        for host in 1..6 {
            avail.update_bitfield(addr(host), &pieces);
        }

        let mut conf = conf(Strategy::RarestFirst);
        conf.endgame_duplicates = 2;
        // a zero threshold latches endgame immediately
        conf.endgame_threshold = 0.0;
        let mut picker = PiecePicker::new(&conf);
        store.mark_requested(0);
        // the zero threshold latches endgame right away
        picker.update_endgame(&store);
        assert!(picker.in_endgame());

        // first two peers get the same blocks, the third gets nothing
        let first = pick(&mut picker, addr(1), &pieces, 2, &mut store, &avail);
        assert_eq!(first.len(), 2);
        let second = pick(&mut picker, addr(2), &pieces, 2, &mut store, &avail);
        assert_eq!(second.len(), 2);
        assert_eq!(first, second);
        // the same peer never doubles up on a block it already requested
        let again = pick(&mut picker, addr(1), &pieces, 2, &mut store, &avail);
        assert!(again.is_empty());
        let third = pick(&mut picker, addr(3), &pieces, 2, &mut store, &avail);
        assert!(third.is_empty());
    }

    #[test]
    fn test_in_flight_cap_blocks_new_pieces() {
        let (mut store, mut avail) = fixtures(2, false);
        let a = addr(1);
        let pieces = bitfield(2, &[0, 1]);
        avail.update_bitfield(a, &pieces);

        let mut conf = conf(Strategy::RarestFirst);
        conf.max_in_flight_pieces = 1;
        let mut picker = PiecePicker::new(&conf);

        // complete piece 0 without verifying it: the cap is now reached
        store
            .add_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 16,
                },
                vec![0; 16],
                a,
            )
            .unwrap();
        store
            .add_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 16,
                    len: 16,
                },
                vec![0; 16],
                a,
            )
            .unwrap();

        let picked = pick(&mut picker, a, &pieces, 4, &mut store, &avail);
        assert!(picked.is_empty());

        // verification lifts the cap
        store.mark_verified(0);
        let picked = pick(&mut picker, a, &pieces, 4, &mut store, &avail);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|block| block.piece_index == 1));
    }
}
