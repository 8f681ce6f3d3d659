//! Decides which interested peers may download from us.
//!
//! The classic tit-for-tat scheme: every unchoke interval the interested
//! peers are ranked by how fast they upload to us (or, once we are a seed,
//! by how fast we upload to them) and the top few get the regular unchoke
//! slots. One extra, periodically rotated optimistic slot gives new peers a
//! chance to prove themselves.
//!
//! The choker is a pure decision structure: it returns the choke/unchoke
//! deltas and the swarm manager performs the IO.

use std::{
    collections::HashSet,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;

/// One peer's standing in the eyes of the choker.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PeerRank {
    pub peer_key: SocketAddr,
    /// Smoothed rate of piece bytes they send us.
    pub download_rate: f64,
    /// Smoothed rate of piece bytes we send them.
    pub upload_rate: f64,
    pub peer_interested: bool,
}

/// The deltas to apply after a tick. A peer appears in at most one list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Decision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

pub(crate) struct Choker {
    max_upload_slots: usize,
    optimistic_interval: Duration,
    /// The regular slots as of the last tick.
    regular: HashSet<SocketAddr>,
    /// The current optimistic unchoke, never a member of `regular`.
    optimistic: Option<SocketAddr>,
    last_rotation: Option<Instant>,
    ticks_since_rotation: u32,
}

impl Choker {
    pub fn new(max_upload_slots: usize, optimistic_interval: Duration) -> Self {
        Self {
            max_upload_slots,
            optimistic_interval,
            regular: HashSet::new(),
            optimistic: None,
            last_rotation: None,
            ticks_since_rotation: 0,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// The number of slots currently handed out, at most
    /// `max_upload_slots + 1`.
    pub fn unchoked_count(&self) -> usize {
        self.regular.len() + self.optimistic.map_or(0, |_| 1)
    }

    /// Forgets a disconnected peer without emitting a choke for it.
    pub fn drop_peer(&mut self, peer_key: &SocketAddr) {
        self.regular.remove(peer_key);
        if self.optimistic == Some(*peer_key) {
            self.optimistic = None;
        }
    }

    /// Recomputes the slots. Ranks by download rate while leeching and by
    /// upload rate while seeding, since a seed has nothing to reciprocate.
    pub fn tick<R: Rng>(
        &mut self,
        peers: &[PeerRank],
        seeding: bool,
        now: Instant,
        rng: &mut R,
    ) -> Decision {
        let mut interested: Vec<&PeerRank> =
            peers.iter().filter(|peer| peer.peer_interested).collect();
        interested.sort_by(|a, b| {
            let (rate_a, rate_b) = if seeding {
                (a.upload_rate, b.upload_rate)
            } else {
                (a.download_rate, b.download_rate)
            };
            rate_b
                .partial_cmp(&rate_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let new_regular: HashSet<SocketAddr> = interested
            .iter()
            .take(self.max_upload_slots)
            .map(|peer| peer.peer_key)
            .collect();

        let mut decision = Decision::default();
        for peer_key in new_regular.difference(&self.regular) {
            // the optimistic peer is already unchoked; promoting it is a
            // bookkeeping change only
            if self.optimistic != Some(*peer_key) {
                decision.unchoke.push(*peer_key);
            }
        }
        for peer_key in self.regular.difference(&new_regular) {
            decision.choke.push(*peer_key);
        }

        // a promoted optimistic frees the slot for the next rotation
        if let Some(optimistic) = self.optimistic {
            if new_regular.contains(&optimistic) {
                self.optimistic = None;
            }
        }
        self.regular = new_regular;

        self.rotate_optimistic(&interested, now, rng, &mut decision);

        debug_assert!(self.unchoked_count() <= self.max_upload_slots + 1);
        decision
    }

    /// Rotates the optimistic slot on its interval, and at least every third
    /// unchoke tick.
    fn rotate_optimistic<R: Rng>(
        &mut self,
        interested: &[&PeerRank],
        now: Instant,
        rng: &mut R,
        decision: &mut Decision,
    ) {
        let still_interested = |peer_key: &SocketAddr| {
            interested.iter().any(|peer| peer.peer_key == *peer_key)
        };

        let due = match (self.optimistic, self.last_rotation) {
            (None, _) | (_, None) => true,
            (Some(optimistic), Some(last_rotation)) => {
                now.duration_since(last_rotation) >= self.optimistic_interval
                    || self.ticks_since_rotation >= 2
                    || !still_interested(&optimistic)
            }
        };
        if !due {
            self.ticks_since_rotation += 1;
            return;
        }

        let candidates: Vec<SocketAddr> = interested
            .iter()
            .map(|peer| peer.peer_key)
            .filter(|peer_key| {
                !self.regular.contains(peer_key)
                    && self.optimistic != Some(*peer_key)
            })
            .collect();

        let next = if candidates.is_empty() {
            None
        } else {
            Some(candidates[rng.gen_range(0..candidates.len())])
        };

        // the expiring optimistic is choked unless it made the regular set
        if let Some(expired) = self.optimistic.take() {
            if !self.regular.contains(&expired) && next != Some(expired) {
                decision.choke.push(expired);
            }
        }
        if let Some(next) = next {
            // a peer that just lost its regular slot may win the optimistic
            // one, in which case it simply stays unchoked
            if let Some(pos) =
                decision.choke.iter().position(|peer_key| *peer_key == next)
            {
                decision.choke.remove(pos);
            } else {
                decision.unchoke.push(next);
            }
        }
        self.optimistic = next;
        self.last_rotation = Some(now);
        self.ticks_since_rotation = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn addr(host: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", host).parse().unwrap()
    }

    fn rank(host: u8, download_rate: f64) -> PeerRank {
        PeerRank {
            peer_key: addr(host),
            download_rate,
            upload_rate: 0.0,
            peer_interested: true,
        }
    }

    #[test]
    fn test_top_rates_get_regular_slots() {
        let mut choker = Choker::new(4, Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(1);
        let peers: Vec<_> = [100.0, 90.0, 80.0, 70.0, 60.0]
            .iter()
            .enumerate()
            .map(|(host, &kib)| rank(host as u8 + 1, kib * 1024.0))
            .collect();

        let now = Instant::now();
        let first = choker.tick(&peers, false, now, &mut rng);
        // four regular slots plus the optimistic one; with five peers the
        // slowest peer is the only optimistic candidate
        let mut unchoked = first.unchoke.clone();
        unchoked.sort();
        assert_eq!(
            unchoked,
            vec![addr(1), addr(2), addr(3), addr(4), addr(5)]
        );
        assert!(first.choke.is_empty());
        assert_eq!(choker.optimistic(), Some(addr(5)));

        // a steady swarm produces no deltas on the next tick
        let second =
            choker.tick(&peers, false, now + Duration::from_secs(10), &mut rng);
        assert!(second.unchoke.is_empty());
        assert!(second.choke.is_empty());
        assert!(choker.unchoked_count() <= 5);
    }

    #[test]
    fn test_rate_change_rotates_regular_set() {
        let mut choker = Choker::new(2, Duration::from_secs(1000));
        let mut rng = StdRng::seed_from_u64(2);
        let now = Instant::now();

        let peers =
            vec![rank(1, 300.0), rank(2, 200.0), rank(3, 100.0)];
        choker.tick(&peers, false, now, &mut rng);
        assert!(choker.regular.contains(&addr(1)));
        assert!(choker.regular.contains(&addr(2)));

        // peer 3 overtakes peer 2
        let peers =
            vec![rank(1, 300.0), rank(2, 50.0), rank(3, 400.0)];
        let decision =
            choker.tick(&peers, false, now + Duration::from_secs(10), &mut rng);
        assert!(choker.regular.contains(&addr(3)));
        assert!(decision.choke.contains(&addr(2)) || {
            // unless peer 2 won the freed optimistic slot
            choker.optimistic() == Some(addr(2))
        });
    }

    #[test]
    fn test_seeding_ranks_by_upload_rate() {
        let mut choker = Choker::new(1, Duration::from_secs(1000));
        let mut rng = StdRng::seed_from_u64(3);
        let peers = vec![
            PeerRank {
                peer_key: addr(1),
                download_rate: 1000.0,
                upload_rate: 10.0,
                peer_interested: true,
            },
            PeerRank {
                peer_key: addr(2),
                download_rate: 0.0,
                upload_rate: 500.0,
                peer_interested: true,
            },
        ];
        choker.tick(&peers, true, Instant::now(), &mut rng);
        assert!(choker.regular.contains(&addr(2)));
    }

    #[test]
    fn test_only_interested_peers_are_unchoked() {
        let mut choker = Choker::new(4, Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(4);
        let mut peers = vec![rank(1, 100.0), rank(2, 90.0)];
        peers[1].peer_interested = false;

        let decision = choker.tick(&peers, false, Instant::now(), &mut rng);
        assert_eq!(decision.unchoke, vec![addr(1)]);
        assert_eq!(choker.unchoked_count(), 1);
    }

    #[test]
    fn test_cardinality_bound_holds_over_time() {
        let max_slots = 3;
        let mut choker = Choker::new(max_slots, Duration::from_secs(20));
        let mut rng = StdRng::seed_from_u64(5);
        let mut now = Instant::now();

        for round in 0..50u64 {
            // rates drift so the regular set keeps changing
            let peers: Vec<_> = (1..10)
                .map(|host| {
                    rank(host, ((host as u64 * 37 + round * 13) % 100) as f64)
                })
                .collect();
            let decision = choker.tick(&peers, false, now, &mut rng);
            assert!(choker.unchoked_count() <= max_slots + 1);
            // no peer may be both choked and unchoked in one decision
            for peer_key in &decision.unchoke {
                assert!(!decision.choke.contains(peer_key));
            }
            now += Duration::from_secs(10);
        }
    }

    #[test]
    fn test_optimistic_rotates_through_pool() {
        let mut choker = Choker::new(1, Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(6);
        let mut now = Instant::now();
        // peer 1 always owns the regular slot, 2..5 compete for the
        // optimistic one
        let peers: Vec<_> = (1..=5)
            .map(|host| rank(host, if host == 1 { 1000.0 } else { 0.0 }))
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..40 {
            choker.tick(&peers, false, now, &mut rng);
            if let Some(optimistic) = choker.optimistic() {
                assert_ne!(optimistic, addr(1));
                seen.insert(optimistic);
            }
            now += Duration::from_secs(31);
        }
        // over enough rotations every candidate gets its chance
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_expired_optimistic_is_choked() {
        let mut choker = Choker::new(1, Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();
        let peers = vec![rank(1, 100.0), rank(2, 0.0), rank(3, 0.0)];

        choker.tick(&peers, false, now, &mut rng);
        let first_optimistic = choker.optimistic().unwrap();

        // force rotations until the slot changes hands; the loser must be
        // choked in the same decision
        let mut now = now;
        for _ in 0..20 {
            now += Duration::from_secs(31);
            let decision = choker.tick(&peers, false, now, &mut rng);
            if let Some(next) = choker.optimistic() {
                if next != first_optimistic {
                    assert!(decision.choke.contains(&first_optimistic));
                    return;
                }
            }
        }
        panic!("optimistic slot never rotated");
    }
}
