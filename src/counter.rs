//! Throughput accounting for peer links and the whole swarm.

use std::time::Duration;

/// The half-life of the rate average. A 20 second half-life smooths out
/// bursts while still tracking rate changes within a couple of sample rounds.
const HALF_LIFE: Duration = Duration::from_secs(20);

/// Counts bytes moved in one direction and keeps an exponentially weighted
/// moving average of the rate.
///
/// Bytes are recorded as they happen; every stats tick the accumulated round
/// is folded into the average and zeroed, producing a smoothed bytes/second
/// value.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounter {
    /// All-time number of bytes recorded.
    total: u64,
    /// Bytes recorded since the last sample.
    round: u64,
    /// The smoothed rate, in bytes per second.
    rate: f64,
}

impl ThruputCounter {
    pub fn record(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Folds the current round into the rate average over the elapsed
    /// duration and starts a new round.
    pub fn sample(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instant_rate = self.round as f64 / secs;
        // weight follows the half-life: after HALF_LIFE seconds of samples
        // the old rate contributes half
        let decay = 0.5f64.powf(secs / HALF_LIFE.as_secs_f64());
        self.rate = decay * self.rate + (1.0 - decay) * instant_rate;
        self.round = 0;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_total() {
        let mut counter = ThruputCounter::default();
        counter.record(100);
        counter.record(50);
        assert_eq!(counter.total(), 150);
        counter.sample(Duration::from_secs(5));
        counter.record(10);
        assert_eq!(counter.total(), 160);
    }

    #[test]
    fn test_rate_converges_to_steady_throughput() {
        let mut counter = ThruputCounter::default();
        // 1000 bytes every 5 seconds is a steady 200 B/s
        for _ in 0..40 {
            counter.record(1000);
            counter.sample(Duration::from_secs(5));
        }
        assert!((counter.rate() - 200.0).abs() < 1.0);
    }

    #[test]
    fn test_rate_decays_when_idle() {
        let mut counter = ThruputCounter::default();
        counter.record(100_000);
        counter.sample(Duration::from_secs(5));
        let busy = counter.rate();
        // one half-life of silence halves the rate
        counter.sample(Duration::from_secs(20));
        assert!(counter.rate() < busy * 0.55);
        assert!(counter.rate() > busy * 0.45);
    }

    #[test]
    fn test_zero_elapsed_is_ignored() {
        let mut counter = ThruputCounter::default();
        counter.record(100);
        counter.sample(Duration::from_secs(0));
        assert_eq!(counter.rate(), 0.0);
    }
}
