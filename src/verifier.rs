//! Off-loop SHA-1 verification of completed pieces.
//!
//! Hashing a multi-megabyte piece takes long enough to stall the network
//! loop, so it runs on plain OS threads behind a bounded queue. The manager
//! enqueues `(piece, bytes)` jobs and receives verdicts by piece index on a
//! channel it selects on; no state is shared between the two sides.

use std::{thread, time::Duration};

use crossbeam::channel::{self, TrySendError};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{error::*, PieceIndex, Sha1Hash};

/// A completed piece to be checked.
#[derive(Debug)]
pub(crate) struct VerifyJob {
    pub piece_index: PieceIndex,
    /// The piece's blocks concatenated in offset order.
    pub data: Vec<u8>,
    pub expected_hash: Sha1Hash,
}

/// The outcome of checking one piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Verdict {
    pub piece_index: PieceIndex,
    pub is_valid: bool,
}

pub(crate) struct HashVerifier {
    job_chan: channel::Sender<VerifyJob>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// How long shutdown waits for the workers to drain the queue and exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

impl HashVerifier {
    /// Spawns the worker pool and returns the verifier together with the
    /// channel on which verdicts arrive.
    pub fn new(
        worker_count: usize,
        queue_len: usize,
        chunk_len: usize,
    ) -> (Self, UnboundedReceiver<Verdict>) {
        let (job_chan, job_port) = channel::bounded::<VerifyJob>(queue_len);
        let (verdict_chan, verdict_port) = mpsc::unbounded_channel();

        let workers = (0..worker_count.max(1))
            .map(|worker_index| {
                let job_port = job_port.clone();
                let verdict_chan: UnboundedSender<Verdict> =
                    verdict_chan.clone();
                thread::Builder::new()
                    .name(format!("hash-verify-{}", worker_index))
                    .spawn(move || {
                        // runs until the job channel is closed and drained
                        while let Ok(job) = job_port.recv() {
                            let digest = hash_chunked(&job.data, chunk_len);
                            let verdict = Verdict {
                                piece_index: job.piece_index,
                                is_valid: digest == job.expected_hash,
                            };
                            if verdict_chan.send(verdict).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn hash worker")
            })
            .collect();

        (Self { job_chan, workers }, verdict_port)
    }

    /// Enqueues a piece for verification, waiting off the async executor if
    /// the queue is full.
    pub async fn verify(&self, job: VerifyJob) -> Result<()> {
        match self.job_chan.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                log::debug!(
                    "Hash queue full, backpressuring piece {}",
                    job.piece_index
                );
                let job_chan = self.job_chan.clone();
                tokio::task::spawn_blocking(move || job_chan.send(job))
                    .await
                    .map_err(|_| Error::Shutdown)?
                    .map_err(|_| Error::Shutdown)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Shutdown),
        }
    }

    /// Closes the queue and joins the workers, each with a bounded wait.
    pub fn shutdown(self) {
        let Self { job_chan, workers } = self;
        drop(job_chan);
        for worker in workers {
            let (done_chan, done_port) = std::sync::mpsc::channel();
            let name = worker.thread().name().unwrap_or("hash").to_owned();
            thread::spawn(move || {
                let _ = worker.join();
                let _ = done_chan.send(());
            });
            if done_port.recv_timeout(JOIN_TIMEOUT).is_err() {
                log::warn!("Worker {} did not shut down in time", name);
            }
        }
    }
}

/// Computes the SHA-1 of the data, feeding the hasher cache friendly chunks.
fn hash_chunked(data: &[u8], chunk_len: usize) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for chunk in data.chunks(chunk_len.max(1)) {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}
