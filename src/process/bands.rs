//! Reusable fork-join pool for banded image processing.
//!
//! The matcher and the averager split the block grid into horizontal bands
//! and process them on long-lived worker threads. Workers are spawned once
//! per engine start and parked on their job channels; a stage call costs one
//! send per band plus one latch wait, never a thread spawn.
//!
//! Jobs borrow the caller's buffers for the duration of one
//! [`BandPool::run_scoped`] call. The call blocks until every job has
//! signalled completion, which is what makes the borrow sound; see the
//! safety comment inside.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::error;

use crate::params::MAX_BANDS;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job borrowing caller state; only lives until the enclosing
/// [`BandPool::run_scoped`] returns.
pub type ScopedJob<'scope> = Box<dyn FnOnce() + Send + 'scope>;

struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = match self.remaining.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = match self.remaining.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *remaining > 0 {
            remaining = match self.done.wait(remaining) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

struct Worker {
    tx: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

/// Long-lived band worker pool.
pub struct BandPool {
    workers: Vec<Worker>,
    band_count: usize,
}

impl BandPool {
    /// Creates a pool for `band_count` bands (clamped to `1..=40`).
    ///
    /// A single-band pool spawns no threads; jobs run inline on the caller.
    pub fn new(band_count: usize) -> Self {
        let band_count = band_count.clamp(1, MAX_BANDS);
        let workers = if band_count > 1 {
            (0..band_count)
                .map(|i| {
                    let (tx, rx) = channel::<Job>();
                    let handle = std::thread::Builder::new()
                        .name(format!("band-{i}"))
                        .spawn(move || {
                            while let Ok(job) = rx.recv() {
                                job();
                            }
                        })
                        .ok();
                    Worker { tx, handle }
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            workers,
            band_count,
        }
    }

    /// Number of bands this pool fans out to.
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    /// Runs the jobs across the workers and blocks until all are done.
    ///
    /// Jobs may borrow caller state: the borrow cannot outlive this call
    /// because the latch wait below does not return before every job has
    /// finished.
    pub fn run_scoped(&self, jobs: Vec<ScopedJob<'_>>) {
        if self.workers.is_empty() || jobs.len() <= 1 {
            for job in jobs {
                job();
            }
            return;
        }

        let latch = Arc::new(Latch::new(jobs.len()));
        for (i, job) in jobs.into_iter().enumerate() {
            // SAFETY: the job only runs on a pool worker, and this function
            // blocks on the latch until every job has signalled completion.
            // No borrow held by the job can therefore outlive the caller's
            // stack frame, which is exactly what the 'static bound would
            // otherwise guarantee.
            #[allow(unsafe_code)]
            let job: Job = unsafe {
                std::mem::transmute::<ScopedJob<'_>, Job>(job)
            };
            let latch_for_job = Arc::clone(&latch);
            let wrapped: Job = Box::new(move || {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("band job panicked");
                }
                latch_for_job.count_down();
            });
            let worker = &self.workers[i % self.workers.len()];
            if worker.tx.send(wrapped).is_err() {
                // Worker thread is gone; count the job as done so the
                // caller does not hang.
                latch.count_down();
            }
        }
        latch.wait();
    }

    /// Splits `rows` grid rows into per-band `[start, end)` ranges.
    ///
    /// The last band absorbs the remainder so every row is covered exactly
    /// once.
    pub fn split_rows(rows: usize, bands: usize) -> Vec<(usize, usize)> {
        let bands = bands.max(1);
        let per_band = rows / bands;
        let mut ranges = Vec::with_capacity(bands);
        let mut start = 0;
        for i in 0..bands {
            let end = if i + 1 == bands {
                rows
            } else {
                start + per_band
            };
            ranges.push((start, end));
            start = end;
        }
        ranges
    }
}

/// Splits a grid buffer into per-band row chunks following `ranges`.
///
/// The chunks are disjoint, so each band worker gets exclusive access to
/// its rows.
pub(crate) fn split_band_chunks<'a, T>(
    buf: &'a mut [T],
    ranges: &[(usize, usize)],
    cols: usize,
) -> Vec<&'a mut [T]> {
    let mut chunks = Vec::with_capacity(ranges.len());
    let mut rest = buf;
    for &(start, end) in ranges {
        let (head, tail) = rest.split_at_mut((end - start) * cols);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

impl Drop for BandPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Dropping the sender lets the worker's recv loop end.
            let (dead_tx, _) = channel::<Job>();
            let _ = std::mem::replace(&mut worker.tx, dead_tx);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
