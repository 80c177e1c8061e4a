//! Batched dimension estimation, decoupled from the frame loop.
//!
//! The frame loop pushes crops into a FIFO and later polls a results table;
//! a worker thread wakes on a fixed interval, drains up to a batch of
//! submissions, runs one inference over all of them and writes calibrated
//! results back per track. No lock is held while the network runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};

use crate::calibration::{CalibrationFactors, CalibrationStore};
use crate::detection::TrackId;
use crate::error::Error;
use crate::regressor::Regressor;

/// Identifies one submission; results carry the ticket they answer.
pub type Ticket = u64;

pub struct Submission<I> {
    pub track_id: TrackId,
    pub ticket: Ticket,
    pub image: I,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionEstimate {
    pub ticket: Ticket,
    pub length_cm: f32,
    pub width_cm: f32,
    pub height_cm: f32,
    /// Uncorrected network output
    pub raw: [f32; 3],
    pub estimated_at: Instant,
}

impl DimensionEstimate {
    pub fn new(ticket: Ticket, raw: [f32; 3], factors: &CalibrationFactors, now: Instant) -> Self {
        let [length_cm, width_cm, height_cm] = factors.apply(raw);

        Self {
            ticket,
            length_cm,
            width_cm,
            height_cm,
            raw,
            estimated_at: now,
        }
    }

    #[inline]
    pub fn dimensions(&self) -> [f32; 3] {
        [self.length_cm, self.width_cm, self.height_cm]
    }
}

/// Latest estimate per track, shared between the worker and the frame loop.
#[derive(Default)]
pub struct ResultsTable {
    entries: Mutex<HashMap<TrackId, DimensionEstimate>>,
}

impl ResultsTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, DimensionEstimate>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `estimate`, replacing whatever was kept for the track.
    pub fn insert(&self, track_id: TrackId, estimate: DimensionEstimate) -> Option<DimensionEstimate> {
        self.lock().insert(track_id, estimate)
    }

    pub fn take(&self, track_id: TrackId) -> Option<DimensionEstimate> {
        self.lock().remove(&track_id)
    }

    pub fn contains(&self, track_id: TrackId) -> bool {
        self.lock().contains_key(&track_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops estimates written more than `max_age` before `now`.
    pub fn purge_older_than(&self, max_age: Duration, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, est| now.saturating_duration_since(est.estimated_at) <= max_age);

        before - entries.len()
    }
}

pub struct EstimationQueue<I> {
    tx: Sender<Submission<I>>,
    rx: Receiver<Submission<I>>,
    results: ResultsTable,
    next_ticket: AtomicU64,
    closed: AtomicBool,
}

impl<I> Default for EstimationQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> EstimationQueue<I> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();

        Self {
            tx,
            rx,
            results: ResultsTable::default(),
            next_ticket: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues `image` for `track_id` and returns the ticket its result
    /// will carry.
    pub fn submit(&self, track_id: TrackId, image: I) -> Result<Ticket, Error> {
        if self.is_closed() {
            return Err(Error::WorkerStopped);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        self.tx
            .send(Submission {
                track_id,
                ticket,
                image,
            })
            .map_err(|_| Error::WorkerStopped)?;

        tracing::info!("estimation queued for track {} (ticket {})", track_id, ticket);

        Ok(ticket)
    }

    /// Stops accepting submissions and drops whatever is still queued.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let dropped = self.rx.try_iter().count();
            tracing::info!("estimation queue closed, {} submissions dropped", dropped);
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Removes up to `max` oldest submissions.
    pub fn drain(&self, max: usize) -> Vec<Submission<I>> {
        self.rx.try_iter().take(max).collect()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn take_result(&self, track_id: TrackId) -> Option<DimensionEstimate> {
        self.results.take(track_id)
    }

    #[inline]
    pub fn results(&self) -> &ResultsTable {
        &self.results
    }

    /// Drains one batch, runs it through `regressor` and publishes calibrated
    /// results in batch order. Returns how many results were written. A
    /// failed inference drops the whole batch.
    pub fn process_batch<R: Regressor<I> + ?Sized>(
        &self,
        regressor: &mut R,
        factors: &CalibrationFactors,
        batch_size: usize,
    ) -> Result<usize, Error> {
        let batch = self.drain(batch_size);
        if batch.is_empty() {
            return Ok(0);
        }

        let (keys, images): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|sub| ((sub.track_id, sub.ticket), sub.image))
            .unzip();

        let outputs = regressor.infer(&images)?;
        if outputs.len() != keys.len() {
            return Err(Error::BatchSizeMismatch {
                expected: keys.len(),
                got: outputs.len(),
            });
        }

        let now = Instant::now();
        for ((track_id, ticket), raw) in keys.iter().copied().zip(outputs) {
            let estimate = DimensionEstimate::new(ticket, raw, factors, now);
            tracing::info!(
                "track {} raw {:?} corrected L={:.2} W={:.2} H={:.2}",
                track_id,
                raw,
                estimate.length_cm,
                estimate.width_cm,
                estimate.height_cm
            );
            self.results.insert(track_id, estimate);
        }

        Ok(keys.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub drain_interval: Duration,
    pub result_max_age: Duration,
}

impl From<&crate::config::PipelineConfig> for WorkerConfig {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            drain_interval: config.drain_interval(),
            result_max_age: config.result_max_age(),
        }
    }
}

/// Closes the queue when the worker thread exits, panics included.
struct CloseOnExit<I>(Arc<EstimationQueue<I>>);

impl<I> Drop for CloseOnExit<I> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Background thread draining an [`EstimationQueue`] on a fixed interval.
/// Dropping it stops and joins the thread; the queue refuses submissions
/// from then on.
pub struct Worker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<I, R>(
        queue: Arc<EstimationQueue<I>>,
        mut regressor: R,
        calibration: Arc<CalibrationStore>,
        config: WorkerConfig,
    ) -> Result<Self, Error>
    where
        I: Send + 'static,
        R: Regressor<I> + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = crossbeam_channel::tick(config.drain_interval);

        let handle = thread::Builder::new()
            .name("dimension-worker".to_string())
            .spawn(move || {
                let _close = CloseOnExit(queue.clone());
                tracing::info!(
                    "estimation worker started (batch {}, every {:?})",
                    config.batch_size,
                    config.drain_interval
                );

                loop {
                    select! {
                        recv(ticker) -> tick => {
                            let now = tick.unwrap_or_else(|_| Instant::now());
                            let purged = queue.results().purge_older_than(config.result_max_age, now);
                            if purged > 0 {
                                tracing::debug!("purged {} stale estimates", purged);
                            }

                            let factors = calibration.factors();
                            if let Err(err) = queue.process_batch(&mut regressor, &factors, config.batch_size) {
                                tracing::error!("estimation batch dropped: {}", err);
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }

                tracing::info!("estimation worker stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the worker and waits for the in-flight batch to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("estimation worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
