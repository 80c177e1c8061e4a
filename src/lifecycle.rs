//! Per-track state machine from first sighting to a single dimension report.
//!
//! ```text
//! Observed -> Qualified -> Submitted -> Estimated -> Reported
//!    ^            |            |
//!    +------------+------------+  (stops qualifying / rejected result / timeout)
//! ```
//!
//! A track has at most one submission in flight and is reported at most once
//! while its record is remembered. Records not seen for `track_max_age` are
//! dropped by [`Lifecycle::sweep`]; an id seen again after that starts over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bbox::{BBox, Ltrb};
use crate::config::PipelineConfig;
use crate::detection::TrackId;
use crate::error::Error;
use crate::estimation::{DimensionEstimate, EstimationQueue, Ticket};
use crate::quality::Evaluation;
use crate::report::DimensionReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackState {
    Observed,
    Qualified,
    Submitted,
    Estimated,
    Reported,
}

#[derive(Debug, Clone)]
pub struct TrackRecord {
    /// Expanded box of the latest sighting
    pub bbox: BBox<Ltrb>,
    pub stable_count: u32,
    pub quality: f32,
    pub qualifies: bool,
    pub state: TrackState,
    pub submission: Option<(Ticket, Instant)>,
    pub report: Option<DimensionReport>,
    pub last_seen: Instant,
}

impl TrackRecord {
    fn new(bbox: BBox<Ltrb>, now: Instant) -> Self {
        Self {
            bbox,
            stable_count: 0,
            quality: 0.0,
            qualifies: false,
            state: TrackState::Observed,
            submission: None,
            report: None,
            last_seen: now,
        }
    }

    fn transition(&mut self, id: TrackId, state: TrackState) {
        if self.state != state {
            tracing::trace!("track {} {:?} -> {:?}", id, self.state, state);
            self.state = state;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    pub state: TrackState,
    pub qualifies: bool,
    /// Set only on the frame the track becomes reported
    pub report: Option<DimensionReport>,
}

pub struct Lifecycle<I> {
    config: PipelineConfig,
    queue: Arc<EstimationQueue<I>>,
    tracks: HashMap<TrackId, TrackRecord>,
}

impl<I> Lifecycle<I> {
    pub fn new(config: &PipelineConfig, queue: Arc<EstimationQueue<I>>) -> Self {
        Self {
            config: config.clone(),
            queue,
            tracks: HashMap::new(),
        }
    }

    #[inline]
    pub fn get(&self, id: TrackId) -> Option<&TrackRecord> {
        self.tracks.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &TrackRecord)> + '_ {
        self.tracks.iter().map(|(&id, rec)| (id, rec))
    }

    /// Previous box and stable count of a track, as the quality evaluator
    /// expects them.
    pub fn prior(&self, id: TrackId) -> Option<(&BBox<Ltrb>, u32)> {
        self.tracks.get(&id).map(|rec| (&rec.bbox, rec.stable_count))
    }

    pub fn qualifies(&self, evaluation: &Evaluation) -> bool {
        self.config.force_qualify_override
            || (evaluation.stable_count >= self.config.min_stable_frames
                && evaluation.score >= self.config.min_quality_score)
    }

    /// Records one sighting of track `id` with its expanded box and advances
    /// its state. `crop` is only called when the track is about to be
    /// submitted; `Ok(None)` means no usable image this frame.
    pub fn observe<C>(
        &mut self,
        id: TrackId,
        bbox: BBox<Ltrb>,
        evaluation: &Evaluation,
        now: Instant,
        crop: C,
    ) -> Result<TrackUpdate, Error>
    where
        C: FnOnce() -> Result<Option<I>, Error>,
    {
        let qualifies = self.qualifies(evaluation);
        let timeout = self.config.submission_timeout();

        let rec = self
            .tracks
            .entry(id)
            .or_insert_with(|| TrackRecord::new(bbox, now));

        rec.bbox = bbox;
        rec.stable_count = evaluation.stable_count;
        rec.quality = evaluation.score;
        rec.qualifies = qualifies;
        rec.last_seen = now;

        tracing::debug!(
            "track {} stable {} quality {:.2} (fill {:.2} edge {:.2} lines {}) qualifies {}",
            id,
            evaluation.stable_count,
            evaluation.score,
            evaluation.metrics.fill_ratio,
            evaluation.metrics.edge_ratio,
            evaluation.metrics.line_count,
            qualifies
        );

        let mut update = TrackUpdate {
            state: rec.state,
            qualifies,
            report: None,
        };

        match rec.state {
            TrackState::Reported | TrackState::Estimated => return Ok(update),

            TrackState::Submitted => {
                let (ticket, submitted_at) = match rec.submission {
                    Some(submission) => submission,
                    None => {
                        rec.transition(id, TrackState::Observed);
                        update.state = rec.state;
                        return Ok(update);
                    }
                };

                match self.queue.take_result(id) {
                    Some(estimate) if estimate.ticket == ticket => {
                        rec.submission = None;
                        update.report = accept(id, rec, &estimate, &self.config);
                    }
                    Some(stale) => {
                        tracing::debug!(
                            "track {} dropping result of ticket {} (waiting on {})",
                            id,
                            stale.ticket,
                            ticket
                        );
                    }
                    None if now.saturating_duration_since(submitted_at) > timeout => {
                        tracing::warn!(
                            "track {} got no estimate within {:?}, resubmittable",
                            id,
                            timeout
                        );
                        rec.submission = None;
                        rec.transition(id, TrackState::Observed);
                    }
                    None => (),
                }

                update.state = rec.state;
                return Ok(update);
            }

            TrackState::Observed | TrackState::Qualified => (),
        }

        if !qualifies {
            rec.transition(id, TrackState::Observed);
            update.state = rec.state;
            return Ok(update);
        }

        rec.transition(id, TrackState::Qualified);
        if let Some(image) = crop()? {
            let ticket = self.queue.submit(id, image)?;
            rec.submission = Some((ticket, now));
            rec.transition(id, TrackState::Submitted);
        }

        update.state = rec.state;
        Ok(update)
    }

    /// Forgets tracks not seen for `track_max_age`. Returns how many were
    /// removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let max_age = self.config.track_max_age();
        let before = self.tracks.len();

        self.tracks
            .retain(|_, rec| now.saturating_duration_since(rec.last_seen) <= max_age);

        let evicted = before - self.tracks.len();
        if evicted > 0 {
            tracing::debug!("evicted {} idle tracks, {} remain", evicted, self.tracks.len());
        }

        evicted
    }

    #[inline]
    pub fn track_max_age(&self) -> Duration {
        self.config.track_max_age()
    }
}

/// Applies the plausibility gate to a fresh estimate, reporting on success
/// and reverting the track on rejection.
fn accept(
    id: TrackId,
    rec: &mut TrackRecord,
    estimate: &DimensionEstimate,
    config: &PipelineConfig,
) -> Option<DimensionReport> {
    let dims = estimate.dimensions();

    if !dims.iter().all(|&d| config.is_plausible(d)) {
        tracing::warn!(
            "track {} estimate {:?} cm outside ({}, {}), raw {:?}",
            id,
            dims,
            config.min_dimension_cm,
            config.max_dimension_cm,
            estimate.raw
        );
        rec.transition(id, TrackState::Observed);
        return None;
    }

    rec.transition(id, TrackState::Estimated);

    let px = (rec.bbox.width() as i32, rec.bbox.height() as i32);
    let report = DimensionReport::new(id, dims, px);
    rec.report = Some(report);
    rec.transition(id, TrackState::Reported);

    tracing::info!(
        "track {} reported L={} W={} H={} cm",
        id,
        report.length_cm,
        report.width_cm,
        report.height_cm
    );

    Some(report)
}
