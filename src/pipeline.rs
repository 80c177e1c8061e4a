use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};

use crate::annotate::Annotator;
use crate::bbox::{BBox, Ltrb, Ltwh};
use crate::config::PipelineConfig;
use crate::detection::{Detection, TrackId};
use crate::error::Error;
use crate::estimation::EstimationQueue;
use crate::frame::Frame;
use crate::lifecycle::{Lifecycle, TrackState};
use crate::quality::QualityEvaluator;
use crate::report::DimensionReport;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedObject {
    pub id: TrackId,
    pub bbox: BBox<Ltwh>,
    pub state: TrackState,
}

pub struct FrameOutput {
    /// Annotated copy of the input, or the input itself when drawing failed
    pub frame: Mat,
    pub reports: Vec<DimensionReport>,
    pub tracked: Vec<TrackedObject>,
}

/// Frame-loop side of the system: quality, lifecycle and annotation for
/// every frame, with submissions handed to the estimation worker.
pub struct Pipeline {
    config: PipelineConfig,
    evaluator: QualityEvaluator,
    lifecycle: Lifecycle<Mat>,
    annotator: Annotator,
    last_sweep: Option<Instant>,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, queue: Arc<EstimationQueue<Mat>>) -> Self {
        Self {
            config: config.clone(),
            evaluator: QualityEvaluator::new(config.quality.clone()),
            lifecycle: Lifecycle::new(config, queue),
            annotator: Annotator::new(config.min_stable_frames),
            last_sweep: None,
        }
    }

    #[inline]
    pub fn lifecycle(&self) -> &Lifecycle<Mat> {
        &self.lifecycle
    }

    pub fn process(&mut self, image: Mat, frame: &Frame, now: Instant) -> FrameOutput {
        self.maybe_sweep(now);

        let mut reports = Vec::new();
        let mut tracked = Vec::new();
        let snapshot = self.snapshot_dir(frame.index).map(Path::to_path_buf);

        for det in frame.confident(self.config.min_confidence) {
            match self.process_detection(&image, det, now) {
                Ok((object, report)) => {
                    if let Some(dir) = snapshot.as_deref() {
                        if let Err(err) = save_roi(dir, &image, frame.index, &object) {
                            tracing::warn!(
                                "frame {}: ROI snapshot of track {} failed: {}",
                                frame.index,
                                object.id,
                                err
                            );
                        }
                    }
                    tracked.push(object);
                    reports.extend(report);
                }
                Err(err) => tracing::error!(
                    "frame {}: track {} skipped: {}",
                    frame.index,
                    det.track_id,
                    err
                ),
            }
        }

        let frame = match self.annotate(&image, &tracked) {
            Ok(canvas) => canvas,
            Err(err) => {
                tracing::warn!("frame {} passed through unannotated: {}", frame.index, err);
                image
            }
        };

        FrameOutput {
            frame,
            reports,
            tracked,
        }
    }

    fn process_detection(
        &mut self,
        image: &Mat,
        det: &Detection,
        now: Instant,
    ) -> Result<(TrackedObject, Option<DimensionReport>), Error> {
        let id = det.track_id;
        let bbox = det
            .bbox()
            .expand(self.config.bbox_expansion_factor, image.cols(), image.rows());

        let evaluation = self
            .evaluator
            .evaluate(image, &bbox, self.lifecycle.prior(id))?;

        let update = self
            .lifecycle
            .observe(id, bbox, &evaluation, now, || crop(image, &bbox))?;

        Ok((
            TrackedObject {
                id,
                bbox: bbox.as_ltwh(),
                state: update.state,
            },
            update.report,
        ))
    }

    fn annotate(&self, image: &Mat, tracked: &[TrackedObject]) -> Result<Mat, Error> {
        let mut canvas = image.try_clone()?;
        let tracks = tracked
            .iter()
            .filter_map(|obj| self.lifecycle.get(obj.id).map(|rec| (obj.id, rec)));

        self.annotator.draw(&mut canvas, tracks)?;

        Ok(canvas)
    }

    fn snapshot_dir(&self, index: u64) -> Option<&Path> {
        let dir = self.config.debug_roi_dir.as_deref()?;
        (index % self.config.debug_roi_every == 0).then_some(dir)
    }

    fn maybe_sweep(&mut self, now: Instant) {
        match self.last_sweep {
            Some(at) if now.saturating_duration_since(at) < self.config.sweep_interval() => (),
            _ => {
                self.lifecycle.sweep(now);
                self.last_sweep = Some(now);
            }
        }
    }
}

/// Owned pixels of `bbox`, `None` when nothing of it lies inside the image.
fn crop(image: &Mat, bbox: &BBox<Ltrb>) -> Result<Option<Mat>, Error> {
    let rect = bbox.to_rect(image.cols(), image.rows());
    if rect.width <= 0 || rect.height <= 0 {
        return Ok(None);
    }

    Ok(Some(Mat::roi(image, rect)?.try_clone()?))
}

/// Writes the track's ROI to `dir/roi_<id>_<frame>.png`.
fn save_roi(dir: &Path, image: &Mat, index: u64, object: &TrackedObject) -> Result<(), Error> {
    let Some(roi) = crop(image, &object.bbox.as_ltrb())? else {
        return Ok(());
    };

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("roi_{}_{}.png", object.id, index));
    if !imgcodecs::imwrite(&path.to_string_lossy(), &roi, &Vector::new())? {
        return Err(Error::IoError(std::io::Error::other(format!(
            "unable to encode {}",
            path.display()
        ))));
    }
    tracing::debug!("saved ROI snapshot {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationFactors;
    use crate::regressor::Regressor;
    use opencv::{core, imgproc};
    use std::time::Duration;

    /// Predicts the crop's pixel size as its length and width.
    struct CropSize;

    impl Regressor<Mat> for CropSize {
        fn infer(&mut self, batch: &[Mat]) -> Result<Vec<[f32; 3]>, Error> {
            Ok(batch
                .iter()
                .map(|m| [m.cols() as f32, m.rows() as f32, 10.0])
                .collect())
        }
    }

    const UNIT: CalibrationFactors = CalibrationFactors {
        length: 1.0,
        width: 1.0,
        height: 1.0,
    };

    fn image() -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(240, 320, core::CV_8UC3, core::Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut image,
            core::Rect::new(100, 100, 100, 50),
            core::Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        image
    }

    fn det(track_id: TrackId, confidence: f32) -> Detection {
        Detection {
            track_id,
            confidence,
            x1: 100.0,
            y1: 100.0,
            x2: 200.0,
            y2: 150.0,
        }
    }

    fn frame(index: u64, detections: Vec<Detection>) -> Frame {
        Frame { index, detections }
    }

    fn forced() -> PipelineConfig {
        PipelineConfig {
            force_qualify_override: true,
            ..Default::default()
        }
    }

    #[test]
    fn forced_track_is_submitted_then_reported() {
        let queue = Arc::new(EstimationQueue::new());
        let mut pipeline = Pipeline::new(&forced(), queue.clone());
        let now = Instant::now();

        let out = pipeline.process(image(), &frame(0, vec![det(7, 0.9)]), now);
        assert!(out.reports.is_empty());
        assert_eq!(out.tracked.len(), 1);
        assert_eq!(out.tracked[0].state, TrackState::Submitted);
        assert_eq!(out.tracked[0].bbox.as_slice(), &[95.0, 98.0, 110.0, 54.0]);
        assert_eq!(queue.pending(), 1);

        queue.process_batch(&mut CropSize, &UNIT, 4).unwrap();

        let out = pipeline.process(image(), &frame(1, vec![det(7, 0.9)]), now);
        assert_eq!(
            out.reports,
            vec![DimensionReport {
                id: 7,
                length_cm: 110.0,
                width_cm: 54.0,
                height_cm: 10.0,
                length_px: 110,
                width_px: 54,
            }]
        );

        let out = pipeline.process(image(), &frame(2, vec![det(7, 0.9)]), now);
        assert!(out.reports.is_empty());
        assert_eq!(out.tracked[0].state, TrackState::Reported);
    }

    #[test]
    fn low_confidence_detections_are_ignored() {
        let queue = Arc::new(EstimationQueue::new());
        let mut pipeline = Pipeline::new(&forced(), queue.clone());

        let out = pipeline.process(image(), &frame(0, vec![det(1, 0.49)]), Instant::now());

        assert!(out.tracked.is_empty());
        assert!(pipeline.lifecycle().is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn output_frame_is_annotated_copy() {
        let queue = Arc::new(EstimationQueue::new());
        let mut pipeline = Pipeline::new(&PipelineConfig::default(), queue);

        let input = image();
        let out = pipeline.process(input.try_clone().unwrap(), &frame(0, vec![det(1, 0.9)]), Instant::now());

        // single sighting, unstable: red box on the expanded left edge
        let px = out.frame.at_2d::<core::Vec3b>(120, 95).unwrap().0;
        assert_eq!(px, [0, 0, 255]);
        assert_eq!(input.at_2d::<core::Vec3b>(120, 95).unwrap().0, [0, 0, 0]);
    }

    #[test]
    fn idle_tracks_are_swept() {
        let queue = Arc::new(EstimationQueue::new());
        let mut pipeline = Pipeline::new(&PipelineConfig::default(), queue);
        let now = Instant::now();

        pipeline.process(image(), &frame(0, vec![det(1, 0.9)]), now);
        assert_eq!(pipeline.lifecycle().len(), 1);

        pipeline.process(image(), &frame(1, vec![]), now + Duration::from_secs(30));
        assert_eq!(pipeline.lifecycle().len(), 1);

        pipeline.process(image(), &frame(2, vec![]), now + Duration::from_secs(61));
        assert!(pipeline.lifecycle().is_empty());
    }

    #[test]
    fn roi_snapshots_follow_configured_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            debug_roi_dir: Some(dir.path().join("rois")),
            debug_roi_every: 30,
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(&config, Arc::new(EstimationQueue::new()));
        let now = Instant::now();

        for index in [0, 1, 29, 30] {
            pipeline.process(image(), &frame(index, vec![det(7, 0.9)]), now);
        }

        let mut saved: Vec<_> = std::fs::read_dir(dir.path().join("rois"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        saved.sort();
        assert_eq!(saved, vec!["roi_7_0.png", "roi_7_30.png"]);

        let roi = imgcodecs::imread(
            &dir.path().join("rois/roi_7_0.png").to_string_lossy(),
            imgcodecs::IMREAD_COLOR,
        )
        .unwrap();
        assert_eq!((roi.cols(), roi.rows()), (110, 54));
    }
}
