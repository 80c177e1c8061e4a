//! Per-box view quality and positional stability.
//!
//! The score mixes three cheap image statistics of the region of interest:
//! how much of it is bright after a fixed binary threshold, how much of it is
//! edge pixels, and how many straight segments a probabilistic Hough transform
//! finds. Package faces are flat and rectangular, so crisp, well lit views
//! score high on all three.

use opencv::{
    core::{self, Mat, Vec4i, Vector},
    imgproc,
    prelude::*,
};
use serde_derive::Deserialize;

use crate::bbox::{BBox, Ltrb};
use crate::error::Error;

/// Fixed parameters of the quality measure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityParams {
    pub min_roi_side: i32,
    pub binary_threshold: f64,
    pub canny_low: f64,
    pub canny_high: f64,
    pub hough_threshold: i32,
    pub hough_min_line_length: f64,
    pub hough_max_line_gap: f64,
    /// Line count at which the line score saturates
    pub line_saturation: usize,
    pub fill_weight: f32,
    pub edge_weight: f32,
    pub line_weight: f32,
    /// Raw weighted sums of real crops rarely approach 1, so they are
    /// rescaled before clamping.
    pub boost: f32,
    /// Largest corner displacement, in pixels, still counted as stable
    pub stability_threshold: f32,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            min_roi_side: 10,
            binary_threshold: 127.0,
            canny_low: 50.0,
            canny_high: 150.0,
            hough_threshold: 50,
            hough_min_line_length: 30.0,
            hough_max_line_gap: 10.0,
            line_saturation: 10,
            fill_weight: 0.4,
            edge_weight: 0.3,
            line_weight: 0.3,
            boost: 1.5,
            stability_threshold: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityMetrics {
    pub fill_ratio: f32,
    pub edge_ratio: f32,
    pub line_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Composite view quality in `[0, 1]`
    pub score: f32,
    pub stable_count: u32,
    pub metrics: QualityMetrics,
}

/// Quality breakdown of a whole image, for offline inspection of crops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageAnalysis {
    pub width: i32,
    pub height: i32,
    pub metrics: QualityMetrics,
    pub score: f32,
}

impl ImageAnalysis {
    #[inline]
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

pub struct QualityEvaluator {
    params: QualityParams,
}

impl QualityEvaluator {
    pub fn new(params: QualityParams) -> Self {
        Self { params }
    }

    #[inline]
    pub fn params(&self) -> &QualityParams {
        &self.params
    }

    /// Scores `bbox` in `frame` and advances the stability counter from the
    /// track's previous box and count, if it has any.
    pub fn evaluate(
        &self,
        frame: &Mat,
        bbox: &BBox<Ltrb>,
        prior: Option<(&BBox<Ltrb>, u32)>,
    ) -> Result<Evaluation, Error> {
        let metrics = self.measure(frame, bbox)?;

        Ok(Evaluation {
            score: metrics.map(|m| self.score(&m)).unwrap_or(0.0),
            stable_count: stable_count(prior, bbox, self.params.stability_threshold),
            metrics: metrics.unwrap_or_default(),
        })
    }

    /// Image statistics of the ROI, `None` when the ROI is degenerate.
    pub fn measure(&self, frame: &Mat, bbox: &BBox<Ltrb>) -> Result<Option<QualityMetrics>, Error> {
        let rect = bbox.to_rect(frame.cols(), frame.rows());
        if rect.width < self.params.min_roi_side || rect.height < self.params.min_roi_side {
            return Ok(None);
        }

        let roi = Mat::roi(frame, rect)?.try_clone()?;
        let mut gray = Mat::default();
        if roi.channels() == 1 {
            gray = roi;
        } else {
            imgproc::cvt_color_def(&roi, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        }
        let area = (gray.rows() * gray.cols()) as f32;

        let mut binary = Mat::default();
        imgproc::threshold(
            &gray,
            &mut binary,
            self.params.binary_threshold,
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        let fill_ratio = core::count_non_zero(&binary)? as f32 / area;

        let mut edges = Mat::default();
        imgproc::canny_def(&gray, &mut edges, self.params.canny_low, self.params.canny_high)?;
        let edge_ratio = core::count_non_zero(&edges)? as f32 / area;

        let mut lines = Vector::<Vec4i>::new();
        imgproc::hough_lines_p(
            &edges,
            &mut lines,
            1.0,
            std::f64::consts::PI / 180.0,
            self.params.hough_threshold,
            self.params.hough_min_line_length,
            self.params.hough_max_line_gap,
        )?;

        Ok(Some(QualityMetrics {
            fill_ratio,
            edge_ratio,
            line_count: lines.len(),
        }))
    }

    /// Measures and scores all of `image`, `None` when it is too small.
    pub fn analyze(&self, image: &Mat) -> Result<Option<ImageAnalysis>, Error> {
        let (width, height) = (image.cols(), image.rows());
        let whole = BBox::ltrb(0.0, 0.0, width as f32, height as f32);

        Ok(self.measure(image, &whole)?.map(|metrics| ImageAnalysis {
            width,
            height,
            metrics,
            score: self.score(&metrics),
        }))
    }

    pub fn score(&self, metrics: &QualityMetrics) -> f32 {
        let p = &self.params;
        let line_score = (metrics.line_count as f32 / p.line_saturation as f32).min(1.0);
        let raw = metrics.fill_ratio * p.fill_weight
            + metrics.edge_ratio * p.edge_weight
            + line_score * p.line_weight;

        (raw * p.boost).clamp(0.0, 1.0)
    }
}

/// Consecutive-stable-frame counter after observing `bbox`. Displacement
/// below `threshold` from the previous box extends the run, anything else
/// restarts it at 1.
pub fn stable_count(prior: Option<(&BBox<Ltrb>, u32)>, bbox: &BBox<Ltrb>, threshold: f32) -> u32 {
    match prior {
        Some((prev, count)) if prev.displacement(bbox) < threshold => count + 1,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn canvas(w: i32, h: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(h, w, core::CV_8UC3, core::Scalar::all(value)).unwrap()
    }

    fn draw_box(frame: &mut Mat, rect: core::Rect, value: f64, thickness: i32) {
        imgproc::rectangle(
            frame,
            rect,
            core::Scalar::all(value),
            thickness,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
    }

    #[test]
    fn degenerate_roi_scores_zero() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let frame = canvas(200, 200, 255.0);

        let thin = BBox::ltrb(10.0, 10.0, 19.0, 100.0);
        let eval = evaluator.evaluate(&frame, &thin, None).unwrap();
        assert_eq!(eval.score, 0.0);
        assert_eq!(eval.metrics, QualityMetrics::default());

        let outside = BBox::ltrb(300.0, 300.0, 400.0, 400.0);
        let eval = evaluator.evaluate(&frame, &outside, None).unwrap();
        assert_eq!(eval.score, 0.0);
    }

    #[test]
    fn dark_flat_roi_scores_zero() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let frame = canvas(200, 200, 0.0);

        let eval = evaluator
            .evaluate(&frame, &BBox::ltrb(20.0, 20.0, 180.0, 180.0), None)
            .unwrap();
        assert_relative_eq!(eval.score, 0.0);
    }

    #[test]
    fn bright_flat_roi_scores_fill_only() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let frame = canvas(200, 200, 255.0);

        let eval = evaluator
            .evaluate(&frame, &BBox::ltrb(20.0, 20.0, 180.0, 180.0), None)
            .unwrap();
        assert_relative_eq!(eval.metrics.fill_ratio, 1.0);
        assert_eq!(eval.metrics.line_count, 0);
        assert_relative_eq!(eval.score, 0.6, epsilon = 1e-5);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let mut frame = canvas(320, 240, 0.0);
        for i in 0..8 {
            let rect = core::Rect::new(10 + i * 18, 10 + i * 12, 140, 100);
            draw_box(&mut frame, rect, 255.0, 2);
        }
        draw_box(&mut frame, core::Rect::new(60, 60, 120, 80), 200.0, imgproc::FILLED);

        for bbox in [
            BBox::ltrb(0.0, 0.0, 320.0, 240.0),
            BBox::ltrb(40.0, 40.0, 200.0, 160.0),
            BBox::ltrb(60.0, 60.0, 180.0, 140.0),
            BBox::ltrb(5.0, 5.0, 30.0, 30.0),
        ] {
            let eval = evaluator.evaluate(&frame, &bbox, None).unwrap();
            assert!((0.0..=1.0).contains(&eval.score), "score {}", eval.score);
        }
    }

    #[test]
    fn outlined_box_finds_lines() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let mut frame = canvas(300, 300, 0.0);
        draw_box(&mut frame, core::Rect::new(50, 50, 200, 200), 255.0, imgproc::FILLED);

        let metrics = evaluator
            .measure(&frame, &BBox::ltrb(30.0, 30.0, 270.0, 270.0))
            .unwrap()
            .unwrap();
        assert!(metrics.line_count >= 4, "lines {}", metrics.line_count);
        assert!(metrics.edge_ratio > 0.0);
    }

    #[test]
    fn whole_image_analysis_matches_roi_measure() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let mut image = canvas(240, 120, 0.0);
        draw_box(&mut image, core::Rect::new(40, 20, 160, 80), 255.0, imgproc::FILLED);

        let analysis = evaluator.analyze(&image).unwrap().unwrap();
        assert_eq!((analysis.width, analysis.height), (240, 120));
        assert_relative_eq!(analysis.aspect_ratio(), 2.0);

        let metrics = evaluator
            .measure(&image, &BBox::ltrb(0.0, 0.0, 240.0, 120.0))
            .unwrap()
            .unwrap();
        assert_eq!(analysis.metrics, metrics);
        assert_relative_eq!(analysis.score, evaluator.score(&metrics));
        assert!(analysis.metrics.fill_ratio > 0.4);

        assert!(evaluator.analyze(&canvas(8, 40, 255.0)).unwrap().is_none());
    }

    #[test]
    fn score_saturates_at_one() {
        let evaluator = QualityEvaluator::new(QualityParams::default());
        let metrics = QualityMetrics {
            fill_ratio: 1.0,
            edge_ratio: 1.0,
            line_count: 50,
        };
        assert_eq!(evaluator.score(&metrics), 1.0);
    }

    #[test]
    fn stability_counts_up_while_steady() {
        let mut prev: Option<BBox<Ltrb>> = None;
        let mut count = 0;

        for i in 0..12 {
            let x = 100.0 + i as f32 * 3.0;
            let bbox = BBox::ltrb(x, 100.0, x + 50.0, 150.0);
            let next = stable_count(prev.as_ref().map(|p| (p, count)), &bbox, 25.0);
            assert_eq!(next, count + 1);
            count = next;
            prev = Some(bbox);
        }
        assert_eq!(count, 12);

        let jumped = BBox::ltrb(300.0, 100.0, 350.0, 150.0);
        assert_eq!(stable_count(prev.as_ref().map(|p| (p, count)), &jumped, 25.0), 1);
    }

    #[test]
    fn displacement_at_threshold_resets() {
        let prev = BBox::ltrb(0.0, 0.0, 10.0, 10.0);
        let moved = BBox::ltrb(25.0, 0.0, 10.0, 10.0);

        assert_eq!(stable_count(Some((&prev, 7)), &moved, 25.0), 1);
        assert_eq!(stable_count(None, &moved, 25.0), 1);
    }
}
