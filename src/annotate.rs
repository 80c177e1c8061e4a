use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};

use crate::detection::TrackId;
use crate::error::Error;
use crate::lifecycle::{TrackRecord, TrackState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Ready,
    Stable,
    Unstable,
}

impl TrackStatus {
    pub fn of(record: &TrackRecord, min_stable_frames: u32) -> Self {
        if record.qualifies || record.state >= TrackState::Submitted {
            TrackStatus::Ready
        } else if record.stable_count >= min_stable_frames {
            TrackStatus::Stable
        } else {
            TrackStatus::Unstable
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrackStatus::Ready => "READY",
            TrackStatus::Stable => "STABLE",
            TrackStatus::Unstable => "UNSTABLE",
        }
    }

    /// BGR
    pub fn color(&self) -> core::Scalar {
        match self {
            TrackStatus::Ready => core::Scalar::new(0.0, 255.0, 0.0, 255.0),
            TrackStatus::Stable => core::Scalar::new(0.0, 200.0, 255.0, 255.0),
            TrackStatus::Unstable => core::Scalar::new(0.0, 0.0, 255.0, 255.0),
        }
    }
}

/// Draws track overlays onto frames. Never changes track state.
pub struct Annotator {
    min_stable_frames: u32,
}

impl Annotator {
    pub fn new(min_stable_frames: u32) -> Self {
        Self { min_stable_frames }
    }

    pub fn draw_track(&self, frame: &mut Mat, id: TrackId, record: &TrackRecord) -> Result<(), Error> {
        let status = TrackStatus::of(record, self.min_stable_frames);
        let color = status.color();
        let rect = record.bbox.to_rect(frame.cols(), frame.rows());

        imgproc::rectangle(frame, rect, color, 3, imgproc::LINE_8, 0)?;

        imgproc::put_text(
            frame,
            &format!("ID:{} {}", id, status.label()),
            core::Point::new(rect.x, rect.y - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.6,
            color,
            2,
            imgproc::LINE_AA,
            false,
        )?;

        imgproc::put_text(
            frame,
            &format!("Q:{:.2} S:{}", record.quality, record.stable_count),
            core::Point::new(rect.x, rect.y - 35),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;

        if let Some(report) = &record.report {
            imgproc::put_text(
                frame,
                &format!(
                    "{:.1}x{:.1}x{:.1} cm",
                    report.length_cm, report.width_cm, report.height_cm
                ),
                core::Point::new(rect.x, rect.y + rect.height + 20),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }

        Ok(())
    }

    pub fn draw<'a, T>(&self, frame: &mut Mat, tracks: T) -> Result<(), Error>
    where
        T: IntoIterator<Item = (TrackId, &'a TrackRecord)>,
    {
        for (id, record) in tracks {
            self.draw_track(frame, id, record)?;
        }

        Ok(())
    }
}
