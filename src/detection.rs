use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltrb};

pub type TrackId = i32;

/// One tracked box as produced by the detector/tracker: absolute pixel
/// corners plus the tracker's persistent id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    #[serde(rename = "id")]
    pub track_id: TrackId,
    #[serde(rename = "p")]
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Detection {
    #[inline(always)]
    pub fn bbox(&self) -> BBox<Ltrb> {
        BBox::ltrb(self.x1, self.y1, self.x2, self.y2)
    }
}
