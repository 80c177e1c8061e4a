use serde_derive::Serialize;

use crate::detection::TrackId;

/// Accepted dimensions of one package, emitted once per track.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct DimensionReport {
    pub id: TrackId,
    pub length_cm: f32,
    pub width_cm: f32,
    pub height_cm: f32,
    pub length_px: i32,
    pub width_px: i32,
}

impl DimensionReport {
    /// Rounds centimeters to two decimals; `px` is the expanded box size.
    pub fn new(id: TrackId, dimensions_cm: [f32; 3], px: (i32, i32)) -> Self {
        let [length_cm, width_cm, height_cm] = dimensions_cm.map(round2);

        Self {
            id,
            length_cm,
            width_cm,
            height_cm,
            length_px: px.0,
            width_px: px.1,
        }
    }
}

#[inline]
fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Messages pushed to clients, tagged by `type`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Dimensions(DimensionReport),
}

impl From<DimensionReport> for OutboundEvent {
    fn from(report: DimensionReport) -> Self {
        OutboundEvent::Dimensions(report)
    }
}
