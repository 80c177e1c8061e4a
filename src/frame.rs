use crate::detection::Detection;

/// Detections reported for a single video frame.
pub struct Frame {
    pub index: u64,
    pub detections: Vec<Detection>,
}

impl Frame {
    #[inline]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Detections at or above `min_confidence`; the tracker does not filter.
    pub fn confident(&self, min_confidence: f32) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(move |det| det.confidence >= min_confidence)
    }
}
