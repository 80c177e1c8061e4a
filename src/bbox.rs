use nalgebra as na;
use serde::{Deserialize, Serialize};
use serde_derive::{Deserialize, Serialize};
use std::marker::PhantomData;

pub trait BBoxFormat: std::fmt::Debug {}

/// Left-top-width-height format, contains left top corner and width-height
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Ltwh;
impl BBoxFormat for Ltwh {}

/// Left-top-right-bottom format, contains left top and right bottom corners
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Ltrb;
impl BBoxFormat for Ltrb {}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox<F: BBoxFormat + Serialize + Deserialize<'static> + PartialEq>(
    [f32; 4],
    PhantomData<F>,
);

impl<F: BBoxFormat + Serialize + Deserialize<'static> + PartialEq> From<BBox<F>> for [f32; 4] {
    fn from(bbox: BBox<F>) -> Self {
        bbox.0
    }
}

impl<F: BBoxFormat + Serialize + Deserialize<'static> + PartialEq> BBox<F> {
    #[inline]
    pub fn as_slice(&self) -> &[f32; 4] {
        &self.0
    }

    /// Euclidean distance between the raw coordinate vectors of two boxes.
    #[inline]
    pub fn displacement(&self, other: &Self) -> f32 {
        (na::Vector4::from(self.0) - na::Vector4::from(other.0)).norm()
    }
}

impl BBox<Ltwh> {
    #[inline]
    pub fn ltwh(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    #[inline(always)]
    pub fn left(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn top(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.0[2]
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.0[3]
    }

    #[inline]
    pub fn as_ltrb(&self) -> BBox<Ltrb> {
        self.into()
    }
}

impl BBox<Ltrb> {
    #[inline]
    pub fn ltrb(x1: f32, x2: f32, x3: f32, x4: f32) -> Self {
        BBox([x1, x2, x3, x4], Default::default())
    }

    #[inline]
    pub fn as_ltwh(&self) -> BBox<Ltwh> {
        self.into()
    }

    #[inline(always)]
    pub fn left(&self) -> f32 {
        self.0[0]
    }

    #[inline(always)]
    pub fn top(&self) -> f32 {
        self.0[1]
    }

    #[inline(always)]
    pub fn right(&self) -> f32 {
        self.0[2]
    }

    #[inline(always)]
    pub fn bottom(&self) -> f32 {
        self.0[3]
    }

    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.0[2] - self.0[0]
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.0[3] - self.0[1]
    }

    /// Snaps corners to whole pixels, dropping the fractional part.
    #[inline]
    pub fn truncated(&self) -> Self {
        BBox(self.0.map(f32::trunc), Default::default())
    }

    /// Grows the box by `factor` around its center and clips it to a
    /// `frame_w` x `frame_h` image. Margins are whole pixels on each side.
    pub fn expand(&self, factor: f32, frame_w: i32, frame_h: i32) -> Self {
        let bbox = self.truncated();
        let dx = (bbox.width() * (factor - 1.0) / 2.0).trunc();
        let dy = (bbox.height() * (factor - 1.0) / 2.0).trunc();

        BBox::ltrb(
            (bbox.left() - dx).max(0.0),
            (bbox.top() - dy).max(0.0),
            (bbox.right() + dx).min(frame_w as f32),
            (bbox.bottom() + dy).min(frame_h as f32),
        )
    }

    /// Integer pixel rectangle of the part of the box inside a
    /// `frame_w` x `frame_h` image. Width or height may be zero.
    pub fn to_rect(&self, frame_w: i32, frame_h: i32) -> opencv::core::Rect {
        let x1 = (self.left() as i32).clamp(0, frame_w);
        let y1 = (self.top() as i32).clamp(0, frame_h);
        let x2 = (self.right() as i32).clamp(x1, frame_w);
        let y2 = (self.bottom() as i32).clamp(y1, frame_h);

        opencv::core::Rect::new(x1, y1, x2 - x1, y2 - y1)
    }
}

impl<'a> From<&'a BBox<Ltwh>> for BBox<Ltrb> {
    #[inline]
    fn from(v: &'a BBox<Ltwh>) -> Self {
        Self(
            [v.0[0], v.0[1], v.0[2] + v.0[0], v.0[3] + v.0[1]],
            Default::default(),
        )
    }
}

impl<'a> From<&'a BBox<Ltrb>> for BBox<Ltwh> {
    #[inline]
    fn from(v: &'a BBox<Ltrb>) -> Self {
        Self(
            [v.0[0], v.0[1], v.0[2] - v.0[0], v.0[3] - v.0[1]],
            Default::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn expand_keeps_center_with_whole_pixel_margins() {
        let bbox = BBox::ltrb(100.0, 100.0, 200.0, 150.0);
        let expanded = bbox.expand(1.1, 640, 480);

        assert_eq!(expanded.as_slice(), &[95.0, 98.0, 205.0, 152.0]);
    }

    #[test]
    fn expand_clips_to_frame() {
        let bbox = BBox::ltrb(2.0, 1.0, 638.5, 479.9);
        let expanded = bbox.expand(1.1, 640, 480);

        assert_eq!(expanded.as_slice(), &[0.0, 0.0, 640.0, 480.0]);
    }

    #[test]
    fn displacement_is_euclidean_over_corners() {
        let a = BBox::ltrb(0.0, 0.0, 10.0, 10.0);
        let b = BBox::ltrb(3.0, 4.0, 10.0, 10.0);

        assert_relative_eq!(a.displacement(&b), 5.0);
    }

    #[test]
    fn rect_of_box_outside_frame_is_empty() {
        let bbox = BBox::ltrb(700.0, 10.0, 800.0, 50.0);
        let rect = bbox.to_rect(640, 480);

        assert_eq!(rect.width, 0);
    }

    #[test]
    fn ltwh_roundtrip() {
        let bbox = BBox::ltwh(5.0, 6.0, 20.0, 30.0);
        assert_eq!(bbox.as_ltrb().as_ltwh(), bbox);
    }
}
