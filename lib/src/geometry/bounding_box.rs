//! Axis-aligned bounding boxes.

use super::{Point, Polygon};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in scaled coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
    /// False until the first point is merged in.
    pub defined: bool,
}

impl BoundingBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: &[Point]) -> Self {
        let mut bbox = Self::new();
        for p in points {
            bbox.merge_point(*p);
        }
        bbox
    }

    pub fn merge_point(&mut self, p: Point) {
        if self.defined {
            self.min.x = self.min.x.min(p.x);
            self.min.y = self.min.y.min(p.y);
            self.max.x = self.max.x.max(p.x);
            self.max.y = self.max.y.max(p.y);
        } else {
            self.min = p;
            self.max = p;
            self.defined = true;
        }
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        if other.defined {
            self.merge_point(other.min);
            self.merge_point(other.max);
        }
    }

    pub fn size(&self) -> Point {
        self.max - self.min
    }

    pub fn center(&self) -> Point {
        Point::new((self.min.x + self.max.x) / 2, (self.min.y + self.max.y) / 2)
    }

    /// Area in scaled units squared.
    pub fn area(&self) -> CoordF {
        let s = self.size();
        s.x as CoordF * s.y as CoordF
    }

    pub fn contains(&self, p: &Point) -> bool {
        self.defined
            && p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
    }

    pub fn overlap(&self, other: &BoundingBox) -> bool {
        self.defined
            && other.defined
            && self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    /// Grow on all sides by `delta`.
    pub fn offset(&mut self, delta: Coord) {
        if self.defined {
            self.min = self.min - Point::new(delta, delta);
            self.max = self.max + Point::new(delta, delta);
        }
    }

    /// Counter-clockwise rectangle polygon.
    pub fn polygon(&self) -> Polygon {
        Polygon::rectangle(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_from_points() {
        let bbox = BoundingBox::from_points(&[Point::new(5, -3), Point::new(-2, 8), Point::new(1, 1)]);
        assert_eq!(bbox.min, Point::new(-2, -3));
        assert_eq!(bbox.max, Point::new(5, 8));
        assert!(bbox.contains(&Point::new(0, 0)));
        assert!(!bbox.contains(&Point::new(6, 0)));
    }

    #[test]
    fn test_bbox_empty_merge() {
        let mut a = BoundingBox::new();
        a.merge(&BoundingBox::new());
        assert!(!a.defined);
        a.merge(&BoundingBox::from_points(&[Point::new(1, 1)]));
        assert!(a.defined);
    }

    #[test]
    fn test_bbox_overlap() {
        let a = BoundingBox::from_points(&[Point::new(0, 0), Point::new(10, 10)]);
        let b = BoundingBox::from_points(&[Point::new(5, 5), Point::new(20, 20)]);
        let c = BoundingBox::from_points(&[Point::new(11, 11), Point::new(20, 20)]);
        assert!(a.overlap(&b));
        assert!(!a.overlap(&c));
    }
}
