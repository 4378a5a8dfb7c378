//! Line segment type.

use super::{Point, PointF};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// A line segment defined by two endpoints.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Line {
    pub a: Point,
    pub b: Point,
}

/// A list of line segments.
pub type Lines = Vec<Line>;

impl Line {
    /// Create a new line segment from two points.
    #[inline]
    pub const fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    /// Direction vector (b - a).
    #[inline]
    pub fn direction(&self) -> Point {
        self.b - self.a
    }

    /// Direction angle normalized to [0, PI).
    #[inline]
    pub fn direction_angle(&self) -> CoordF {
        let dir = self.direction();
        let mut angle = (dir.y as CoordF).atan2(dir.x as CoordF);
        if angle < 0.0 {
            angle += PI;
        }
        if angle >= PI {
            angle -= PI;
        }
        angle
    }

    /// Signed orientation angle in (-PI, PI].
    #[inline]
    pub fn orientation(&self) -> CoordF {
        let dir = self.direction();
        (dir.y as CoordF).atan2(dir.x as CoordF)
    }

    #[inline]
    pub fn midpoint(&self) -> Point {
        Point::new((self.a.x + self.b.x) / 2, (self.a.y + self.b.y) / 2)
    }

    #[inline]
    pub fn length_squared(&self) -> i128 {
        self.a.distance_squared(&self.b)
    }

    /// Length in scaled units.
    #[inline]
    pub fn length(&self) -> CoordF {
        self.a.distance(&self.b)
    }

    /// Zero-length segment.
    #[inline]
    pub fn is_point(&self) -> bool {
        self.a == self.b
    }

    #[inline]
    pub fn reverse(&self) -> Self {
        Self::new(self.b, self.a)
    }

    /// Point at parameter `t` in [0, 1].
    pub fn point_at(&self, t: CoordF) -> Point {
        super::lerp(self.a, self.b, t)
    }

    /// Point at `distance` (scaled units) from `a` toward `b`.
    pub fn point_at_distance(&self, distance: CoordF) -> Point {
        let len = self.length();
        if len <= 0.0 {
            return self.a;
        }
        self.point_at(distance / len)
    }

    /// Distance from a point to this segment.
    pub fn distance_to_point(&self, p: &Point) -> CoordF {
        p.distance(&p.project_onto_segment(self.a, self.b))
    }

    /// Intersection point of two segments, if they cross.
    pub fn intersection(&self, other: &Line) -> Option<Point> {
        let t = self.intersection_param(other)?;
        Some(self.point_at(t))
    }

    /// Parameter along `self` at which `other` crosses it, if the segments intersect.
    pub fn intersection_param(&self, other: &Line) -> Option<CoordF> {
        let d1 = self.direction();
        let d2 = other.direction();
        let denom = d1.cross(&d2);
        if denom == 0 {
            return None;
        }
        let diff = other.a - self.a;
        let t = diff.cross(&d2) as CoordF / denom as CoordF;
        let u = diff.cross(&d1) as CoordF / denom as CoordF;
        if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
            Some(t)
        } else {
            None
        }
    }

    /// Whether this segment is parallel to `angle` within `tolerance` (radians), ignoring direction.
    pub fn parallel_to(&self, angle: CoordF, tolerance: CoordF) -> bool {
        let diff = (self.direction_angle() - angle.rem_euclid(PI)).abs();
        diff < tolerance || (PI - diff) < tolerance
    }

    /// Orientation of `p` relative to this segment: positive when `p` is on the left.
    #[inline]
    pub fn ccw(&self, p: &Point) -> i128 {
        self.a.ccw(&self.b, p)
    }

    pub fn rotate(&self, angle: CoordF) -> Self {
        Self::new(self.a.rotate(angle), self.b.rotate(angle))
    }

    pub fn translate(&self, v: Point) -> Self {
        Self::new(self.a + v, self.b + v)
    }

    /// Endpoints in millimeters.
    pub fn to_f64(&self) -> (PointF, PointF) {
        (self.a.to_f64(), self.b.to_f64())
    }

    /// Offset this segment by `d` along its left normal.
    pub fn offset_left(&self, d: Coord) -> Self {
        let len = self.length();
        if len <= 0.0 {
            return *self;
        }
        let dir = self.direction();
        let n = Point::new(
            (-(dir.y as CoordF) / len * d as CoordF).round() as Coord,
            ((dir.x as CoordF) / len * d as CoordF).round() as Coord,
        );
        self.translate(n)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line({:?} -> {:?})", self.a, self.b)
    }
}

impl From<(Point, Point)> for Line {
    fn from((a, b): (Point, Point)) -> Self {
        Self::new(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_length() {
        let line = Line::new(Point::new(0, 0), Point::new(3, 4));
        assert!((line.length() - 5.0).abs() < 1e-9);
        assert!(!line.is_point());
    }

    #[test]
    fn test_direction_angle_normalized() {
        let left = Line::new(Point::new(10, 0), Point::new(0, 0));
        assert!(left.direction_angle().abs() < 1e-12);
        let down = Line::new(Point::new(0, 10), Point::new(0, 0));
        assert!((down.direction_angle() - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_intersection() {
        let a = Line::new(Point::new(0, 0), Point::new(10, 10));
        let b = Line::new(Point::new(0, 10), Point::new(10, 0));
        assert_eq!(a.intersection(&b), Some(Point::new(5, 5)));

        let c = Line::new(Point::new(20, 0), Point::new(30, 0));
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_parallel_to() {
        let line = Line::new(Point::new(0, 0), Point::new(100, 0));
        assert!(line.parallel_to(0.0, 0.01));
        assert!(line.parallel_to(PI, 0.01));
        assert!(!line.parallel_to(PI / 2.0, 0.01));
    }

    #[test]
    fn test_point_at_distance() {
        let line = Line::new(Point::new(0, 0), Point::new(100, 0));
        assert_eq!(line.point_at_distance(25.0), Point::new(25, 0));
    }
}
