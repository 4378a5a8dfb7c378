//! Closed polygon type.

use super::{BoundingBox, Line, Point, Polyline};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// A closed polygon. The closing edge from the last point back to the first is implicit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<Point>,
}

/// A list of polygons.
pub type Polygons = Vec<Polygon>;

impl Polygon {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle, counter-clockwise.
    pub fn rectangle(min: Point, max: Point) -> Self {
        Self::from_points(vec![
            min,
            Point::new(max.x, min.y),
            max,
            Point::new(min.x, max.y),
        ])
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// At least three vertices.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.points.len() >= 3
    }

    #[inline]
    pub fn first_point(&self) -> Point {
        self.points.first().copied().unwrap_or_default()
    }

    /// All edges, including the closing one.
    pub fn lines(&self) -> Vec<Line> {
        let n = self.points.len();
        if n < 2 {
            return Vec::new();
        }
        (0..n)
            .map(|i| Line::new(self.points[i], self.points[(i + 1) % n]))
            .collect()
    }

    /// Signed area in scaled units squared; positive for counter-clockwise.
    pub fn signed_area(&self) -> CoordF {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut sum: i128 = 0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            sum += a.cross(&b);
        }
        sum as CoordF * 0.5
    }

    #[inline]
    pub fn area(&self) -> CoordF {
        self.signed_area().abs()
    }

    #[inline]
    pub fn is_counter_clockwise(&self) -> bool {
        self.signed_area() > 0.0
    }

    pub fn make_counter_clockwise(&mut self) -> bool {
        if !self.is_counter_clockwise() {
            self.points.reverse();
            true
        } else {
            false
        }
    }

    pub fn make_clockwise(&mut self) -> bool {
        if self.is_counter_clockwise() {
            self.points.reverse();
            true
        } else {
            false
        }
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    /// Perimeter length in scaled units.
    pub fn length(&self) -> CoordF {
        self.lines().iter().map(Line::length).sum()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Even-odd point containment; boundary points count as inside.
    pub fn contains_point(&self, p: &Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];
            if Line::new(pj, pi).distance_to_point(p) < 1.0 {
                return true;
            }
            if (pi.y > p.y) != (pj.y > p.y) {
                let x_int = pj.x as CoordF
                    + (p.y - pj.y) as CoordF * (pi.x - pj.x) as CoordF / (pi.y - pj.y) as CoordF;
                if (p.x as CoordF) < x_int {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn translate(&mut self, v: Point) {
        for p in &mut self.points {
            *p += v;
        }
    }

    pub fn rotate(&mut self, angle: CoordF) {
        for p in &mut self.points {
            *p = p.rotate(angle);
        }
    }

    pub fn rotated(&self, angle: CoordF) -> Self {
        let mut result = self.clone();
        result.rotate(angle);
        result
    }

    /// Open the polygon at vertex `index`; the result starts and ends at that vertex.
    pub fn split_at_index(&self, index: usize) -> Polyline {
        let n = self.points.len();
        if n == 0 {
            return Polyline::new();
        }
        let mut points = Vec::with_capacity(n + 1);
        for k in 0..=n {
            points.push(self.points[(index + k) % n]);
        }
        Polyline::from_points(points)
    }

    /// Closed polyline starting at the first vertex.
    pub fn to_closed_polyline(&self) -> Polyline {
        self.split_at_index(0)
    }

    /// Vertex indices where the boundary turns against the winding (reflex vertices).
    pub fn concave_points(&self, min_angle: CoordF) -> Vec<usize> {
        self.turning_points(min_angle, false)
    }

    /// Vertex indices where the boundary turns with the winding (convex corners).
    pub fn convex_points(&self, min_angle: CoordF) -> Vec<usize> {
        self.turning_points(min_angle, true)
    }

    fn turning_points(&self, min_angle: CoordF, convex: bool) -> Vec<usize> {
        let n = self.points.len();
        if n < 3 {
            return Vec::new();
        }
        let ccw = self.is_counter_clockwise();
        (0..n)
            .filter(|&i| {
                let prev = self.points[(i + n - 1) % n];
                let cur = self.points[i];
                let next = self.points[(i + 1) % n];
                let turn = cur.ccw(&next, &prev);
                let d1 = (cur - prev).to_f64();
                let d2 = (next - cur).to_f64();
                let angle = super::angle_between(d1, d2).abs();
                let left = turn > 0;
                let is_convex = if ccw { left } else { !left };
                angle >= min_angle && is_convex == convex && turn != 0
            })
            .collect()
    }

    /// Vertex whose coordinates coincide with `p` within `tolerance`.
    pub fn find_point(&self, p: &Point, tolerance: Coord) -> Option<usize> {
        self.points.iter().position(|q| q.coincides_with(p, tolerance))
    }
}

impl From<Vec<Point>> for Polygon {
    fn from(points: Vec<Point>) -> Self {
        Self { points }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::rectangle(Point::new(0, 0), Point::new(100, 100))
    }

    #[test]
    fn test_signed_area() {
        let sq = square();
        assert!((sq.signed_area() - 10_000.0).abs() < 1e-9);
        assert!(sq.is_counter_clockwise());
        let mut cw = sq.clone();
        cw.reverse();
        assert!(cw.signed_area() < 0.0);
    }

    #[test]
    fn test_contains_point() {
        let sq = square();
        assert!(sq.contains_point(&Point::new(50, 50)));
        assert!(sq.contains_point(&Point::new(0, 50)));
        assert!(!sq.contains_point(&Point::new(150, 50)));
    }

    #[test]
    fn test_split_at_index() {
        let pl = square().split_at_index(2);
        assert_eq!(pl.len(), 5);
        assert_eq!(pl.first_point(), Point::new(100, 100));
        assert_eq!(pl.last_point(), Point::new(100, 100));
        assert!((pl.length() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_concave_points() {
        // L-shape, counter-clockwise; vertex 3 is the reflex corner
        let l = Polygon::from_points(vec![
            Point::new(0, 0),
            Point::new(200, 0),
            Point::new(200, 100),
            Point::new(100, 100),
            Point::new(100, 200),
            Point::new(0, 200),
        ]);
        assert_eq!(l.concave_points(0.1), vec![3]);
        assert_eq!(l.convex_points(0.1).len(), 5);
    }
}
