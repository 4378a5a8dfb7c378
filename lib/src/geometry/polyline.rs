//! Open polyline type.

use super::{BoundingBox, Line, Point, Polygon};
use crate::CoordF;
use serde::{Deserialize, Serialize};

/// An open path through a sequence of points.
///
/// Unlike a Polygon, a Polyline is not implicitly closed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polyline {
    pub points: Vec<Point>,
}

/// A list of polylines.
pub type Polylines = Vec<Polyline>;

impl Polyline {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
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

    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// First point, or the origin when empty.
    #[inline]
    pub fn first_point(&self) -> Point {
        self.points.first().copied().unwrap_or_default()
    }

    /// Last point, or the origin when empty.
    #[inline]
    pub fn last_point(&self) -> Point {
        self.points.last().copied().unwrap_or_default()
    }

    /// Consecutive segments.
    pub fn lines(&self) -> Vec<Line> {
        self.points
            .windows(2)
            .map(|w| Line::new(w[0], w[1]))
            .collect()
    }

    /// Total length in scaled units.
    pub fn length(&self) -> CoordF {
        self.points.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }

    /// Has at least one segment.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.points.len() >= 2
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    pub fn reversed(&self) -> Self {
        let mut result = self.clone();
        result.reverse();
        result
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
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

    /// Append the points of `other`, skipping a duplicated joint point.
    pub fn append(&mut self, other: &Polyline) {
        let skip = usize::from(
            !self.points.is_empty() && other.points.first() == self.points.last(),
        );
        self.points.extend_from_slice(&other.points[skip.min(other.points.len())..]);
    }

    /// Remove `distance` (scaled units) from the start of the path.
    ///
    /// A path no longer than `distance` becomes empty.
    pub fn clip_start(&mut self, distance: CoordF) {
        self.reverse();
        self.clip_end(distance);
        self.reverse();
    }

    /// Remove `distance` (scaled units) from the end of the path.
    ///
    /// A path no longer than `distance` becomes empty.
    pub fn clip_end(&mut self, mut distance: CoordF) {
        while distance > 0.0 {
            let Some(last) = self.points.pop() else {
                break;
            };
            let Some(&prev) = self.points.last() else {
                break;
            };
            let seg = prev.distance(&last);
            if seg > distance {
                self.points.push(Line::new(last, prev).point_at_distance(distance));
                return;
            }
            distance -= seg;
        }
    }

    /// Point at `distance` from the start, clamped to the path.
    pub fn point_at_distance(&self, mut distance: CoordF) -> Point {
        for w in self.points.windows(2) {
            let seg = w[0].distance(&w[1]);
            if distance <= seg {
                return Line::new(w[0], w[1]).point_at_distance(distance);
            }
            distance -= seg;
        }
        self.last_point()
    }

    /// Douglas-Peucker simplification with tolerance in scaled units.
    pub fn simplify(&mut self, tolerance: CoordF) {
        if self.points.len() < 3 {
            return;
        }
        let mut keep = vec![false; self.points.len()];
        keep[0] = true;
        let last = self.points.len() - 1;
        keep[last] = true;
        let mut stack = vec![(0usize, last)];
        while let Some((start, end)) = stack.pop() {
            let seg = Line::new(self.points[start], self.points[end]);
            let mut max_dist = 0.0;
            let mut index = start;
            for i in (start + 1)..end {
                let d = seg.distance_to_point(&self.points[i]);
                if d > max_dist {
                    max_dist = d;
                    index = i;
                }
            }
            if max_dist > tolerance {
                keep[index] = true;
                stack.push((start, index));
                stack.push((index, end));
            }
        }
        let mut i = 0;
        self.points.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
        self.points.dedup();
    }

    /// Remove consecutive points closer than `min_distance` (scaled), keeping the endpoints.
    pub fn remove_short_segments(&mut self, min_distance: CoordF) {
        if self.points.len() < 3 {
            return;
        }
        let last = self.last_point();
        let mut out: Vec<Point> = Vec::with_capacity(self.points.len());
        for &p in &self.points[..self.points.len() - 1] {
            match out.last() {
                Some(prev) if prev.distance(&p) < min_distance => {}
                _ => out.push(p),
            }
        }
        if out.len() > 1 {
            if let Some(&prev) = out.last() {
                if prev.distance(&last) < min_distance {
                    out.pop();
                }
            }
        }
        out.push(last);
        self.points = out;
    }

    /// Convert to a polygon (closing the path).
    pub fn to_polygon(&self) -> Polygon {
        let mut points = self.points.clone();
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        Polygon::from_points(points)
    }
}

impl From<Vec<Point>> for Polyline {
    fn from(points: Vec<Point>) -> Self {
        Self { points }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_path() -> Polyline {
        Polyline::from_points(vec![
            Point::new(0, 0),
            Point::new(100, 0),
            Point::new(100, 100),
            Point::new(0, 100),
        ])
    }

    #[test]
    fn test_polyline_length() {
        assert!((square_path().length() - 300.0).abs() < 1e-9);
        assert_eq!(square_path().lines().len(), 3);
    }

    #[test]
    fn test_clip_end_partial() {
        let mut p = square_path();
        p.clip_end(150.0);
        assert_eq!(p.points, vec![Point::new(0, 0), Point::new(100, 0), Point::new(100, 50)]);
        assert!((p.length() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_clip_end_whole_path_empties() {
        let mut p = square_path();
        p.clip_end(400.0);
        assert!(p.is_empty());
    }

    #[test]
    fn test_clip_start() {
        let mut p = square_path();
        p.clip_start(50.0);
        assert_eq!(p.first_point(), Point::new(50, 0));
        assert_eq!(p.last_point(), Point::new(0, 100));
    }

    #[test]
    fn test_simplify_removes_collinear() {
        let mut p = Polyline::from_points(vec![
            Point::new(0, 0),
            Point::new(50, 1),
            Point::new(100, 0),
            Point::new(100, 100),
        ]);
        p.simplify(5.0);
        assert_eq!(
            p.points,
            vec![Point::new(0, 0), Point::new(100, 0), Point::new(100, 100)]
        );
    }

    #[test]
    fn test_append_skips_joint() {
        let mut a = Polyline::from_points(vec![Point::new(0, 0), Point::new(10, 0)]);
        let b = Polyline::from_points(vec![Point::new(10, 0), Point::new(20, 0)]);
        a.append(&b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_point_at_distance() {
        assert_eq!(square_path().point_at_distance(150.0), Point::new(100, 50));
        assert_eq!(square_path().point_at_distance(1e9), Point::new(0, 100));
    }
}
