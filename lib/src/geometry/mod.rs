//! Geometry primitives.
//!
//! - [`Point`] / [`PointF`] - 2D points, scaled integer and unscaled millimeter
//! - [`Line`] - Line segment between two points
//! - [`Polyline`] - Open path
//! - [`Polygon`] - Closed boundary
//! - [`ExPolygon`] - Contour with holes
//! - [`BoundingBox`] - Axis-aligned bounding box
//!
//! ## Coordinate System
//!
//! Coordinates are scaled by `SCALING_FACTOR` (1,000,000), so 1 unit = 1 nanometer.
//! Use `scale()` / `unscale()` to convert between millimeters and internal units.

mod bounding_box;
mod expolygon;
mod line;
mod point;
mod polygon;
mod polyline;

pub use bounding_box::BoundingBox;
pub use expolygon::{get_extents, ExPolygon, ExPolygons};
pub use line::{Line, Lines};
pub use point::{Point, PointF, Points};
pub use polygon::{Polygon, Polygons};
pub use polyline::{Polyline, Polylines};

use crate::{Coord, CoordF};
use std::f64::consts::PI;

/// Cross product of two 2D vectors.
#[inline]
pub fn cross2(v1: Point, v2: Point) -> i128 {
    v1.x as i128 * v2.y as i128 - v1.y as i128 * v2.x as i128
}

/// Dot product of two 2D vectors.
#[inline]
pub fn dot2(v1: Point, v2: Point) -> i128 {
    v1.x as i128 * v2.x as i128 + v1.y as i128 * v2.y as i128
}

/// Perpendicular vector (rotated 90 degrees counter-clockwise).
#[inline]
pub fn perp(v: Point) -> Point {
    Point::new(-v.y, v.x)
}

/// Signed angle from `v1` to `v2` in radians.
pub fn angle_between(v1: PointF, v2: PointF) -> CoordF {
    let dot = v1.x * v2.x + v1.y * v2.y;
    let cross = v1.x * v2.y - v1.y * v2.x;
    cross.atan2(dot)
}

/// Linear interpolation between two points.
#[inline]
pub fn lerp(a: Point, b: Point, t: CoordF) -> Point {
    Point::new(
        (a.x as CoordF + (b.x - a.x) as CoordF * t).round() as Coord,
        (a.y as CoordF + (b.y - a.y) as CoordF * t).round() as Coord,
    )
}

/// Check if a value is approximately equal to another within epsilon.
#[inline]
pub fn approx_eq(a: CoordF, b: CoordF, epsilon: CoordF) -> bool {
    (a - b).abs() < epsilon
}

/// Fold an angle into [0, PI): directions are undirected.
#[inline]
pub fn normalize_direction(angle: CoordF) -> CoordF {
    let a = angle.rem_euclid(PI);
    if a >= PI - 1e-12 {
        0.0
    } else {
        a
    }
}

/// Whether two undirected directions are within `tolerance` of each other.
#[inline]
pub fn directions_parallel(a: CoordF, b: CoordF, tolerance: CoordF) -> bool {
    let d = (normalize_direction(a) - normalize_direction(b)).abs();
    d < tolerance || (PI - d) < tolerance
}

/// Orientation of three points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Counter-clockwise (left turn)
    CounterClockwise,
    /// Clockwise (right turn)
    Clockwise,
    /// Collinear (no turn)
    Collinear,
}

/// Determine the orientation of three points.
pub fn orientation(p1: Point, p2: Point, p3: Point) -> Orientation {
    let cross = cross2(p2 - p1, p3 - p2);
    if cross > 0 {
        Orientation::CounterClockwise
    } else if cross < 0 {
        Orientation::Clockwise
    } else {
        Orientation::Collinear
    }
}
