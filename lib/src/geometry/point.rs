//! Point types.
//!
//! [`Point`] uses scaled integer coordinates (1 unit = 1 nanometer);
//! [`PointF`] is the unscaled millimeter counterpart used at the G-code boundary.

use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// A 2D point with scaled integer coordinates.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

/// A list of points.
pub type Points = Vec<Point>;

impl Point {
    /// Create a new point with the given coordinates.
    #[inline]
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }

    /// Create a new point from floating-point coordinates (in mm), scaling them.
    #[inline]
    pub fn new_scale(x: CoordF, y: CoordF) -> Self {
        Self {
            x: scale(x),
            y: scale(y),
        }
    }

    /// The origin.
    #[inline]
    pub const fn zero() -> Self {
        Self { x: 0, y: 0 }
    }

    /// Convert to floating-point coordinates (in mm).
    #[inline]
    pub fn to_f64(&self) -> PointF {
        PointF {
            x: unscale(self.x),
            y: unscale(self.y),
        }
    }

    /// Squared distance to another point.
    /// Returns i128 to avoid overflow with large coordinates.
    #[inline]
    pub fn distance_squared(&self, other: &Point) -> i128 {
        let dx = (other.x - self.x) as i128;
        let dy = (other.y - self.y) as i128;
        dx * dx + dy * dy
    }

    /// Distance to another point, in scaled units.
    #[inline]
    pub fn distance(&self, other: &Point) -> CoordF {
        (self.distance_squared(other) as CoordF).sqrt()
    }

    /// Vector length in scaled units.
    #[inline]
    pub fn length(&self) -> CoordF {
        ((self.x as CoordF).powi(2) + (self.y as CoordF).powi(2)).sqrt()
    }

    /// Cross product treating both points as vectors.
    #[inline]
    pub fn cross(&self, other: &Point) -> i128 {
        self.x as i128 * other.y as i128 - self.y as i128 * other.x as i128
    }

    /// Dot product treating both points as vectors.
    #[inline]
    pub fn dot(&self, other: &Point) -> i128 {
        self.x as i128 * other.x as i128 + self.y as i128 * other.y as i128
    }

    /// Whether two points are within `tolerance` of each other on both axes.
    #[inline]
    pub fn coincides_with(&self, other: &Point, tolerance: Coord) -> bool {
        (self.x - other.x).abs() <= tolerance && (self.y - other.y).abs() <= tolerance
    }

    /// Rotate about the origin.
    pub fn rotate(&self, angle: CoordF) -> Point {
        let (s, c) = angle.sin_cos();
        let x = self.x as CoordF;
        let y = self.y as CoordF;
        Point::new((c * x - s * y).round() as Coord, (c * y + s * x).round() as Coord)
    }

    /// Rotate about `center`.
    pub fn rotate_around(&self, angle: CoordF, center: Point) -> Point {
        (*self - center).rotate(angle) + center
    }

    /// Orientation of `p2` relative to the directed line `self -> p1`.
    /// Positive for a left turn.
    #[inline]
    pub fn ccw(&self, p1: &Point, p2: &Point) -> i128 {
        (*p1 - *self).cross(&(*p2 - *self))
    }

    /// Counter-clockwise angle in (0, 2π] swept from `p1` to `p2` around this point.
    ///
    /// A straight continuation yields π.
    pub fn ccw_angle(&self, p1: &Point, p2: &Point) -> CoordF {
        let a1 = ((p1.y - self.y) as CoordF).atan2((p1.x - self.x) as CoordF);
        let a2 = ((p2.y - self.y) as CoordF).atan2((p2.x - self.x) as CoordF);
        let angle = a1 - a2;
        if angle <= 0.0 {
            angle + 2.0 * PI
        } else {
            angle
        }
    }

    /// Project this point onto segment `a-b`.
    pub fn project_onto_segment(&self, a: Point, b: Point) -> Point {
        let ab = b - a;
        let len_sq = ab.dot(&ab);
        if len_sq == 0 {
            return a;
        }
        let t = ((*self - a).dot(&ab) as CoordF / len_sq as CoordF).clamp(0.0, 1.0);
        Point::new(
            a.x + (ab.x as CoordF * t).round() as Coord,
            a.y + (ab.y as CoordF * t).round() as Coord,
        )
    }

    /// Index of the nearest point in `points`.
    pub fn nearest_point_index(&self, points: &[Point]) -> Option<usize> {
        points
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| self.distance_squared(p))
            .map(|(i, _)| i)
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", unscale(self.x), unscale(self.y))
    }
}

impl Add for Point {
    type Output = Point;
    #[inline]
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    #[inline]
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Point {
    #[inline]
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Neg for Point {
    type Output = Point;
    #[inline]
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<CoordF> for Point {
    type Output = Point;
    #[inline]
    fn mul(self, rhs: CoordF) -> Point {
        Point::new(
            (self.x as CoordF * rhs).round() as Coord,
            (self.y as CoordF * rhs).round() as Coord,
        )
    }
}

/// A 2D point with floating-point coordinates in millimeters.
#[derive(Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointF {
    pub x: CoordF,
    pub y: CoordF,
}

impl PointF {
    #[inline]
    pub const fn new(x: CoordF, y: CoordF) -> Self {
        Self { x, y }
    }

    /// Convert to scaled integer coordinates.
    #[inline]
    pub fn to_scaled(&self) -> Point {
        Point::new_scale(self.x, self.y)
    }

    #[inline]
    pub fn distance(&self, other: &PointF) -> CoordF {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    #[inline]
    pub fn length(&self) -> CoordF {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Rotate about the origin.
    pub fn rotate(&self, angle: CoordF) -> PointF {
        let (s, c) = angle.sin_cos();
        PointF::new(c * self.x - s * self.y, c * self.y + s * self.x)
    }
}

impl fmt::Debug for PointF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.x, self.y)
    }
}

impl Add for PointF {
    type Output = PointF;
    #[inline]
    fn add(self, rhs: PointF) -> PointF {
        PointF::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for PointF {
    type Output = PointF;
    #[inline]
    fn sub(self, rhs: PointF) -> PointF {
        PointF::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<CoordF> for PointF {
    type Output = PointF;
    #[inline]
    fn mul(self, rhs: CoordF) -> PointF {
        PointF::new(self.x * rhs, self.y * rhs)
    }
}
