//! Polygon with holes.

use super::{BoundingBox, Line, Point, Polygon, Polyline};
use crate::CoordF;
use serde::{Deserialize, Serialize};

/// A counter-clockwise contour with clockwise holes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExPolygon {
    pub contour: Polygon,
    #[serde(default)]
    pub holes: Vec<Polygon>,
}

/// A list of polygons with holes.
pub type ExPolygons = Vec<ExPolygon>;

impl ExPolygon {
    pub fn new(contour: Polygon) -> Self {
        Self {
            contour,
            holes: Vec::new(),
        }
    }

    pub fn with_holes(contour: Polygon, holes: Vec<Polygon>) -> Self {
        Self { contour, holes }
    }

    /// Axis-aligned rectangle in scaled coordinates.
    pub fn rectangle(min: Point, max: Point) -> Self {
        Self::new(Polygon::rectangle(min, max))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contour.points.is_empty()
    }

    /// Net area: contour minus holes.
    pub fn area(&self) -> CoordF {
        self.contour.area() - self.holes.iter().map(Polygon::area).sum::<CoordF>()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.contour.bounding_box()
    }

    /// Inside the contour and outside every hole. Hole boundaries count as inside.
    pub fn contains_point(&self, p: &Point) -> bool {
        if !self.contour.contains_point(p) {
            return false;
        }
        !self.holes.iter().any(|h| {
            h.contains_point(p)
                && !h.lines().iter().any(|l| l.distance_to_point(p) < 1.0)
        })
    }

    /// Contour followed by holes.
    pub fn polygons(&self) -> impl Iterator<Item = &Polygon> {
        std::iter::once(&self.contour).chain(self.holes.iter())
    }

    /// Every edge of the contour and holes.
    pub fn lines(&self) -> Vec<Line> {
        self.polygons().flat_map(|p| p.lines()).collect()
    }

    /// Closed boundary polylines (contour first).
    pub fn to_polylines(&self) -> Vec<Polyline> {
        self.polygons().map(Polygon::to_closed_polyline).collect()
    }

    pub fn translate(&mut self, v: Point) {
        self.contour.translate(v);
        for h in &mut self.holes {
            h.translate(v);
        }
    }

    pub fn rotate(&mut self, angle: CoordF) {
        self.contour.rotate(angle);
        for h in &mut self.holes {
            h.rotate(angle);
        }
    }

    pub fn rotated(&self, angle: CoordF) -> Self {
        let mut result = self.clone();
        result.rotate(angle);
        result
    }
}

/// Bounding box of many expolygons.
pub fn get_extents(expolygons: &[ExPolygon]) -> BoundingBox {
    let mut bbox = BoundingBox::new();
    for ex in expolygons {
        bbox.merge(&ex.bounding_box());
    }
    bbox
}
