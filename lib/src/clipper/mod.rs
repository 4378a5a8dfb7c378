//! Clipper polygon boolean operations module.
//!
//! Polygon boolean operations (union, intersection, difference) and offsets
//! using the geo-clipper library, plus exact clipping of open polylines
//! against polygons with holes.
//!
//! Offsets take their distance in millimeters; geometry stays in scaled
//! integer coordinates on both sides of the boundary.

use crate::geometry::{BoundingBox, ExPolygon, ExPolygons, Line, Point, Polygon, Polyline};
use crate::{scale, unscale, CoordF};
use geo::{Coord as GeoCoord, LineString, MultiPolygon, Polygon as GeoPolygon};
use geo_clipper::{Clipper, EndType, JoinType};

/// Clipper integer precision: 1000 units per millimeter.
const CLIPPER_FACTOR: f64 = 1000.0;

/// Safety offset (mm) used to avoid zero-area slivers in intersections.
pub const SAFETY_OFFSET: CoordF = 0.0001;

/// Join type for offset corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetJoinType {
    /// Square corners
    Square,
    /// Round corners
    Round,
    /// Mitered corners
    #[default]
    Miter,
}

impl From<OffsetJoinType> for JoinType {
    fn from(jt: OffsetJoinType) -> Self {
        match jt {
            OffsetJoinType::Square => JoinType::Square,
            OffsetJoinType::Round => JoinType::Round(0.25),
            OffsetJoinType::Miter => JoinType::Miter(3.0),
        }
    }
}

fn ring_to_geo(points: &[Point]) -> LineString<f64> {
    let mut ring: Vec<GeoCoord<f64>> = points
        .iter()
        .map(|p| GeoCoord {
            x: unscale(p.x),
            y: unscale(p.y),
        })
        .collect();
    if let (Some(&first), Some(&last)) = (ring.first(), ring.last()) {
        if first != last {
            ring.push(first);
        }
    }
    LineString::new(ring)
}

fn ring_from_geo(ring: &LineString<f64>) -> Polygon {
    let mut points: Vec<Point> = ring
        .coords()
        .map(|c| Point::new(scale(c.x), scale(c.y)))
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Polygon::from_points(points)
}

fn expolygon_to_geo(expoly: &ExPolygon) -> GeoPolygon<f64> {
    GeoPolygon::new(
        ring_to_geo(&expoly.contour.points),
        expoly.holes.iter().map(|h| ring_to_geo(&h.points)).collect(),
    )
}

fn geo_to_expolygon(geo_poly: &GeoPolygon<f64>) -> ExPolygon {
    let mut contour = ring_from_geo(geo_poly.exterior());
    contour.make_counter_clockwise();
    let holes = geo_poly
        .interiors()
        .iter()
        .map(|r| {
            let mut h = ring_from_geo(r);
            h.make_clockwise();
            h
        })
        .collect();
    ExPolygon::with_holes(contour, holes)
}

fn to_multi(expolys: &[ExPolygon]) -> MultiPolygon<f64> {
    MultiPolygon::new(
        expolys
            .iter()
            .filter(|e| e.contour.is_valid())
            .map(expolygon_to_geo)
            .collect(),
    )
}

fn from_multi(multi: &MultiPolygon<f64>) -> ExPolygons {
    multi
        .0
        .iter()
        .map(geo_to_expolygon)
        .filter(|e| e.contour.is_valid())
        .collect()
}

// ============================================================================
// Boolean Operations
// ============================================================================

/// Union of two sets of polygons.
pub fn union(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() && clip.is_empty() {
        return vec![];
    }
    from_multi(&to_multi(subject).union(&to_multi(clip), CLIPPER_FACTOR))
}

/// Merge a single set of potentially overlapping polygons.
pub fn union_ex(polygons: &[ExPolygon]) -> ExPolygons {
    match polygons.len() {
        0 => vec![],
        1 => polygons.to_vec(),
        _ => union(&polygons[..1], &polygons[1..]),
    }
}

/// Intersection of two sets of polygons.
pub fn intersection(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() || clip.is_empty() {
        return vec![];
    }
    from_multi(&to_multi(subject).intersection(&to_multi(clip), CLIPPER_FACTOR))
}

/// Difference of two sets of polygons (subject - clip).
pub fn difference(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() {
        return vec![];
    }
    if clip.is_empty() {
        return subject.to_vec();
    }
    from_multi(&to_multi(subject).difference(&to_multi(clip), CLIPPER_FACTOR))
}

// ============================================================================
// Offset Operations
// ============================================================================

/// Offset multiple ExPolygons by `delta` millimeters.
///
/// Positive delta grows the polygons, negative delta shrinks them.
pub fn offset_expolygons(
    expolygons: &[ExPolygon],
    delta: CoordF,
    join_type: OffsetJoinType,
) -> ExPolygons {
    if expolygons.is_empty() {
        return vec![];
    }
    let result = to_multi(expolygons).offset(
        delta,
        join_type.into(),
        EndType::ClosedPolygon,
        CLIPPER_FACTOR,
    );
    from_multi(&result)
}

/// Offset plain polygons by `delta` millimeters.
pub fn offset_polygons(polygons: &[Polygon], delta: CoordF, join_type: OffsetJoinType) -> ExPolygons {
    let expolys: Vec<ExPolygon> = polygons.iter().cloned().map(ExPolygon::new).collect();
    offset_expolygons(&expolys, delta, join_type)
}

/// Total net area in mm².
pub fn total_area(expolygons: &[ExPolygon]) -> CoordF {
    expolygons.iter().map(|e| e.area()).sum::<CoordF>() / (crate::SCALING_FACTOR * crate::SCALING_FACTOR)
}

/// Closed boundary polylines of every contour and hole.
pub fn expolygons_to_polylines(expolygons: &[ExPolygon]) -> Vec<Polyline> {
    expolygons.iter().flat_map(|e| e.to_polylines()).collect()
}

/// Rotate every expolygon about the origin.
pub fn rotate_expolygons(expolygons: &[ExPolygon], angle: CoordF) -> ExPolygons {
    expolygons.iter().map(|e| e.rotated(angle)).collect()
}

/// Whether `p` lies inside any of the expolygons.
pub fn contains_point(expolygons: &[ExPolygon], p: &Point) -> bool {
    expolygons.iter().any(|e| e.contains_point(p))
}

// ============================================================================
// Polyline clipping
// ============================================================================

/// Parts of the polylines inside the expolygons.
pub fn intersection_pl(polylines: &[Polyline], clip: &[ExPolygon]) -> Vec<Polyline> {
    clip_polylines(polylines, clip, true)
}

/// Parts of the polylines outside the expolygons.
pub fn diff_pl(polylines: &[Polyline], clip: &[ExPolygon]) -> Vec<Polyline> {
    if clip.is_empty() {
        return polylines.iter().filter(|p| p.is_valid()).cloned().collect();
    }
    clip_polylines(polylines, clip, false)
}

/// Whether the whole segment lies inside the expolygons (no boundary crossing in between).
pub fn segment_inside(line: &Line, clip: &[ExPolygon]) -> bool {
    let pieces = intersection_pl(&[Polyline::from_points(vec![line.a, line.b])], clip);
    let inside: CoordF = pieces.iter().map(Polyline::length).sum();
    if line.is_point() {
        return contains_point(clip, &line.a);
    }
    (inside - line.length()).abs() < 2.0
}

/// Whether a single expolygon holds the whole polyline.
pub fn contains_polyline(expolygons: &[ExPolygon], polyline: &Polyline) -> bool {
    if polyline.is_empty() {
        return false;
    }
    expolygons.iter().any(|e| {
        let one = std::slice::from_ref(e);
        if polyline.len() == 1 {
            return e.contains_point(&polyline.first_point());
        }
        polyline.lines().iter().all(|l| segment_inside(l, one))
    })
}

fn clip_polylines(polylines: &[Polyline], clip: &[ExPolygon], keep_inside: bool) -> Vec<Polyline> {
    if clip.is_empty() {
        return vec![];
    }
    let edges: Vec<Line> = clip.iter().flat_map(|e| e.lines()).collect();
    let mut bbox = BoundingBox::new();
    for e in clip {
        bbox.merge(&e.bounding_box());
    }

    let mut result = Vec::new();
    for polyline in polylines {
        let mut current: Option<Polyline> = None;
        for seg in polyline.lines() {
            if seg.is_point() {
                continue;
            }
            let seg_box = BoundingBox::from_points(&[seg.a, seg.b]);
            let mut params = vec![0.0, 1.0];
            if seg_box.overlap(&bbox) {
                for edge in &edges {
                    if let Some(t) = seg.intersection_param(edge) {
                        params.push(t);
                    }
                }
            }
            params.sort_by(|a, b| a.total_cmp(b));
            params.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

            for w in params.windows(2) {
                let (t0, t1) = (w[0], w[1]);
                let mid = seg.point_at((t0 + t1) * 0.5);
                let inside = seg_box.overlap(&bbox) && contains_point(clip, &mid);
                let p0 = seg.point_at(t0);
                let p1 = seg.point_at(t1);
                if inside == keep_inside {
                    match current.as_mut() {
                        Some(pl) if pl.last_point() == p0 => pl.push(p1),
                        _ => {
                            if let Some(done) = current.take() {
                                if done.is_valid() {
                                    result.push(done);
                                }
                            }
                            current = Some(Polyline::from_points(vec![p0, p1]));
                        }
                    }
                } else if let Some(done) = current.take() {
                    if done.is_valid() {
                        result.push(done);
                    }
                }
            }
        }
        if let Some(done) = current.take() {
            if done.is_valid() {
                result.push(done);
            }
        }
    }
    for pl in &mut result {
        pl.points.dedup();
    }
    result.retain(Polyline::is_valid);
    result
}
