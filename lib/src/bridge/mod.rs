//! Bridge direction detection.
//!
//! A bridge is a region of the current layer with nothing printed under it.
//! Its infill should run from one supported side to another, so the detector
//! searches for the direction whose test lines land in anchors at both ends.
//!
//! # Algorithm Overview
//!
//! 1. **Anchors**: grow the bridge by the line spacing, clip the grown contour
//!    against the lower-layer contours (support edges) and intersect the grown
//!    area with the lower-layer area (anchor regions).
//!
//! 2. **Candidates**: a 2° sweep over [0°, 180°), plus the direction of every
//!    bridge edge and of every open support edge. Near-duplicates are merged.
//!
//! 3. **Scoring**: each candidate rasterizes the bridge with test lines and
//!    scores the anchored share of line length, favouring short spans.
//!
//! [`BridgeDetector::coverage`] and [`BridgeDetector::unsupported_edges`] report
//! what a chosen angle actually covers and which edges would still need support.

use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{
    directions_parallel, get_extents, normalize_direction, BoundingBox, ExPolygon, ExPolygons,
    Line, Point, Polygon, Polyline,
};
use crate::print::PrintObject;
use crate::{scale, unscale, Coord, CoordF};
use log::debug;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Candidate sweep step: 2°.
const RESOLUTION: CoordF = PI / 90.0;

/// Two candidate angles closer than this (0.25°) are the same direction.
pub const ANGLE_TOLERANCE: CoordF = PI / 720.0;

/// Safety offset (mm) applied to the lower slices before intersecting.
const ANCHOR_SAFETY_OFFSET: CoordF = 0.0001;

/// Bonus for a candidate that follows an edge of the bridge itself.
const ALONG_PERIMETER_BONUS: CoordF = 0.05;

/// Regions smaller than this (mm²) are not worth a bridge search.
const MIN_BRIDGE_AREA: CoordF = 0.5;

/// A scored bridging direction.
///
/// Lengths are in scaled units.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeDirection {
    /// Direction of the bridge lines, radians.
    pub angle: CoordF,
    /// The candidate runs parallel to an edge of the bridge region.
    pub along_perimeter: bool,
    /// Final score, higher is better.
    pub coverage: CoordF,
    pub total_length_anchored: CoordF,
    pub max_length_anchored: CoordF,
    pub total_length_free: CoordF,
    pub max_length_free: CoordF,
    pub nb_lines_anchored: usize,
    pub nb_lines_free: usize,
    pub median_length_anchored: CoordF,
}

impl BridgeDirection {
    fn new(angle: CoordF, along_perimeter: bool) -> Self {
        Self {
            angle,
            along_perimeter,
            coverage: 0.0,
            total_length_anchored: 0.0,
            max_length_anchored: 0.0,
            total_length_free: 0.0,
            max_length_free: 0.0,
            nb_lines_anchored: 0,
            nb_lines_free: 0,
            median_length_anchored: 0.0,
        }
    }

    /// Whether any test line was anchored at both ends.
    pub fn has_coverage(&self) -> bool {
        self.total_length_anchored > 0.0 && self.nb_lines_anchored > 0
    }

    /// Share of test line length that is anchored, in [0, 1].
    pub fn anchored_ratio(&self) -> CoordF {
        let total = self.total_length_anchored + self.total_length_free;
        if total > 0.0 {
            self.total_length_anchored / total
        } else {
            0.0
        }
    }
}

/// Finds the best bridging angle for a set of unsupported regions.
#[derive(Debug, Clone)]
pub struct BridgeDetector {
    /// The regions to bridge, not inflated.
    expolygons: ExPolygons,
    /// Everything printed on the layer below.
    lower_slices: ExPolygons,
    /// Line spacing (scaled).
    spacing: Coord,
    /// Open polylines where the grown bridge contour rests on the lower layer.
    edges: Vec<Polyline>,
    /// Grown bridge area resting on the lower layer.
    anchor_regions: ExPolygons,
    angle: Option<CoordF>,
}

impl BridgeDetector {
    /// Create a detector for a single region.
    ///
    /// `spacing` is the extrusion spacing in mm.
    pub fn new(expolygon: ExPolygon, lower_slices: &[ExPolygon], spacing: CoordF) -> Self {
        Self::new_multi(vec![expolygon], lower_slices, spacing)
    }

    /// Create a detector for several regions bridged with a common angle.
    pub fn new_multi(expolygons: ExPolygons, lower_slices: &[ExPolygon], spacing: CoordF) -> Self {
        let mut detector = Self {
            expolygons,
            lower_slices: lower_slices.to_vec(),
            spacing: scale(spacing).max(1),
            edges: Vec::new(),
            anchor_regions: Vec::new(),
            angle: None,
        };
        detector.initialize();
        detector
    }

    fn initialize(&mut self) {
        if self.lower_slices.is_empty() || self.expolygons.is_empty() {
            return;
        }
        let grown = clipper::offset_expolygons(
            &self.expolygons,
            unscale(self.spacing),
            OffsetJoinType::Miter,
        );
        if grown.is_empty() {
            return;
        }

        // Support edges: grown contour and holes clipped by the lower contours only.
        let lower_contours: ExPolygons = self
            .lower_slices
            .iter()
            .map(|ex| ExPolygon::new(ex.contour.clone()))
            .collect();
        self.edges =
            clipper::intersection_pl(&clipper::expolygons_to_polylines(&grown), &lower_contours);

        let lower = clipper::offset_expolygons(
            &clipper::union_ex(&self.lower_slices),
            ANCHOR_SAFETY_OFFSET,
            OffsetJoinType::Square,
        );
        self.anchor_regions = clipper::intersection(&grown, &lower);
    }

    /// Detect the best bridging angle.
    ///
    /// With `override_angle` set that angle is the only candidate, but it still
    /// has to anchor at least one test line. Returns `None` when the region has
    /// no anchors on the layer below or no candidate anchors anything; callers
    /// then print it as ordinary solid infill.
    pub fn detect_angle(&mut self, override_angle: Option<CoordF>) -> Option<BridgeDirection> {
        if self.edges.is_empty() || self.anchor_regions.is_empty() {
            return None;
        }

        let mut candidates = match override_angle {
            Some(angle) => vec![BridgeDirection::new(angle, false)],
            None => self.direction_candidates(),
        };

        // Half the anchor margin, so test line ends fall inside anchors rather than on them.
        let clip_area = clipper::offset_expolygons(
            &self.expolygons,
            0.5 * unscale(self.spacing),
            OffsetJoinType::Miter,
        );

        for candidate in &mut candidates {
            self.measure(candidate, &clip_area);
        }

        let qualifying: Vec<&BridgeDirection> =
            candidates.iter().filter(|c| c.has_coverage()).collect();
        if qualifying.is_empty() {
            debug!("bridge: no candidate direction reaches an anchor");
            return None;
        }
        let (min_median, max_median) = min_max(qualifying.iter().map(|c| c.median_length_anchored));
        let (min_max_len, max_max_len) = min_max(qualifying.iter().map(|c| c.max_length_anchored));
        let median_spread = (max_median - min_median).max(1.0);
        let max_spread = (max_max_len - min_max_len).max(1.0);

        let mut best: Option<(usize, CoordF)> = None;
        for (i, c) in candidates.iter_mut().enumerate() {
            if !c.has_coverage() {
                continue;
            }
            c.coverage = 70.0 * c.anchored_ratio()
                + 15.0 * (1.0 - (c.median_length_anchored - min_median) / median_spread)
                + 15.0 * (1.0 - (c.max_length_anchored - min_max_len) / max_spread);
            if c.along_perimeter {
                c.coverage += ALONG_PERIMETER_BONUS;
            }
            // Strictly greater, so the first-seen candidate keeps a tie.
            if best.map_or(true, |(_, score)| c.coverage > score) {
                best = Some((i, c.coverage));
            }
        }

        let (best, _) = best?;
        let mut winner = candidates.swap_remove(best);
        winner.angle = normalize_direction(winner.angle);
        debug!(
            "bridge: angle {:.1}° (coverage {:.2}, {} anchored lines)",
            winner.angle.to_degrees(),
            winner.coverage,
            winner.nb_lines_anchored
        );
        self.angle = Some(winner.angle);
        Some(winner)
    }

    /// The angle found by the last successful [`Self::detect_angle`].
    pub fn angle(&self) -> Option<CoordF> {
        self.angle
    }

    /// Rasterize the bridge at the candidate angle and accumulate line statistics.
    fn measure(&self, candidate: &mut BridgeDirection, clip_area: &[ExPolygon]) {
        let angle = candidate.angle;
        let bbox = get_extents_rotated(&self.anchor_regions, -angle);
        if !bbox.defined {
            return;
        }
        let lines: Vec<Polyline> = (bbox.min.y..=bbox.max.y)
            .step_by(self.spacing as usize)
            .map(|y| {
                Polyline::from_points(vec![
                    Point::new(bbox.min.x, y).rotate(angle),
                    Point::new(bbox.max.x, y).rotate(angle),
                ])
            })
            .collect();

        let mut anchored = Vec::new();
        for line in clipper::intersection_pl(&lines, clip_area) {
            let len = line.length();
            if clipper::contains_point(&self.anchor_regions, &line.first_point())
                && clipper::contains_point(&self.anchor_regions, &line.last_point())
            {
                candidate.total_length_anchored += len;
                candidate.max_length_anchored = candidate.max_length_anchored.max(len);
                candidate.nb_lines_anchored += 1;
                anchored.push(len);
            } else {
                candidate.total_length_free += len;
                candidate.max_length_free = candidate.max_length_free.max(len);
                candidate.nb_lines_free += 1;
            }
        }
        if !anchored.is_empty() {
            anchored.sort_by(|a, b| a.total_cmp(b));
            candidate.median_length_anchored = anchored[anchored.len() / 2];
        }
    }

    fn direction_candidates(&self) -> Vec<BridgeDirection> {
        let steps = (PI / RESOLUTION).round() as usize;
        let mut angles: Vec<BridgeDirection> = (0..steps)
            .map(|i| BridgeDirection::new(i as CoordF * RESOLUTION, false))
            .collect();

        angles.extend(
            self.expolygons
                .iter()
                .flat_map(|e| e.lines())
                .filter(|l| !l.is_point())
                .map(|l| BridgeDirection::new(l.direction_angle(), true)),
        );

        // Open support edges find the angle for C-shaped supports.
        angles.extend(
            self.edges
                .iter()
                .filter(|e| e.len() >= 2 && e.first_point() != e.last_point())
                .map(|e| {
                    BridgeDirection::new(
                        Line::new(e.first_point(), e.last_point()).direction_angle(),
                        false,
                    )
                }),
        );

        angles.sort_by(|a, b| a.angle.total_cmp(&b.angle));
        let mut unique: Vec<BridgeDirection> = Vec::with_capacity(angles.len());
        for candidate in angles {
            match unique.last_mut() {
                Some(last) if directions_parallel(last.angle, candidate.angle, ANGLE_TOLERANCE) => {
                    last.along_perimeter |= candidate.along_perimeter;
                }
                _ => unique.push(candidate),
            }
        }
        if unique.len() >= 2 {
            let first = unique[0].angle;
            let last = unique[unique.len() - 1].angle;
            if directions_parallel(first, last, ANGLE_TOLERANCE) {
                if let Some(dropped) = unique.pop() {
                    unique[0].along_perimeter |= dropped.along_perimeter;
                }
            }
        }
        unique
    }

    /// Area of the bridge that lines at `angle` can cover between anchors.
    ///
    /// The fast mode counts a trapezoid when two of its edges run through the
    /// anchors for at least one line spacing. The precise mode needs the
    /// trapezoid to overlap two separate anchor pieces and trims it to them.
    pub fn coverage(&self, angle: CoordF, precise: bool) -> ExPolygons {
        if self.anchor_regions.is_empty() {
            return Vec::new();
        }
        let rotation = PI / 2.0 - angle;
        let anchors = clipper::rotate_expolygons(&self.anchor_regions, rotation);
        let spacing = self.spacing as CoordF;

        let mut covered = Vec::new();
        for expolygon in &self.expolygons {
            let rotated = expolygon.rotated(rotation);
            let grown = clipper::offset_expolygons(
                std::slice::from_ref(&rotated),
                0.5 * unscale(self.spacing),
                OffsetJoinType::Miter,
            );
            for expoly in &grown {
                for mut trapezoid in vertical_trapezoids(expoly) {
                    let supported = if precise {
                        let pieces =
                            clipper::intersection(&[ExPolygon::new(trapezoid.clone())], &anchors);
                        if pieces.len() >= 2 {
                            clamp_to_anchor_centers(&mut trapezoid, &pieces);
                            true
                        } else {
                            false
                        }
                    } else {
                        let sides: Vec<Polyline> = trapezoid
                            .lines()
                            .iter()
                            .map(|l| Polyline::from_points(vec![l.a, l.b]))
                            .collect();
                        clipper::intersection_pl(&sides, &anchors)
                            .iter()
                            .filter(|piece| piece.length() >= spacing)
                            .count()
                            >= 2
                    };
                    if supported && trapezoid.is_valid() {
                        covered.push(ExPolygon::new(trapezoid));
                    }
                }
            }
        }

        // Unite before rotating back; rotation leaves tiny gaps between neighbours.
        let covered = clipper::union_ex(&covered);
        clipper::rotate_expolygons(&covered, -rotation)
    }

    /// Bridge edges off the grown lower layer that are not parallel to `angle`.
    ///
    /// Supporting these edges would let the whole region bridge at `angle`.
    pub fn unsupported_edges(&self, angle: CoordF) -> Vec<Polyline> {
        let grown_lower = clipper::offset_expolygons(
            &self.lower_slices,
            unscale(self.spacing),
            OffsetJoinType::Miter,
        );
        let outline = clipper::expolygons_to_polylines(&self.expolygons);
        clipper::diff_pl(&outline, &grown_lower)
            .iter()
            .flat_map(Polyline::lines)
            .filter(|l| !l.is_point() && !l.parallel_to(angle, ANGLE_TOLERANCE))
            .map(|l| Polyline::from_points(vec![l.a, l.b]))
            .collect()
    }

    pub fn anchor_regions(&self) -> &ExPolygons {
        &self.anchor_regions
    }

    pub fn edges(&self) -> &[Polyline] {
        &self.edges
    }

    pub fn expolygons(&self) -> &ExPolygons {
        &self.expolygons
    }
}

fn min_max(values: impl Iterator<Item = CoordF>) -> (CoordF, CoordF) {
    values.fold((CoordF::INFINITY, CoordF::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Split an expolygon into trapezoids with vertical parallel sides.
///
/// Slab boundaries are the distinct vertex x coordinates; inside a slab the
/// crossing edges pair up by even-odd fill, which handles holes.
fn vertical_trapezoids(expoly: &ExPolygon) -> Vec<Polygon> {
    let edges: Vec<Line> = expoly.lines().into_iter().filter(|l| l.a.x != l.b.x).collect();
    let mut xs: Vec<Coord> = expoly
        .polygons()
        .flat_map(|p| p.points().iter().map(|pt| pt.x))
        .collect();
    xs.sort_unstable();
    xs.dedup();

    let mut trapezoids = Vec::new();
    for slab in xs.windows(2) {
        let (x0, x1) = (slab[0], slab[1]);
        let xm = 0.5 * (x0 as CoordF + x1 as CoordF);
        let mut crossings: Vec<(CoordF, Coord, Coord)> = edges
            .iter()
            .filter(|l| l.a.x.min(l.b.x) <= x0 && l.a.x.max(l.b.x) >= x1)
            .map(|l| {
                (
                    y_at(l, xm),
                    y_at(l, x0 as CoordF).round() as Coord,
                    y_at(l, x1 as CoordF).round() as Coord,
                )
            })
            .collect();
        crossings.sort_by(|a, b| a.0.total_cmp(&b.0));
        for pair in crossings.chunks_exact(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if hi.0 - lo.0 <= 0.0 {
                continue;
            }
            trapezoids.push(Polygon::from_points(vec![
                Point::new(x0, lo.1),
                Point::new(x1, lo.2),
                Point::new(x1, hi.2),
                Point::new(x0, hi.1),
            ]));
        }
    }
    trapezoids
}

fn y_at(line: &Line, x: CoordF) -> CoordF {
    let t = (x - line.a.x as CoordF) / (line.b.x - line.a.x) as CoordF;
    line.a.y as CoordF + t * (line.b.y - line.a.y) as CoordF
}

/// Keep the trapezoid between the centers of the anchor pieces it touches.
fn clamp_to_anchor_centers(trapezoid: &mut Polygon, pieces: &[ExPolygon]) {
    let centers: Vec<Coord> = pieces.iter().map(|p| p.bounding_box().center().y).collect();
    let (Some(&min_y), Some(&max_y)) = (centers.iter().min(), centers.iter().max()) else {
        return;
    };
    let clamped: Vec<Point> = trapezoid
        .points()
        .iter()
        .map(|p| Point::new(p.x, p.y.clamp(min_y, max_y)))
        .collect();
    *trapezoid = Polygon::from_points(clamped);
}

/// A bridge region found on one layer of an object.
#[derive(Debug, Clone)]
pub struct BridgeRegion {
    pub layer_id: usize,
    pub print_z: CoordF,
    pub region: ExPolygon,
    /// `None` when nothing below can anchor the bridge.
    pub direction: Option<BridgeDirection>,
    pub unsupported_edges: usize,
}

/// Find the unsupported regions of every layer and detect their bridge angles.
///
/// Layers are independent, so the search runs on the rayon pool; results come
/// back in layer order.
pub fn detect_object_bridges(object: &PrintObject, spacing: CoordF) -> Vec<BridgeRegion> {
    object
        .layers
        .par_windows(2)
        .map(|pair| {
            let (lower, layer) = (&pair[0], &pair[1]);
            clipper::difference(&layer.slices, &lower.slices)
                .into_iter()
                .filter(|region| clipper::total_area(std::slice::from_ref(region)) >= MIN_BRIDGE_AREA)
                .map(|region| {
                    let mut detector = BridgeDetector::new(region.clone(), &lower.slices, spacing);
                    let direction = detector.detect_angle(None);
                    let unsupported_edges = direction
                        .as_ref()
                        .map_or(0, |d| detector.unsupported_edges(d.angle).len());
                    BridgeRegion {
                        layer_id: layer.id,
                        print_z: layer.print_z,
                        region,
                        direction,
                        unsupported_edges,
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Bounding box of `expolygons` after rotating them by `angle`.
fn get_extents_rotated(expolygons: &[ExPolygon], angle: CoordF) -> BoundingBox {
    get_extents(&clipper::rotate_expolygons(expolygons, angle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::print::Layer;

    fn rect_mm(x0: CoordF, y0: CoordF, x1: CoordF, y1: CoordF) -> ExPolygon {
        ExPolygon::rectangle(Point::new_scale(x0, y0), Point::new_scale(x1, y1))
    }

    /// 20 x 5 mm gap resting on two pillars to the left and right.
    fn pillars() -> (ExPolygon, ExPolygons) {
        let bridge = rect_mm(0.0, 0.0, 20.0, 5.0);
        let lower = vec![rect_mm(-5.0, 0.0, 0.0, 5.0), rect_mm(20.0, 0.0, 25.0, 5.0)];
        (bridge, lower)
    }

    #[test]
    fn test_rotated_extents_swap_axes() {
        let (bridge, _) = pillars();
        let size = get_extents_rotated(std::slice::from_ref(&bridge), PI / 2.0).size();
        assert!((size.x - scale(5.0)).abs() <= 2);
        assert!((size.y - scale(20.0)).abs() <= 2);
    }

    #[test]
    fn test_detector_finds_anchors() {
        let (bridge, lower) = pillars();
        let detector = BridgeDetector::new(bridge, &lower, 0.4);
        assert!(!detector.edges().is_empty());
        assert_eq!(detector.anchor_regions().len(), 2);
    }

    #[test]
    fn test_detect_angle_spans_pillars() {
        let (bridge, lower) = pillars();
        let mut detector = BridgeDetector::new(bridge, &lower, 0.4);
        let direction = detector.detect_angle(None).unwrap();
        let off_axis = direction.angle.min(PI - direction.angle);
        assert!(off_axis < 3.0_f64.to_radians(), "angle {}", direction.angle);
        assert!(direction.anchored_ratio() > 0.8);
        assert_eq!(detector.angle(), Some(direction.angle));
    }

    #[test]
    fn test_detect_angle_deterministic_and_normalized() {
        let (bridge, lower) = pillars();
        let a = BridgeDetector::new(bridge.clone(), &lower, 0.4)
            .detect_angle(None)
            .unwrap();
        let b = BridgeDetector::new(bridge, &lower, 0.4)
            .detect_angle(None)
            .unwrap();
        assert_eq!(a.angle, b.angle);
        assert_eq!(a.coverage, b.coverage);
        assert!((0.0..PI).contains(&a.angle));
    }

    #[test]
    fn test_detect_angle_without_support_fails() {
        let (bridge, _) = pillars();
        let mut detector = BridgeDetector::new(bridge, &[], 0.4);
        assert!(detector.detect_angle(None).is_none());
        assert!(detector.angle().is_none());
        assert!(detector.coverage(0.0, false).is_empty());
    }

    #[test]
    fn test_override_angle_is_sole_candidate() {
        let (bridge, lower) = pillars();
        let mut detector = BridgeDetector::new(bridge, &lower, 0.4);
        let direction = detector.detect_angle(Some(PI)).unwrap();
        assert_eq!(direction.angle, 0.0);

        // Lines across the gap never touch both pillars.
        let mut detector = BridgeDetector::new(pillars().0, &lower, 0.4);
        assert!(detector.detect_angle(Some(PI / 2.0)).is_none());
    }

    #[test]
    fn test_candidates_collapse_duplicates() {
        let (bridge, lower) = pillars();
        let detector = BridgeDetector::new(bridge, &lower, 0.4);
        let candidates = detector.direction_candidates();
        assert_eq!(candidates.len(), 90);
        assert!(candidates[0].along_perimeter);
        assert!(candidates[45].along_perimeter);
        assert!(candidates.windows(2).all(|w| w[1].angle - w[0].angle >= ANGLE_TOLERANCE));
    }

    #[test]
    fn test_coverage_is_pure() {
        let (bridge, lower) = pillars();
        let detector = BridgeDetector::new(bridge, &lower, 0.4);
        let first = detector.coverage(0.0, false);
        let second = detector.coverage(0.0, false);
        assert_eq!(first, second);
        assert!(clipper::total_area(&first) > 100.0);

        let precise = detector.coverage(0.0, true);
        assert_eq!(precise, detector.coverage(0.0, true));
        assert!(clipper::total_area(&precise) > 90.0);
    }

    #[test]
    fn test_unsupported_edges() {
        let (bridge, lower) = pillars();
        let detector = BridgeDetector::new(bridge, &lower, 0.4);
        // Long sides are parallel to a horizontal bridge.
        assert!(detector.unsupported_edges(0.0).is_empty());
        let across = detector.unsupported_edges(PI / 2.0);
        assert_eq!(across.len(), 2);
        assert!(across.iter().all(|p| p.first_point().y == p.last_point().y));
    }

    #[test]
    fn test_vertical_trapezoids_rectangle_with_hole() {
        let mut square = rect_mm(0.0, 0.0, 10.0, 10.0);
        let mut hole = Polygon::rectangle(Point::new_scale(4.0, 4.0), Point::new_scale(6.0, 6.0));
        hole.make_clockwise();
        square.holes.push(hole);
        let trapezoids = vertical_trapezoids(&square);
        // Left slab, two around the hole, right slab.
        assert_eq!(trapezoids.len(), 4);
        let area: CoordF = trapezoids.iter().map(Polygon::area).sum();
        assert!((area - square.area()).abs() / square.area() < 1e-6);
    }

    #[test]
    fn test_detect_object_bridges() {
        let mut object = PrintObject::new("arch");
        let base = Layer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            slices: pillars().1,
            ..Default::default()
        };
        let deck = Layer {
            id: 1,
            print_z: 0.4,
            height: 0.2,
            slices: vec![rect_mm(-5.0, 0.0, 25.0, 5.0)],
            ..Default::default()
        };
        object.layers = vec![base, deck];

        let bridges = detect_object_bridges(&object, 0.4);
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].layer_id, 1);
        assert!(bridges[0].direction.is_some());
    }
}
