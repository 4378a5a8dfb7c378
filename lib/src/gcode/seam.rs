//! Seam placement.
//!
//! A [`SeamPlacer`] picks the point where a closed loop starts and ends. The
//! emitter then splits the loop there. [`NearestSeamPlacer`] scores every
//! vertex of the loop: concave corners hide the seam best, flat stretches
//! worst, points close to the preferred location get a bonus and points
//! hanging over air get a penalty.

use std::collections::HashMap;
use std::f64::consts::PI;

use crate::config::SeamPosition;
use crate::extrusion::{ExtrusionLoop, ExtrusionLoopRole};
use crate::geometry::{BoundingBox, ExPolygon, Line, Point, Polygon};
use crate::{scale, CoordF};

const PENALTY_CONVEX_VERTEX: f64 = 1.0;
const PENALTY_FLAT_SURFACE: f64 = 5.0;
const PENALTY_OVERHANG_HALF: f64 = 10.0;

/// Boundary of the layer below, used to detect seams over air.
#[derive(Debug, Clone, Default)]
pub struct LowerLayerEdges {
    islands: Vec<ExPolygon>,
    lines: Vec<Line>,
}

impl LowerLayerEdges {
    pub fn new(islands: &[ExPolygon]) -> Self {
        Self {
            islands: islands.to_vec(),
            lines: islands.iter().flat_map(ExPolygon::lines).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Distance to the nearest edge (scaled), negative inside the lower layer.
    pub fn signed_distance(&self, p: &Point) -> CoordF {
        let d = self
            .lines
            .iter()
            .map(|l| l.distance_to_point(p))
            .fold(CoordF::INFINITY, CoordF::min);
        if self.islands.iter().any(|island| island.contains_point(p)) {
            -d
        } else {
            d
        }
    }
}

/// Everything a seam placer may look at besides the loop itself.
#[derive(Debug, Clone, Copy)]
pub struct SeamRequest<'a> {
    /// Where the nozzle is now.
    pub last_pos: Point,
    pub nozzle_diameter: CoordF,
    /// Index of the object, used to keep aligned seams per object.
    pub object_idx: usize,
    /// Bounding box of the object in print coordinates, for rear seams.
    pub object_bbox: Option<BoundingBox>,
    pub layer_id: usize,
    pub lower_layer: Option<&'a LowerLayerEdges>,
}

/// Chooses the start point of a closed loop.
pub trait SeamPlacer {
    /// A point on, or insertable into, `extrusion_loop`.
    fn place_seam(&mut self, extrusion_loop: &ExtrusionLoop, request: &SeamRequest<'_>) -> Point;
}

/// Penalty-based seam placement honoring [`SeamPosition`].
#[derive(Debug, Clone, Default)]
pub struct NearestSeamPlacer {
    pub position: SeamPosition,
    /// Last seam chosen per object, followed by aligned seams.
    last_seams: HashMap<usize, Point>,
}

impl NearestSeamPlacer {
    pub fn new(position: SeamPosition) -> Self {
        Self {
            position,
            last_seams: HashMap::new(),
        }
    }

    fn random_vertex(polygon: &Polygon, request: &SeamRequest<'_>) -> Point {
        // Deterministic per layer so repeated exports are identical.
        let mut h = (request.layer_id as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(request.object_idx as u64);
        h ^= h >> 33;
        h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        let idx = (h % polygon.len() as u64) as usize;
        polygon.points()[idx]
    }
}

impl SeamPlacer for NearestSeamPlacer {
    fn place_seam(&mut self, extrusion_loop: &ExtrusionLoop, request: &SeamRequest<'_>) -> Point {
        let mut polygon = extrusion_loop.polygon();
        if polygon.len() < 2 {
            return extrusion_loop.first_point();
        }

        if self.position == SeamPosition::Random {
            // Innermost contours get a random seam; the loops around them
            // follow it through `last_pos`.
            if extrusion_loop.loop_role == ExtrusionLoopRole::ContourInternalPerimeter {
                return Self::random_vertex(&polygon, request);
            }
            return nearest_vertex(&polygon, request.last_pos);
        }

        let was_clockwise = polygon.make_counter_clockwise();
        let (preferred, weight) = match self.position {
            SeamPosition::Aligned => match self.last_seams.get(&request.object_idx) {
                Some(&p) => (p, 1.0),
                None => (request.last_pos, 1.0),
            },
            SeamPosition::Rear => match request.object_bbox {
                Some(bbox) => {
                    let size = bbox.size();
                    let radius = 0.5 * ((size.x as CoordF).powi(2) + (size.y as CoordF).powi(2)).sqrt();
                    let mut p = bbox.center();
                    p.y += (3.0 * radius) as i64;
                    (p, 5.0)
                }
                None => (request.last_pos, 1.0),
            },
            _ => (request.last_pos, 1.0),
        };

        let points = polygon.points();
        let n = points.len();
        let proj_idx = nearest_index(points, preferred);
        let lengths = parameter_by_length(&polygon);
        let total = lengths[n];
        let nozzle_r = scale(0.5 * request.nozzle_diameter) as CoordF;
        let angles = angles_at_vertices(&polygon, &lengths, nozzle_r);

        let mut penalties: Vec<CoordF> = (0..n)
            .map(|i| {
                let ccw_angle = if was_clockwise { -angles[i] } else { angles[i] };
                let mut penalty = if ccw_angle < -0.6 * PI {
                    // Sharp reflex vertex hides the seam.
                    0.0
                } else if ccw_angle > 0.6 * PI {
                    PENALTY_CONVEX_VERTEX
                } else if ccw_angle < 0.0 {
                    PENALTY_FLAT_SURFACE * bspline_kernel(ccw_angle * PI * 2.0 / 3.0)
                } else {
                    PENALTY_CONVEX_VERTEX
                        + (PENALTY_FLAT_SURFACE - PENALTY_CONVEX_VERTEX)
                            * bspline_kernel(ccw_angle * PI * 2.0 / 3.0)
                };
                let along = (lengths[i] - lengths[proj_idx]).abs();
                let dist = along.min(total - along);
                let dist_max = 0.1 * total;
                if dist_max > 0.0 {
                    penalty -= weight * bspline_kernel(dist / dist_max);
                }
                penalty.max(0.0)
            })
            .collect();

        if let Some(lower) = request.lower_layer.filter(|l| !l.is_empty()) {
            for (penalty, p) in penalties.iter_mut().zip(points) {
                let dist = lower.signed_distance(p);
                *penalty += overhang_penalty(nozzle_r, PENALTY_OVERHANG_HALF, dist);
            }
        }

        let mut idx_min = 0;
        for (i, &p) in penalties.iter().enumerate() {
            if p < penalties[idx_min] {
                idx_min = i;
            }
        }
        // Prefer the projected point when it scores almost as well.
        let penalty_aligned = penalties[proj_idx];
        let penalty_min = penalties[idx_min];
        let penalty_max = penalty_min.max(penalty_aligned);
        let diff_rel = if penalty_max == 0.0 {
            0.0
        } else {
            (penalty_min - penalty_aligned).abs() / penalty_max
        };
        if diff_rel < 0.05 {
            idx_min = proj_idx;
        }
        let seam = points[idx_min];
        self.last_seams.insert(request.object_idx, seam);
        seam
    }
}

fn nearest_index(points: &[Point], target: Point) -> usize {
    target.nearest_point_index(points).unwrap_or(0)
}

fn nearest_vertex(polygon: &Polygon, target: Point) -> Point {
    polygon.points()[nearest_index(polygon.points(), target)]
}

/// Cumulative length at every vertex; the last entry is the closed perimeter.
fn parameter_by_length(polygon: &Polygon) -> Vec<CoordF> {
    let points = polygon.points();
    let mut lengths = Vec::with_capacity(points.len() + 1);
    let mut acc = 0.0;
    lengths.push(0.0);
    for i in 1..=points.len() {
        acc += points[i - 1].distance(&points[i % points.len()]);
        lengths.push(acc);
    }
    lengths
}

/// Signed turning angle at each vertex, measured over arms at least
/// `min_arm` long. Positive turns left.
fn angles_at_vertices(polygon: &Polygon, lengths: &[CoordF], min_arm: CoordF) -> Vec<CoordF> {
    let points = polygon.points();
    let n = points.len();
    let total = lengths[n];
    let arm = min_arm.min(total / 3.0);
    (0..n)
        .map(|i| {
            let p = points[i];
            let mut prev = (i + n - 1) % n;
            while prev != i && along_backward(lengths, i, prev, total) < arm {
                prev = (prev + n - 1) % n;
            }
            let mut next = (i + 1) % n;
            while next != i && along_forward(lengths, i, next, total) < arm {
                next = (next + 1) % n;
            }
            if prev == i || next == i {
                return 0.0;
            }
            let v1 = p - points[prev];
            let v2 = points[next] - p;
            let cross = v1.x as CoordF * v2.y as CoordF - v1.y as CoordF * v2.x as CoordF;
            let dot = v1.x as CoordF * v2.x as CoordF + v1.y as CoordF * v2.y as CoordF;
            cross.atan2(dot)
        })
        .collect()
}

fn along_forward(lengths: &[CoordF], from: usize, to: usize, total: CoordF) -> CoordF {
    let d = lengths[to] - lengths[from];
    if d < 0.0 {
        d + total
    } else {
        d
    }
}

fn along_backward(lengths: &[CoordF], from: usize, to: usize, total: CoordF) -> CoordF {
    along_forward(lengths, to, from, total)
}

fn bspline_kernel(x: CoordF) -> CoordF {
    let x = x.abs();
    if x < 1.0 {
        1.0 - 1.5 * x * x + 0.75 * x * x * x
    } else if x < 2.0 {
        let x = x - 1.0;
        0.25 - 0.75 * x + 0.75 * x * x - 0.25 * x * x * x
    } else {
        0.0
    }
}

/// Zero while the extrudate rests on the lower layer, rising to `weight_half`
/// at half a nozzle radius outside and saturating at twice that.
fn overhang_penalty(nozzle_r: CoordF, weight_half: CoordF, distance: CoordF) -> CoordF {
    if distance <= 0.0 || nozzle_r <= 0.0 {
        return 0.0;
    }
    let x = (distance / nozzle_r).min(1.0);
    weight_half * 4.0 * x * x
}
