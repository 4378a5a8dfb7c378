//! Avoid crossing perimeters.
//!
//! Reroutes a travel move around the islands it would otherwise cross, by
//! following the boundary of each crossed island in the shorter direction.
//! Inside one object the boundaries are the current layer's islands of the
//! current copy ("internal"); between objects they are the footprints of all
//! copies ("external").

use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{ExPolygon, Line, Point, Polygon, Polyline};
use crate::CoordF;

/// One crossing of the straight travel with a boundary polygon.
#[derive(Debug, Clone, Copy)]
struct Hit {
    t: CoordF,
    polygon: usize,
    edge: usize,
    point: Point,
}

#[derive(Debug, Default)]
pub struct AvoidCrossingPerimeters {
    /// Islands of the layer being printed, grown to keep travels off the walls.
    internal: Vec<ExPolygon>,
    /// Footprints of every object copy.
    external: Vec<ExPolygon>,
    use_external_mp: bool,
    use_external_mp_once: bool,
    disabled_once: bool,
    /// Maximum detour as a share of the direct travel (%), 0 = unlimited.
    max_detour: CoordF,
}

impl AvoidCrossingPerimeters {
    pub fn new(max_detour: CoordF) -> Self {
        Self {
            max_detour,
            ..Default::default()
        }
    }

    /// Set the islands of the current layer (already shifted to the copy).
    /// `clearance` (mm) keeps the rerouted travel off the perimeters.
    pub fn init_layer(&mut self, islands: &[ExPolygon], clearance: CoordF) {
        self.internal = grow(islands, clearance);
    }

    /// Set the footprints used between objects.
    pub fn init_external(&mut self, footprints: &[ExPolygon], clearance: CoordF) {
        self.external = grow(footprints, clearance);
    }

    pub fn use_external_mp(&mut self, enabled: bool) {
        self.use_external_mp = enabled;
    }

    /// Use the external boundaries for the next travel only.
    pub fn use_external_mp_once(&mut self) {
        self.use_external_mp_once = true;
    }

    pub fn used_external_mp_once(&self) -> bool {
        self.use_external_mp_once
    }

    /// Do not reroute the next travel.
    pub fn disable_once(&mut self) {
        self.disabled_once = true;
    }

    pub fn disabled_once(&self) -> bool {
        self.disabled_once
    }

    /// Clear the one-shot flags; called after every travel.
    pub fn reset_once_modifiers(&mut self) {
        self.use_external_mp_once = false;
        self.disabled_once = false;
    }

    /// Travel from `from` to `to` around the active boundaries.
    ///
    /// The second value is true when the whole route stays inside one island,
    /// where a wipe would not hide anything.
    pub fn travel_to(&self, from: Point, to: Point) -> (Polyline, bool) {
        let external = self.use_external_mp || self.use_external_mp_once;
        let boundaries = if external { &self.external } else { &self.internal };
        let direct = Polyline::from_points(vec![from, to]);
        if boundaries.is_empty() || from == to {
            return (direct, false);
        }

        let polygons: Vec<&Polygon> = boundaries.iter().flat_map(ExPolygon::polygons).collect();
        let route = reroute(&polygons, from, to);

        let direct_len = direct.length();
        let route = if self.max_detour > 0.0
            && route.length() - direct_len > direct_len * self.max_detour / 100.0
        {
            direct
        } else {
            route
        };
        let inside_island = !external && clipper::contains_polyline(&self.internal, &route);
        (route, inside_island)
    }
}

fn grow(islands: &[ExPolygon], clearance: CoordF) -> Vec<ExPolygon> {
    if clearance > 0.0 {
        clipper::offset_expolygons(islands, clearance, OffsetJoinType::Miter)
    } else {
        islands.to_vec()
    }
}

fn reroute(polygons: &[&Polygon], from: Point, to: Point) -> Polyline {
    let travel = Line::new(from, to);
    let mut hits: Vec<Hit> = Vec::new();
    for (pi, polygon) in polygons.iter().enumerate() {
        for (ei, edge) in polygon.lines().iter().enumerate() {
            if let Some(t) = travel.intersection_param(edge) {
                // A crossing exactly at a vertex is reported by both edges.
                if hits.iter().any(|h| h.polygon == pi && (h.t - t).abs() < 1e-9) {
                    continue;
                }
                hits.push(Hit {
                    t,
                    polygon: pi,
                    edge: ei,
                    point: travel.point_at(t),
                });
            }
        }
    }
    hits.sort_by(|a, b| a.t.total_cmp(&b.t));

    let mut points = vec![from];
    let mut i = 0;
    while i < hits.len() {
        let enter = hits[i];
        let exit = hits
            .iter()
            .enumerate()
            .skip(i + 1)
            .rev()
            .find(|(_, h)| h.polygon == enter.polygon);
        match exit {
            Some((j, &exit)) => {
                points.push(enter.point);
                points.extend(walk_boundary(polygons[enter.polygon], &enter, &exit));
                points.push(exit.point);
                i = j + 1;
            }
            None => i += 1,
        }
    }
    points.push(to);
    points.dedup();
    Polyline::from_points(points)
}

/// Vertices between two crossings, going around the shorter way.
fn walk_boundary(polygon: &Polygon, enter: &Hit, exit: &Hit) -> Vec<Point> {
    let pts = polygon.points();
    let n = pts.len();
    if n < 3 || enter.edge == exit.edge {
        return Vec::new();
    }
    let mut forward = Vec::new();
    let mut idx = (enter.edge + 1) % n;
    loop {
        forward.push(pts[idx]);
        if idx == exit.edge {
            break;
        }
        idx = (idx + 1) % n;
    }
    let mut backward = Vec::new();
    let mut idx = enter.edge;
    loop {
        backward.push(pts[idx]);
        if idx == (exit.edge + 1) % n {
            break;
        }
        idx = (idx + n - 1) % n;
    }
    let length = |path: &[Point]| -> CoordF {
        let mut all = Vec::with_capacity(path.len() + 2);
        all.push(enter.point);
        all.extend_from_slice(path);
        all.push(exit.point);
        Polyline::from_points(all).length()
    };
    if length(&forward) <= length(&backward) {
        forward
    } else {
        backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygon {
        ExPolygon::rectangle(Point::new_scale(x0, y0), Point::new_scale(x1, y1))
    }

    #[test]
    fn test_goes_around_obstacle() {
        let mut avoid = AvoidCrossingPerimeters::new(0.0);
        avoid.init_layer(&[square(10.0, -2.0, 20.0, 10.0)], 0.0);
        let (route, inside) = avoid.travel_to(Point::new_scale(0.0, 0.0), Point::new_scale(30.0, 0.0));
        assert!(!inside);
        // Around the bottom edge, which is the short way.
        assert!(route.points.contains(&Point::new_scale(10.0, -2.0)));
        assert!(route.points.contains(&Point::new_scale(20.0, -2.0)));
        assert!(route.length() > Point::new_scale(30.0, 0.0).x as f64);
        assert_eq!(route.first_point(), Point::new_scale(0.0, 0.0));
        assert_eq!(route.last_point(), Point::new_scale(30.0, 0.0));
    }

    #[test]
    fn test_clear_travel_is_straight() {
        let mut avoid = AvoidCrossingPerimeters::new(0.0);
        avoid.init_layer(&[square(10.0, 5.0, 20.0, 10.0)], 0.0);
        let (route, _) = avoid.travel_to(Point::new_scale(0.0, 0.0), Point::new_scale(30.0, 0.0));
        assert_eq!(route.len(), 2);
    }

    #[test]
    fn test_max_detour_falls_back_to_direct() {
        let mut avoid = AvoidCrossingPerimeters::new(10.0);
        avoid.init_layer(&[square(10.0, -20.0, 20.0, 20.0)], 0.0);
        let (route, _) = avoid.travel_to(Point::new_scale(0.0, 0.0), Point::new_scale(30.0, 0.0));
        assert_eq!(route.len(), 2);
    }

    #[test]
    fn test_external_boundaries_once() {
        let mut avoid = AvoidCrossingPerimeters::new(0.0);
        avoid.init_external(&[square(10.0, -2.0, 20.0, 10.0)], 0.0);
        let from = Point::new_scale(0.0, 0.0);
        let to = Point::new_scale(30.0, 0.0);
        assert_eq!(avoid.travel_to(from, to).0.len(), 2);

        avoid.use_external_mp_once();
        assert!(avoid.used_external_mp_once());
        assert!(avoid.travel_to(from, to).0.len() > 2);
        avoid.disable_once();
        avoid.reset_once_modifiers();
        assert!(!avoid.used_external_mp_once());
        assert!(!avoid.disabled_once());
    }

    #[test]
    fn test_inside_island_detected() {
        let mut avoid = AvoidCrossingPerimeters::new(0.0);
        let island = ExPolygon::with_holes(
            square(0.0, 0.0, 40.0, 40.0).contour,
            vec![square(15.0, 15.0, 25.0, 25.0).contour],
        );
        avoid.init_layer(&[island], 0.0);
        let (around_hole, _) = avoid.travel_to(Point::new_scale(5.0, 20.0), Point::new_scale(35.0, 20.0));
        assert!(around_hole.len() > 2);

        let (route, inside) = avoid.travel_to(Point::new_scale(5.0, 5.0), Point::new_scale(35.0, 5.0));
        assert_eq!(route.len(), 2);
        assert!(inside);
        let (_, inside) = avoid.travel_to(Point::new_scale(5.0, 5.0), Point::new_scale(50.0, 5.0));
        assert!(!inside);
    }
}
