//! Retract when crossing perimeters.
//!
//! Decides whether a travel move can skip retraction because it stays hidden
//! inside sparse infill. A travel qualifies when it lies entirely within one
//! internal (sparse infill) slice of the layer and does not cross any
//! perimeter of that layer.

use crate::extrusion::ExtrusionEntity;
use crate::geometry::{BoundingBox, ExPolygon, Line, Polyline};
use crate::print::Layer;
use crate::scale;

/// Outcome of a travel check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractDecision {
    /// Travel leaves the infill or crosses a perimeter.
    Retract,
    /// Travel is hidden inside sparse infill.
    NoRetract,
}

impl RetractDecision {
    #[inline]
    pub fn should_retract(&self) -> bool {
        matches!(self, RetractDecision::Retract)
    }
}

/// Per-layer cache of internal islands and perimeter segments.
///
/// The cache is keyed by `(print_z, layer id)` and rebuilt lazily when the
/// emitter moves on to another layer.
#[derive(Debug, Default)]
pub struct RetractWhenCrossingPerimeters {
    cached_layer: Option<(u64, usize)>,
    internal_islands: Vec<ExPolygon>,
    internal_islands_bboxes: Vec<BoundingBox>,
    perimeter_lines: Vec<Line>,
    perimeter_lines_bbox: BoundingBox,
    perimeters_cached: bool,
}

impl RetractWhenCrossingPerimeters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Check one travel against `layer`.
    pub fn check_travel(&mut self, layer: &Layer, travel: &Polyline) -> RetractDecision {
        if travel.points().len() < 2 {
            return RetractDecision::NoRetract;
        }
        if !self.travel_inside_internal_regions(layer, travel) {
            return RetractDecision::Retract;
        }
        if self.travel_crosses_perimeters(layer, travel) {
            return RetractDecision::Retract;
        }
        RetractDecision::NoRetract
    }

    fn travel_inside_internal_regions(&mut self, layer: &Layer, travel: &Polyline) -> bool {
        self.update_internal_islands_cache(layer);
        if self.internal_islands.is_empty() {
            return false;
        }
        let travel_bbox = travel.bounding_box();
        self.internal_islands
            .iter()
            .zip(&self.internal_islands_bboxes)
            .filter(|(_, bbox)| travel_bbox.overlap(bbox))
            .any(|(island, _)| polyline_inside_expolygon(travel, island))
    }

    fn travel_crosses_perimeters(&mut self, layer: &Layer, travel: &Polyline) -> bool {
        self.update_perimeter_lines_cache(layer);
        if self.perimeter_lines.is_empty() {
            return false;
        }
        let travel_bbox = travel.bounding_box();
        if !travel_bbox.overlap(&self.perimeter_lines_bbox) {
            return false;
        }
        for travel_line in travel.lines() {
            let line_bbox = BoundingBox::from_points(&[travel_line.a, travel_line.b]);
            for perimeter_line in &self.perimeter_lines {
                let perimeter_bbox = BoundingBox::from_points(&[perimeter_line.a, perimeter_line.b]);
                if !line_bbox.overlap(&perimeter_bbox) {
                    continue;
                }
                if lines_intersect(&travel_line, perimeter_line) {
                    return true;
                }
            }
        }
        false
    }

    fn update_internal_islands_cache(&mut self, layer: &Layer) {
        let key = (layer.print_z.to_bits(), layer.id);
        if self.cached_layer == Some(key) {
            return;
        }
        self.internal_islands.clear();
        self.internal_islands_bboxes.clear();
        self.perimeters_cached = false;
        self.cached_layer = Some(key);

        for region in &layer.regions {
            for island in region.internal_slices.iter().filter(|s| !s.is_empty()) {
                self.internal_islands_bboxes.push(island.bounding_box());
                self.internal_islands.push(island.clone());
            }
        }
    }

    fn update_perimeter_lines_cache(&mut self, layer: &Layer) {
        self.update_internal_islands_cache(layer);
        if self.perimeters_cached {
            return;
        }
        self.perimeter_lines.clear();
        self.perimeter_lines_bbox = BoundingBox::new();

        let mut lines: Vec<Line> = self.internal_islands.iter().flat_map(ExPolygon::lines).collect();
        for region in &layer.regions {
            for entity in &region.perimeters.entities {
                collect_lines(entity, &mut lines);
            }
        }
        for line in &lines {
            self.perimeter_lines_bbox.merge_point(line.a);
            self.perimeter_lines_bbox.merge_point(line.b);
        }
        self.perimeter_lines = lines;
        // 1 micron of slack for numerical stability
        self.perimeter_lines_bbox.offset(scale(0.001));
        self.perimeters_cached = true;
    }
}

fn collect_lines(entity: &ExtrusionEntity, out: &mut Vec<Line>) {
    match entity {
        ExtrusionEntity::Path(p) => out.extend(p.polyline.lines()),
        ExtrusionEntity::MultiPath(mp) => mp.paths.iter().for_each(|p| out.extend(p.polyline.lines())),
        ExtrusionEntity::Loop(l) => l.paths.iter().for_each(|p| out.extend(p.polyline.lines())),
        ExtrusionEntity::Collection(c) => c.entities.iter().for_each(|e| collect_lines(e, out)),
    }
}

/// Every vertex and every segment midpoint lies inside `expolygon`.
fn polyline_inside_expolygon(polyline: &Polyline, expolygon: &ExPolygon) -> bool {
    polyline.points().iter().all(|p| expolygon.contains_point(p))
        && polyline
            .lines()
            .iter()
            .all(|edge| expolygon.contains_point(&edge.midpoint()))
}

/// Segment intersection test using cross products, endpoints included.
fn lines_intersect(line1: &Line, line2: &Line) -> bool {
    let (p1, p2, p3, p4) = (line1.a, line1.b, line2.a, line2.b);
    let d1x = (p2.x - p1.x) as i128;
    let d1y = (p2.y - p1.y) as i128;
    let d2x = (p4.x - p3.x) as i128;
    let d2y = (p4.y - p3.y) as i128;

    let cross = d1x * d2y - d1y * d2x;
    if cross == 0 {
        return false;
    }
    let dx = (p3.x - p1.x) as i128;
    let dy = (p3.y - p1.y) as i128;
    let t_num = dx * d2y - dy * d2x;
    let u_num = dx * d1y - dy * d1x;
    if cross > 0 {
        (0..=cross).contains(&t_num) && (0..=cross).contains(&u_num)
    } else {
        (cross..=0).contains(&t_num) && (cross..=0).contains(&u_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrusion::{ExtrusionLoop, ExtrusionLoopRole, ExtrusionPath, ExtrusionRole};
    use crate::geometry::{Point, Polygon};
    use crate::print::LayerRegion;

    fn square(x: f64, y: f64, size: f64) -> ExPolygon {
        ExPolygon::rectangle(Point::new_scale(x, y), Point::new_scale(x + size, y + size))
    }

    fn layer_with_internal(slices: Vec<ExPolygon>) -> Layer {
        Layer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            regions: vec![LayerRegion {
                internal_slices: slices,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn travel(a: (f64, f64), b: (f64, f64)) -> Polyline {
        Polyline::from_points(vec![Point::new_scale(a.0, a.1), Point::new_scale(b.0, b.1)])
    }

    #[test]
    fn test_retract_decision() {
        assert!(RetractDecision::Retract.should_retract());
        assert!(!RetractDecision::NoRetract.should_retract());
    }

    #[test]
    fn test_degenerate_travel_never_retracts() {
        let mut checker = RetractWhenCrossingPerimeters::new();
        let layer = layer_with_internal(Vec::new());
        assert_eq!(checker.check_travel(&layer, &Polyline::new()), RetractDecision::NoRetract);
    }

    #[test]
    fn test_travel_inside_internal_region() {
        let mut checker = RetractWhenCrossingPerimeters::new();
        let layer = layer_with_internal(vec![square(0.0, 0.0, 10.0)]);
        assert_eq!(
            checker.check_travel(&layer, &travel((2.0, 2.0), (8.0, 8.0))),
            RetractDecision::NoRetract
        );
        assert_eq!(
            checker.check_travel(&layer, &travel((5.0, 5.0), (15.0, 15.0))),
            RetractDecision::Retract
        );
    }

    #[test]
    fn test_travel_between_islands_retracts() {
        let mut checker = RetractWhenCrossingPerimeters::new();
        let layer = layer_with_internal(vec![square(0.0, 0.0, 5.0), square(10.0, 10.0, 5.0)]);
        assert!(!checker.check_travel(&layer, &travel((11.0, 11.0), (14.0, 14.0))).should_retract());
        assert!(checker.check_travel(&layer, &travel((4.0, 4.0), (11.0, 11.0))).should_retract());
    }

    #[test]
    fn test_crossing_a_perimeter_retracts() {
        let mut layer = layer_with_internal(vec![square(0.0, 0.0, 20.0)]);
        let hole = Polygon::rectangle(Point::new_scale(8.0, 0.5), Point::new_scale(9.0, 19.5));
        let template = ExtrusionPath::new(ExtrusionRole::Perimeter, 0.05, 0.45, 0.2);
        layer.regions[0]
            .perimeters
            .push(ExtrusionLoop::from_polygon(&hole, template, ExtrusionLoopRole::Default));

        let mut checker = RetractWhenCrossingPerimeters::new();
        assert!(checker.check_travel(&layer, &travel((2.0, 10.0), (15.0, 10.0))).should_retract());
        assert!(!checker.check_travel(&layer, &travel((2.0, 2.0), (2.0, 18.0))).should_retract());
    }

    #[test]
    fn test_cache_follows_layer() {
        let mut checker = RetractWhenCrossingPerimeters::new();
        let layer0 = layer_with_internal(vec![square(0.0, 0.0, 10.0)]);
        let mut layer1 = layer_with_internal(Vec::new());
        layer1.id = 1;
        layer1.print_z = 0.4;

        let t = travel((2.0, 2.0), (3.0, 3.0));
        assert!(!checker.check_travel(&layer0, &t).should_retract());
        assert!(checker.check_travel(&layer1, &t).should_retract());
        checker.clear();
        assert!(checker.cached_layer.is_none());
    }

    #[test]
    fn test_lines_intersect() {
        let cross_a = Line::new(Point::new(0, 0), Point::new(100, 100));
        let cross_b = Line::new(Point::new(0, 100), Point::new(100, 0));
        assert!(lines_intersect(&cross_a, &cross_b));

        let parallel = Line::new(Point::new(0, 10), Point::new(100, 110));
        assert!(!lines_intersect(&cross_a, &parallel));

        let touching = Line::new(Point::new(100, 100), Point::new(200, 0));
        assert!(lines_intersect(&cross_a, &touching));

        let apart = Line::new(Point::new(160, 60), Point::new(200, 100));
        assert!(!lines_intersect(&cross_a, &apart));
    }
}
