//! Extrusion entities.
//!
//! The perimeter, infill and support generators hand the toolpath pipeline
//! typed extrusion entities:
//! - [`ExtrusionPath`] - a single open path with one role and one flow
//! - [`ExtrusionMultiPath`] - a chain of open paths printed back to back
//! - [`ExtrusionLoop`] - a closed loop made of one or more paths
//! - [`ExtrusionEntityCollection`] - a nested, optionally pre-ordered group
//!
//! [`ExtrusionEntity`] is the closed variant over all four; the emitter visits
//! it with a single `match`.

use crate::geometry::{Point, Polygon, Polyline};
use crate::{CoordF, SCALED_EPSILON};
use serde::{Deserialize, Serialize};

/// Functional category of an extrusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtrusionRole {
    /// No extrusion (travel).
    #[default]
    None,
    /// Internal perimeter.
    Perimeter,
    /// External (outer) perimeter.
    ExternalPerimeter,
    /// Perimeter printed over air.
    OverhangPerimeter,
    /// Sparse infill.
    InternalInfill,
    /// Solid infill.
    SolidInfill,
    /// Top solid infill (visible surface).
    TopSolidInfill,
    /// Ironing pass over a top surface.
    Ironing,
    /// Bridge over air.
    BridgeInfill,
    /// Bridge over sparse infill.
    InternalBridgeInfill,
    /// Single-line wall.
    ThinWall,
    /// Gap fill between perimeters.
    GapFill,
    /// Skirt/brim.
    Skirt,
    /// Support material.
    SupportMaterial,
    /// Support interface.
    SupportMaterialInterface,
    /// Wipe tower.
    WipeTower,
    /// Milling pass.
    Milling,
    /// Custom G-code.
    Custom,
    /// Collection of several roles.
    Mixed,
}

impl ExtrusionRole {
    pub fn is_perimeter(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::Perimeter | ExtrusionRole::ExternalPerimeter | ExtrusionRole::OverhangPerimeter
        )
    }

    pub fn is_infill(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::BridgeInfill
                | ExtrusionRole::InternalBridgeInfill
                | ExtrusionRole::InternalInfill
                | ExtrusionRole::SolidInfill
                | ExtrusionRole::TopSolidInfill
                | ExtrusionRole::Ironing
        )
    }

    pub fn is_solid_infill(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::BridgeInfill
                | ExtrusionRole::InternalBridgeInfill
                | ExtrusionRole::SolidInfill
                | ExtrusionRole::TopSolidInfill
                | ExtrusionRole::Ironing
        )
    }

    /// Printed over air (bridges and overhang perimeters).
    pub fn is_bridge(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::BridgeInfill | ExtrusionRole::InternalBridgeInfill | ExtrusionRole::OverhangPerimeter
        )
    }

    pub fn is_support(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::SupportMaterial | ExtrusionRole::SupportMaterialInterface
        )
    }

    /// Name written after the `;TYPE:` tag.
    pub fn name(&self) -> &'static str {
        match self {
            ExtrusionRole::None => "",
            ExtrusionRole::Perimeter => "Perimeter",
            ExtrusionRole::ExternalPerimeter => "External perimeter",
            ExtrusionRole::OverhangPerimeter => "Overhang perimeter",
            ExtrusionRole::InternalInfill => "Internal infill",
            ExtrusionRole::SolidInfill => "Solid infill",
            ExtrusionRole::TopSolidInfill => "Top solid infill",
            ExtrusionRole::Ironing => "Ironing",
            ExtrusionRole::BridgeInfill => "Bridge infill",
            ExtrusionRole::InternalBridgeInfill => "Internal bridge infill",
            ExtrusionRole::ThinWall => "Thin wall",
            ExtrusionRole::GapFill => "Gap fill",
            ExtrusionRole::Skirt => "Skirt",
            ExtrusionRole::SupportMaterial => "Support material",
            ExtrusionRole::SupportMaterialInterface => "Support material interface",
            ExtrusionRole::WipeTower => "Wipe tower",
            ExtrusionRole::Milling => "Mill",
            ExtrusionRole::Custom => "Custom",
            ExtrusionRole::Mixed => "Mixed",
        }
    }

    /// Identifier exposed to custom G-code templates as `extrusion_role`.
    pub fn template_name(&self) -> &'static str {
        match self {
            ExtrusionRole::None => "None",
            ExtrusionRole::Perimeter => "Perimeter",
            ExtrusionRole::ExternalPerimeter => "ExternalPerimeter",
            ExtrusionRole::OverhangPerimeter => "OverhangPerimeter",
            ExtrusionRole::InternalInfill => "InternalInfill",
            ExtrusionRole::SolidInfill => "SolidInfill",
            ExtrusionRole::TopSolidInfill => "TopSolidInfill",
            ExtrusionRole::Ironing => "Ironing",
            ExtrusionRole::BridgeInfill | ExtrusionRole::InternalBridgeInfill => "BridgeInfill",
            ExtrusionRole::ThinWall => "ThinWall",
            ExtrusionRole::GapFill => "GapFill",
            ExtrusionRole::Skirt => "Skirt",
            ExtrusionRole::SupportMaterial => "SupportMaterial",
            ExtrusionRole::SupportMaterialInterface => "SupportMaterialInterface",
            ExtrusionRole::WipeTower => "WipeTower",
            ExtrusionRole::Milling => "Milling",
            ExtrusionRole::Custom => "Custom",
            ExtrusionRole::Mixed => "Mixed",
        }
    }
}

/// Loop flavour, used for seam selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtrusionLoopRole {
    #[default]
    Default,
    /// Perimeter lying inside another perimeter of the same island.
    ContourInternalPerimeter,
    /// Skirt loop; seamed at the nearest point.
    Skirt,
}

/// A single open path with one role and one cross-section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionPath {
    pub polyline: Polyline,
    pub role: ExtrusionRole,
    /// Extruded volume per unit length (mm³/mm).
    pub mm3_per_mm: CoordF,
    /// Nominal width (mm).
    pub width: CoordF,
    /// Nominal height (mm).
    pub height: CoordF,
}

impl ExtrusionPath {
    pub fn new(role: ExtrusionRole, mm3_per_mm: CoordF, width: CoordF, height: CoordF) -> Self {
        Self {
            polyline: Polyline::new(),
            role,
            mm3_per_mm,
            width,
            height,
        }
    }

    /// Path along `points` with a rectangular-ish cross-section of `width` x `height`.
    pub fn from_points(points: Vec<Point>, role: ExtrusionRole, width: CoordF, height: CoordF) -> Self {
        Self {
            polyline: Polyline::from_points(points),
            role,
            mm3_per_mm: flow_mm3_per_mm(width, height),
            width,
            height,
        }
    }

    pub fn with_polyline(mut self, polyline: Polyline) -> Self {
        self.polyline = polyline;
        self
    }

    #[inline]
    pub fn first_point(&self) -> Point {
        self.polyline.first_point()
    }

    #[inline]
    pub fn last_point(&self) -> Point {
        self.polyline.last_point()
    }

    /// Length in scaled units.
    pub fn length(&self) -> CoordF {
        self.polyline.length()
    }

    pub fn reverse(&mut self) {
        self.polyline.reverse();
    }

    pub fn is_empty(&self) -> bool {
        self.polyline.points.is_empty()
    }

    /// Drop `distance` (scaled) from the end of the path.
    pub fn clip_end(&mut self, distance: CoordF) {
        self.polyline.clip_end(distance);
    }
}

/// Cross-section of a rounded rectangle `width` wide and `height` tall (mm²).
pub fn flow_mm3_per_mm(width: CoordF, height: CoordF) -> CoordF {
    if width <= 0.0 || height <= 0.0 {
        return 0.0;
    }
    if width <= height {
        // Round-ish bead
        return std::f64::consts::PI * (width * 0.5) * (width * 0.5);
    }
    height * (width - height * (1.0 - std::f64::consts::FRAC_PI_4))
}

/// Open paths printed one after another without travel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionMultiPath {
    pub paths: Vec<ExtrusionPath>,
}

impl ExtrusionMultiPath {
    pub fn new(paths: Vec<ExtrusionPath>) -> Self {
        Self { paths }
    }

    pub fn first_point(&self) -> Point {
        self.paths.first().map(ExtrusionPath::first_point).unwrap_or_default()
    }

    pub fn last_point(&self) -> Point {
        self.paths.last().map(ExtrusionPath::last_point).unwrap_or_default()
    }

    pub fn length(&self) -> CoordF {
        self.paths.iter().map(ExtrusionPath::length).sum()
    }

    pub fn reverse(&mut self) {
        for path in &mut self.paths {
            path.reverse();
        }
        self.paths.reverse();
    }

    pub fn role(&self) -> ExtrusionRole {
        self.paths.first().map(|p| p.role).unwrap_or_default()
    }
}

/// A closed loop. The last point of every path coincides with the first point
/// of the next one, and the last path ends where the first one starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionLoop {
    pub paths: Vec<ExtrusionPath>,
    #[serde(default)]
    pub loop_role: ExtrusionLoopRole,
    /// Perimeter of a hole (printed clockwise).
    #[serde(default)]
    pub is_hole: bool,
    /// Candidate for the continuous-Z vase treatment.
    #[serde(default)]
    pub is_vase: bool,
}

impl ExtrusionLoop {
    pub fn new(paths: Vec<ExtrusionPath>, loop_role: ExtrusionLoopRole) -> Self {
        Self {
            paths,
            loop_role,
            is_hole: false,
            is_vase: false,
        }
    }

    /// Single-path loop around `polygon`.
    pub fn from_polygon(polygon: &Polygon, mut template: ExtrusionPath, loop_role: ExtrusionLoopRole) -> Self {
        template.polyline = polygon.to_closed_polyline();
        Self::new(vec![template], loop_role)
    }

    pub fn role(&self) -> ExtrusionRole {
        self.paths.first().map(|p| p.role).unwrap_or_default()
    }

    pub fn first_point(&self) -> Point {
        self.paths.first().map(ExtrusionPath::first_point).unwrap_or_default()
    }

    /// The loop closes on its first point.
    pub fn last_point(&self) -> Point {
        self.first_point()
    }

    pub fn length(&self) -> CoordF {
        self.paths.iter().map(ExtrusionPath::length).sum()
    }

    /// Loop vertices without the duplicated closing points.
    pub fn polygon(&self) -> Polygon {
        let mut points = Vec::new();
        for path in &self.paths {
            let n = path.polyline.points.len();
            if n > 1 {
                points.extend_from_slice(&path.polyline.points[..n - 1]);
            }
        }
        Polygon::from_points(points)
    }

    pub fn is_counter_clockwise(&self) -> bool {
        self.polygon().is_counter_clockwise()
    }

    /// Reverse the direction of travel around the loop.
    pub fn reverse(&mut self) {
        for path in &mut self.paths {
            path.reverse();
        }
        self.paths.reverse();
    }

    /// Returns true when the loop had to be reversed.
    pub fn make_counter_clockwise(&mut self) -> bool {
        let was_cw = !self.is_counter_clockwise();
        if was_cw {
            self.reverse();
        }
        was_cw
    }

    /// Returns true when the loop had to be reversed.
    pub fn make_clockwise(&mut self) -> bool {
        let was_ccw = self.is_counter_clockwise();
        if was_ccw {
            self.reverse();
        }
        was_ccw
    }

    /// Rotate the loop so that it starts at an existing vertex `point`.
    ///
    /// Returns false if no vertex coincides with `point`.
    pub fn split_at_vertex(&mut self, point: &Point) -> bool {
        let found = self.paths.iter().enumerate().find_map(|(path_idx, path)| {
            path.polyline
                .points
                .iter()
                .position(|p| p == point)
                .map(|idx| (path_idx, idx))
        });
        let Some((path_idx, idx)) = found else {
            return false;
        };
        self.split_at_path_vertex(path_idx, idx);
        true
    }

    fn split_at_path_vertex(&mut self, path_idx: usize, idx: usize) {
        if self.paths.len() == 1 {
            let polygon = self.paths[0].polyline.to_polygon();
            let start = if polygon.is_empty() { 0 } else { idx % polygon.len() };
            self.paths[0].polyline = polygon.split_at_index(start);
            return;
        }

        let path = &self.paths[path_idx];
        let mut head = path.clone();
        head.polyline.points = path.polyline.points[idx..].to_vec();
        let mut tail = path.clone();
        tail.polyline.points = path.polyline.points[..=idx].to_vec();

        let mut new_paths = Vec::with_capacity(self.paths.len() + 1);
        if head.polyline.is_valid() {
            new_paths.push(head);
        }
        new_paths.extend(self.paths[path_idx + 1..].iter().cloned());
        new_paths.extend(self.paths[..path_idx].iter().cloned());
        if tail.polyline.is_valid() {
            new_paths.push(tail);
        }
        self.paths = new_paths;
    }

    /// Rotate the loop so that it starts at the point of the loop closest to `point`,
    /// inserting a vertex there if needed.
    ///
    /// With `prefer_non_overhang`, paths over air are only considered when the loop
    /// has nothing else.
    pub fn split_at(&mut self, point: &Point, prefer_non_overhang: bool) {
        if self.paths.is_empty() {
            return;
        }
        let mut best: Option<(usize, usize, Point, i128)> = None;
        for pass_overhangs in [false, true] {
            for (path_idx, path) in self.paths.iter().enumerate() {
                if prefer_non_overhang && !pass_overhangs && path.role.is_bridge() {
                    continue;
                }
                for (seg_idx, w) in path.polyline.points.windows(2).enumerate() {
                    let proj = point.project_onto_segment(w[0], w[1]);
                    let d = proj.distance_squared(point);
                    if best.map_or(true, |(_, _, _, bd)| d < bd) {
                        best = Some((path_idx, seg_idx, proj, d));
                    }
                }
            }
            if best.is_some() || !prefer_non_overhang {
                break;
            }
        }
        let Some((path_idx, seg_idx, proj, _)) = best else {
            return;
        };

        // Snap to an existing vertex when close enough.
        let points = &self.paths[path_idx].polyline.points;
        let (a, b) = (points[seg_idx], points[seg_idx + 1]);
        let idx = if proj.coincides_with(&a, SCALED_EPSILON) {
            seg_idx
        } else if proj.coincides_with(&b, SCALED_EPSILON) {
            seg_idx + 1
        } else {
            self.paths[path_idx].polyline.points.insert(seg_idx + 1, proj);
            seg_idx + 1
        };
        self.split_at_path_vertex(path_idx, idx);
    }

    /// Copy of the paths with `distance` (scaled) removed from the end of the loop.
    pub fn clip_end(&self, mut distance: CoordF) -> Vec<ExtrusionPath> {
        let mut paths = self.paths.clone();
        while distance > 0.0 {
            let Some(last) = paths.last_mut() else {
                break;
            };
            let len = last.length();
            if len <= distance {
                paths.pop();
                distance -= len;
            } else {
                last.clip_end(distance);
                break;
            }
        }
        paths
    }
}

/// Nested group of entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionEntityCollection {
    pub entities: Vec<ExtrusionEntity>,
    /// Entities are already in print order and must not be re-chained.
    #[serde(default)]
    pub no_sort: bool,
}

impl ExtrusionEntityCollection {
    pub fn new(entities: Vec<ExtrusionEntity>) -> Self {
        Self {
            entities,
            no_sort: false,
        }
    }

    pub fn ordered(entities: Vec<ExtrusionEntity>) -> Self {
        Self {
            entities,
            no_sort: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn push(&mut self, entity: impl Into<ExtrusionEntity>) {
        self.entities.push(entity.into());
    }

    /// Common role of all members; `Mixed` if they differ, `None` if empty.
    pub fn role(&self) -> ExtrusionRole {
        let mut role = ExtrusionRole::None;
        for entity in &self.entities {
            let r = entity.role();
            if role == ExtrusionRole::None {
                role = r;
            } else if role != r {
                return ExtrusionRole::Mixed;
            }
        }
        role
    }

    /// Number of leaf entities, recursing into nested collections.
    pub fn items_count(&self) -> usize {
        self.entities
            .iter()
            .map(|e| match e {
                ExtrusionEntity::Collection(c) => c.items_count(),
                _ => 1,
            })
            .sum()
    }

    pub fn first_point(&self) -> Point {
        self.entities.first().map(ExtrusionEntity::first_point).unwrap_or_default()
    }

    pub fn last_point(&self) -> Point {
        self.entities.last().map(ExtrusionEntity::last_point).unwrap_or_default()
    }

    /// Flatten nested collections into one level.
    ///
    /// With `preserve_ordering`, nested `no_sort` collections stay wrapped so
    /// their internal order survives a later re-chaining.
    pub fn flatten(&self, preserve_ordering: bool) -> ExtrusionEntityCollection {
        let mut out = ExtrusionEntityCollection {
            entities: Vec::new(),
            no_sort: self.no_sort,
        };
        self.flatten_into(preserve_ordering, &mut out.entities);
        out
    }

    fn flatten_into(&self, preserve_ordering: bool, out: &mut Vec<ExtrusionEntity>) {
        for entity in &self.entities {
            match entity {
                ExtrusionEntity::Collection(c) if preserve_ordering && c.no_sort => {
                    out.push(ExtrusionEntity::Collection(c.flatten(true)));
                }
                ExtrusionEntity::Collection(c) => c.flatten_into(preserve_ordering, out),
                other => out.push(other.clone()),
            }
        }
    }

    /// Greedy nearest-endpoint ordering starting from `start`.
    ///
    /// Reversible entities are flipped when their end is closer. A `no_sort`
    /// collection is returned unchanged.
    pub fn chained_path_from(&self, start: Point) -> ExtrusionEntityCollection {
        if self.no_sort {
            return self.clone();
        }
        let mut remaining: Vec<ExtrusionEntity> = self.entities.clone();
        let mut ordered = Vec::with_capacity(remaining.len());
        let mut current = start;
        while !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_dist = i128::MAX;
            let mut best_reverse = false;
            for (i, entity) in remaining.iter().enumerate() {
                let d = entity.first_point().distance_squared(&current);
                if d < best_dist {
                    best_idx = i;
                    best_dist = d;
                    best_reverse = false;
                }
                if entity.can_reverse() {
                    let d = entity.last_point().distance_squared(&current);
                    if d < best_dist {
                        best_idx = i;
                        best_dist = d;
                        best_reverse = true;
                    }
                }
            }
            let mut entity = remaining.remove(best_idx);
            if best_reverse {
                entity.reverse();
            }
            current = entity.last_point();
            ordered.push(entity);
        }
        ExtrusionEntityCollection {
            entities: ordered,
            no_sort: false,
        }
    }
}

/// Closed variant over every kind of extrusion entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtrusionEntity {
    Path(ExtrusionPath),
    MultiPath(ExtrusionMultiPath),
    Loop(ExtrusionLoop),
    Collection(ExtrusionEntityCollection),
}

impl ExtrusionEntity {
    pub fn role(&self) -> ExtrusionRole {
        match self {
            ExtrusionEntity::Path(p) => p.role,
            ExtrusionEntity::MultiPath(mp) => mp.role(),
            ExtrusionEntity::Loop(l) => l.role(),
            ExtrusionEntity::Collection(c) => c.role(),
        }
    }

    pub fn first_point(&self) -> Point {
        match self {
            ExtrusionEntity::Path(p) => p.first_point(),
            ExtrusionEntity::MultiPath(mp) => mp.first_point(),
            ExtrusionEntity::Loop(l) => l.first_point(),
            ExtrusionEntity::Collection(c) => c.first_point(),
        }
    }

    pub fn last_point(&self) -> Point {
        match self {
            ExtrusionEntity::Path(p) => p.last_point(),
            ExtrusionEntity::MultiPath(mp) => mp.last_point(),
            ExtrusionEntity::Loop(l) => l.last_point(),
            ExtrusionEntity::Collection(c) => c.last_point(),
        }
    }

    pub fn length(&self) -> CoordF {
        match self {
            ExtrusionEntity::Path(p) => p.length(),
            ExtrusionEntity::MultiPath(mp) => mp.length(),
            ExtrusionEntity::Loop(l) => l.length(),
            ExtrusionEntity::Collection(c) => c.entities.iter().map(ExtrusionEntity::length).sum(),
        }
    }

    /// Open paths can be printed in either direction.
    pub fn can_reverse(&self) -> bool {
        matches!(self, ExtrusionEntity::Path(_) | ExtrusionEntity::MultiPath(_))
    }

    pub fn reverse(&mut self) {
        match self {
            ExtrusionEntity::Path(p) => p.reverse(),
            ExtrusionEntity::MultiPath(mp) => mp.reverse(),
            ExtrusionEntity::Loop(l) => l.reverse(),
            ExtrusionEntity::Collection(c) => {
                for e in &mut c.entities {
                    e.reverse();
                }
                c.entities.reverse();
            }
        }
    }

    /// No geometry to extrude.
    pub fn is_empty(&self) -> bool {
        match self {
            ExtrusionEntity::Path(p) => p.is_empty(),
            ExtrusionEntity::MultiPath(mp) => mp.paths.iter().all(ExtrusionPath::is_empty),
            ExtrusionEntity::Loop(l) => l.paths.iter().all(ExtrusionPath::is_empty),
            ExtrusionEntity::Collection(c) => c.entities.iter().all(ExtrusionEntity::is_empty),
        }
    }

    pub fn as_collection(&self) -> Option<&ExtrusionEntityCollection> {
        match self {
            ExtrusionEntity::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Every vertex of the entity, in print order.
    pub fn points(&self) -> Vec<Point> {
        match self {
            ExtrusionEntity::Path(p) => p.polyline.points.clone(),
            ExtrusionEntity::MultiPath(mp) => mp.paths.iter().flat_map(|p| p.polyline.points.iter().copied()).collect(),
            ExtrusionEntity::Loop(l) => l.paths.iter().flat_map(|p| p.polyline.points.iter().copied()).collect(),
            ExtrusionEntity::Collection(c) => c.entities.iter().flat_map(ExtrusionEntity::points).collect(),
        }
    }
}

impl From<ExtrusionPath> for ExtrusionEntity {
    fn from(p: ExtrusionPath) -> Self {
        ExtrusionEntity::Path(p)
    }
}

impl From<ExtrusionMultiPath> for ExtrusionEntity {
    fn from(mp: ExtrusionMultiPath) -> Self {
        ExtrusionEntity::MultiPath(mp)
    }
}

impl From<ExtrusionLoop> for ExtrusionEntity {
    fn from(l: ExtrusionLoop) -> Self {
        ExtrusionEntity::Loop(l)
    }
}

impl From<ExtrusionEntityCollection> for ExtrusionEntity {
    fn from(c: ExtrusionEntityCollection) -> Self {
        ExtrusionEntity::Collection(c)
    }
}
