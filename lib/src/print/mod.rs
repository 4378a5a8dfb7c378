//! Print data model consumed by the G-code pipeline.
//!
//! Everything here is produced upstream (slicing, perimeter/infill/support
//! generation, tool ordering, wipe tower planning) and only read by the
//! exporter. All types are `serde` so that a prepared print can be loaded from
//! JSON.
//!
//! Extruder ids in region and object settings are 1-based, with 0 meaning
//! "default" (regions) or "don't care" (support). Ids in [`LayerTools`] and
//! everywhere inside the G-code pipeline are 0-based.

pub mod tool_ordering;
pub mod wipe_tower;

pub use tool_ordering::{
    CustomGCode, CustomGCodeKind, EntityKind, ExtruderOverride, LayerTools, ToolOrdering,
    WipingExtrusions,
};
pub use wipe_tower::{ToolChangeResult, WipeTowerData};

use crate::clipper;
use crate::extrusion::ExtrusionEntityCollection;
use crate::geometry::{BoundingBox, ExPolygon, Point, Polyline};
use crate::{CoordF, EPSILON};
use serde::{Deserialize, Serialize};

/// Settings of one print region (one material/print-setting combination).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintRegion {
    /// 1-based extruder for perimeters.
    pub perimeter_extruder: u16,
    /// 1-based extruder for sparse infill.
    pub infill_extruder: u16,
    /// 1-based extruder for solid infill.
    pub solid_infill_extruder: u16,
    /// Print the infill of this region before its perimeters.
    pub infill_first: bool,
    /// Nozzle temperature override for this region (0 = none).
    pub print_temperature: i32,
    /// Number of solid bottom layers.
    pub bottom_solid_layers: usize,
    /// Total number of perimeters.
    pub perimeters: usize,
    /// Internal infill density (0-100).
    pub fill_density: CoordF,
}

impl Default for PrintRegion {
    fn default() -> Self {
        Self {
            perimeter_extruder: 1,
            infill_extruder: 1,
            solid_infill_extruder: 1,
            infill_first: false,
            print_temperature: 0,
            bottom_solid_layers: 3,
            perimeters: 2,
            fill_density: 20.0,
        }
    }
}

/// Extrusions of one region on one layer.
///
/// Every entry of `perimeters`, `fills` and `ironings` is itself a collection
/// holding the extrusions of a single island.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerRegion {
    pub perimeters: ExtrusionEntityCollection,
    pub fills: ExtrusionEntityCollection,
    pub ironings: ExtrusionEntityCollection,
    /// Internal (sparse infill) surfaces, used to skip retraction over infill.
    pub internal_slices: Vec<ExPolygon>,
}

impl LayerRegion {
    pub fn has_extrusions(&self) -> bool {
        !self.perimeters.is_empty() || !self.fills.is_empty() || !self.ironings.is_empty()
    }
}

/// One object layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// 0-based index within the object.
    pub id: usize,
    pub print_z: CoordF,
    pub height: CoordF,
    /// Islands of this layer.
    #[serde(default)]
    pub slices: Vec<ExPolygon>,
    /// Indexed like [`Print::regions`].
    #[serde(default)]
    pub regions: Vec<LayerRegion>,
}

impl Layer {
    pub fn bottom_z(&self) -> CoordF {
        self.print_z - self.height
    }

    pub fn has_extrusions(&self) -> bool {
        self.regions.iter().any(LayerRegion::has_extrusions)
    }

    pub fn slice_bboxes(&self) -> Vec<BoundingBox> {
        self.slices.iter().map(ExPolygon::bounding_box).collect()
    }

    /// Travel fully hidden inside sparse infill of a single region.
    pub fn any_internal_region_slice_contains(&self, travel: &Polyline) -> bool {
        self.regions
            .iter()
            .any(|r| clipper::contains_polyline(&r.internal_slices, travel))
    }
}

/// One support layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportLayer {
    pub id: usize,
    pub print_z: CoordF,
    pub height: CoordF,
    #[serde(default)]
    pub support_fills: ExtrusionEntityCollection,
    /// Areas covered by support, for retraction-free travel.
    #[serde(default)]
    pub support_islands: Vec<ExPolygon>,
}

impl SupportLayer {
    pub fn bottom_z(&self) -> CoordF {
        self.print_z - self.height
    }

    pub fn has_extrusions(&self) -> bool {
        !self.support_fills.is_empty()
    }

    pub fn islands_contain(&self, travel: &Polyline) -> bool {
        clipper::contains_polyline(&self.support_islands, travel)
    }
}

/// One placed copy of an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintInstance {
    /// Offset of the copy on the bed (scaled).
    pub shift: Point,
}

/// An object with its layers and placed copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintObject {
    pub name: String,
    pub instances: Vec<PrintInstance>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub support_layers: Vec<SupportLayer>,
    /// 1-based support base extruder; 0 = don't care.
    #[serde(default)]
    pub support_material_extruder: u16,
    /// 1-based support interface extruder; 0 = don't care.
    #[serde(default)]
    pub support_material_interface_extruder: u16,
    /// Gap between the top of the support and the object (mm).
    #[serde(default)]
    pub support_contact_distance: CoordF,
    #[serde(default)]
    pub raft_layers: usize,
    #[serde(default)]
    pub brim_width: CoordF,
}

impl PrintObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: vec![PrintInstance::default()],
            layers: Vec::new(),
            support_layers: Vec::new(),
            support_material_extruder: 0,
            support_material_interface_extruder: 0,
            support_contact_distance: 0.0,
            raft_layers: 0,
            brim_width: 0.0,
        }
    }

    /// Height of the lowest layer, object or support.
    pub fn first_layer_height(&self) -> CoordF {
        let object = self.layers.first().map(|l| l.print_z);
        let support = self.support_layers.first().map(|l| l.print_z);
        match (object, support) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 0.0,
        }
    }

    pub fn max_print_z(&self) -> CoordF {
        let object = self.layers.last().map_or(0.0, |l| l.print_z);
        let support = self.support_layers.last().map_or(0.0, |l| l.print_z);
        object.max(support)
    }
}

/// The whole prepared print.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Print {
    pub objects: Vec<PrintObject>,
    #[serde(default)]
    pub regions: Vec<PrintRegion>,
    /// Skirt loops, outermost last.
    #[serde(default)]
    pub skirt: ExtrusionEntityCollection,
    /// Distinct first-layer skirt, if any.
    #[serde(default)]
    pub skirt_first_layer: Option<ExtrusionEntityCollection>,
    #[serde(default)]
    pub brim: ExtrusionEntityCollection,
    #[serde(default)]
    pub tool_ordering: ToolOrdering,
    #[serde(default)]
    pub wipe_tower: Option<WipeTowerData>,
}

impl Print {
    pub fn has_skirt(&self) -> bool {
        !self.skirt.is_empty() || self.skirt_first_layer.as_ref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_brim(&self) -> bool {
        !self.brim.is_empty()
    }

    pub fn has_wipe_tower(&self) -> bool {
        self.wipe_tower.is_some()
    }

    /// Region settings, falling back to defaults for regions the print does not describe.
    pub fn region(&self, idx: usize) -> PrintRegion {
        self.regions.get(idx).cloned().unwrap_or_default()
    }

    /// Check internal consistency before export.
    pub fn validate(&self) -> crate::Result<()> {
        for object in &self.objects {
            if object.instances.is_empty() {
                return Err(crate::Error::Geometry(format!(
                    "object '{}' has no instances",
                    object.name
                )));
            }
            for pair in object.layers.windows(2) {
                if pair[1].print_z <= pair[0].print_z - EPSILON {
                    return Err(crate::Error::Geometry(format!(
                        "object '{}' layers are not sorted by height",
                        object.name
                    )));
                }
            }
            for pair in object.support_layers.windows(2) {
                if pair[1].print_z <= pair[0].print_z - EPSILON {
                    return Err(crate::Error::Geometry(format!(
                        "object '{}' support layers are not sorted by height",
                        object.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrusion::{ExtrusionPath, ExtrusionRole};

    fn layer(id: usize, z: f64) -> Layer {
        Layer {
            id,
            print_z: z,
            height: 0.2,
            ..Default::default()
        }
    }

    #[test]
    fn test_layer_bottom_z() {
        let l = layer(0, 0.2);
        assert!(l.bottom_z().abs() < 1e-12);
        assert!(!l.has_extrusions());
    }

    #[test]
    fn test_internal_slice_containment() {
        let mut l = layer(1, 0.4);
        l.regions.push(LayerRegion {
            internal_slices: vec![ExPolygon::rectangle(
                Point::new_scale(0.0, 0.0),
                Point::new_scale(10.0, 10.0),
            )],
            ..Default::default()
        });
        let inside = Polyline::from_points(vec![Point::new_scale(1.0, 1.0), Point::new_scale(9.0, 9.0)]);
        let outside = Polyline::from_points(vec![Point::new_scale(1.0, 1.0), Point::new_scale(19.0, 9.0)]);
        assert!(l.any_internal_region_slice_contains(&inside));
        assert!(!l.any_internal_region_slice_contains(&outside));
    }

    #[test]
    fn test_first_layer_height_prefers_lowest() {
        let mut obj = PrintObject::new("cube");
        obj.layers.push(layer(0, 0.3));
        obj.support_layers.push(SupportLayer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            ..Default::default()
        });
        assert!((obj.first_layer_height() - 0.2).abs() < 1e-12);
        assert!((obj.max_print_z() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_unsorted_layers() {
        let mut obj = PrintObject::new("cube");
        obj.layers.push(layer(0, 0.4));
        obj.layers.push(layer(1, 0.2));
        let print = Print {
            objects: vec![obj],
            ..Default::default()
        };
        assert!(print.validate().is_err());
    }

    #[test]
    fn test_print_from_json_defaults() {
        let json = r#"{"objects":[{"name":"a","instances":[{"shift":{"x":0,"y":0}}]}]}"#;
        let print: Print = serde_json::from_str(json).unwrap();
        assert_eq!(print.objects.len(), 1);
        assert!(!print.has_skirt());
        assert_eq!(print.region(3).perimeter_extruder, 1);
    }

    #[test]
    fn test_has_skirt_first_layer_only() {
        let mut print = Print::default();
        let mut skirt = ExtrusionEntityCollection::default();
        skirt.push(ExtrusionPath::from_points(
            vec![Point::new(0, 0), Point::new(10, 0)],
            ExtrusionRole::Skirt,
            0.45,
            0.2,
        ));
        print.skirt_first_layer = Some(skirt);
        assert!(print.has_skirt());
    }
}
