//! Per-layer extruder scheduling.
//!
//! A [`ToolOrdering`] lists, for every distinct print height, the extruders
//! that will be active and in which order, plus per-entity extruder overrides
//! used when tool changes purge into object infill or perimeters.

use super::{Print, PrintRegion};
use crate::extrusion::{ExtrusionEntity, ExtrusionEntityCollection, ExtrusionRole};
use crate::CoordF;
use serde::{Deserialize, Serialize};

/// Two print heights closer than this are the same layer.
pub const LAYER_HEIGHT_EPSILON: CoordF = 1e-4;

/// Kind of a custom G-code event scheduled at a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomGCodeKind {
    ColorChange,
    PausePrint,
    Custom,
    Template,
}

/// Custom G-code event to run before a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomGCode {
    pub print_z: CoordF,
    pub kind: CustomGCodeKind,
    /// 1-based extruder for color changes; 0 = current.
    #[serde(default)]
    pub extruder: u16,
    #[serde(default)]
    pub color: String,
    /// Pause message or literal custom G-code.
    #[serde(default)]
    pub extra: String,
}

impl CustomGCode {
    pub fn color_change(print_z: CoordF, extruder: u16, color: &str) -> Self {
        Self {
            print_z,
            kind: CustomGCodeKind::ColorChange,
            extruder,
            color: color.to_string(),
            extra: String::new(),
        }
    }

    pub fn pause(print_z: CoordF, message: &str) -> Self {
        Self {
            print_z,
            kind: CustomGCodeKind::PausePrint,
            extruder: 0,
            color: String::new(),
            extra: message.to_string(),
        }
    }

    pub fn custom(print_z: CoordF, gcode: &str) -> Self {
        Self {
            print_z,
            kind: CustomGCodeKind::Custom,
            extruder: 0,
            color: String::new(),
            extra: gcode.to_string(),
        }
    }
}

/// Which island list of a [`super::LayerRegion`] an override refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Perimeter,
    Infill,
    Ironing,
}

/// Per-copy extruder assignment of one island collection.
///
/// `per_copy[i]` is the 0-based extruder that prints copy `i`, or -1 when the
/// copy keeps its regular extruder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtruderOverride {
    pub object: usize,
    pub region: usize,
    pub kind: EntityKind,
    /// Index of the island collection within the region list.
    pub index: usize,
    pub per_copy: Vec<i32>,
}

/// Extrusions repurposed to absorb purge material on this layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WipingExtrusions {
    #[serde(default)]
    pub overrides: Vec<ExtruderOverride>,
}

impl WipingExtrusions {
    pub fn is_anything_overridden(&self) -> bool {
        self.overrides
            .iter()
            .any(|o| o.per_copy.iter().any(|&e| e >= 0))
    }

    /// Assign copy `copy` of an island collection to `extruder`.
    pub fn set_extruder_override(
        &mut self,
        object: usize,
        region: usize,
        kind: EntityKind,
        index: usize,
        copy: usize,
        extruder: u16,
        num_copies: usize,
    ) {
        let pos = self.overrides.iter().position(|o| {
            o.object == object && o.region == region && o.kind == kind && o.index == index
        });
        let entry = match pos {
            Some(pos) => &mut self.overrides[pos],
            None => {
                self.overrides.push(ExtruderOverride {
                    object,
                    region,
                    kind,
                    index,
                    per_copy: vec![-1; num_copies],
                });
                let last = self.overrides.len() - 1;
                &mut self.overrides[last]
            }
        };
        if entry.per_copy.len() < num_copies.max(copy + 1) {
            entry.per_copy.resize(num_copies.max(copy + 1), -1);
        }
        entry.per_copy[copy] = i32::from(extruder);
    }

    /// Per-copy extruders for one island collection.
    ///
    /// Copies that are not overridden are encoded as `-correct - 1`, so a
    /// non-negative value means "wiping with this extruder" and a negative one
    /// means "printed normally by `-value - 1`". `None` when nothing of this
    /// collection is overridden.
    pub fn get_extruder_overrides(
        &self,
        object: usize,
        region: usize,
        kind: EntityKind,
        index: usize,
        correct_extruder: u16,
        num_copies: usize,
    ) -> Option<Vec<i32>> {
        let entry = self.overrides.iter().find(|o| {
            o.object == object && o.region == region && o.kind == kind && o.index == index
        })?;
        let mut per_copy = entry.per_copy.clone();
        per_copy.resize(num_copies, -1);
        for e in per_copy.iter_mut() {
            if *e == -1 {
                *e = -i32::from(correct_extruder) - 1;
            }
        }
        Some(per_copy)
    }
}

/// Extruders and events for one synchronized print height.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerTools {
    pub print_z: CoordF,
    pub has_object: bool,
    pub has_support: bool,
    /// 0-based extruders in commit order.
    pub extruders: Vec<u16>,
    /// Forces every extrusion of the layer onto one 1-based extruder (0 = none).
    pub extruder_override: u16,
    pub has_wipe_tower: bool,
    pub wipe_tower_partitions: usize,
    pub wipe_tower_layer_height: CoordF,
    pub custom_gcode: Option<CustomGCode>,
    pub wiping: WipingExtrusions,
}

impl LayerTools {
    pub fn new(print_z: CoordF) -> Self {
        Self {
            print_z,
            ..Default::default()
        }
    }

    pub fn has_extruder(&self, extruder: u16) -> bool {
        self.extruders.contains(&extruder)
    }

    /// Ideal 0-based extruder of an island collection in `region`.
    pub fn extruder(&self, extrusions: &ExtrusionEntityCollection, region: &PrintRegion) -> u16 {
        let solid = extrusions
            .entities
            .first()
            .is_some_and(|e| e.role().is_solid_infill());
        self.extruder_for_role(extrusions.role(), solid, region)
    }

    /// Extruder for an entity stored outside of an island collection.
    pub fn entity_extruder(&self, entity: &ExtrusionEntity, region: &PrintRegion) -> u16 {
        match entity.as_collection() {
            Some(extrusions) => self.extruder(extrusions, region),
            None => self.extruder_for_role(entity.role(), entity.role().is_solid_infill(), region),
        }
    }

    fn extruder_for_role(&self, role: ExtrusionRole, solid: bool, region: &PrintRegion) -> u16 {
        if self.extruder_override != 0 {
            return self.extruder_override - 1;
        }
        let configured = if role.is_infill() {
            if solid {
                region.solid_infill_extruder
            } else {
                region.infill_extruder
            }
        } else {
            region.perimeter_extruder
        };
        configured.saturating_sub(1)
    }
}

/// Extruder plan for the whole print.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOrdering {
    pub layers: Vec<LayerTools>,
    /// 0-based extruder active at print start.
    pub first_extruder: Option<u16>,
    /// Every 0-based extruder used by the print, ascending.
    pub all_extruders: Vec<u16>,
}

impl ToolOrdering {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer tools closest to `print_z`, if within tolerance.
    pub fn tools_for_layer(&self, print_z: CoordF) -> Option<&LayerTools> {
        self.layers
            .iter()
            .min_by(|a, b| {
                let da = (a.print_z - print_z).abs();
                let db = (b.print_z - print_z).abs();
                da.total_cmp(&db)
            })
            .filter(|lt| (lt.print_z - print_z).abs() < LAYER_HEIGHT_EPSILON)
    }

    pub fn last_extruder(&self) -> Option<u16> {
        self.layers.iter().rev().find_map(|lt| lt.extruders.last().copied())
    }

    /// Straightforward plan for a print that arrived without one.
    ///
    /// Collects the configured region and support extruders per print height
    /// and resolves "don't care" support extruders to whatever was last active.
    pub fn from_print(print: &Print) -> Self {
        let mut heights: Vec<CoordF> = Vec::new();
        for object in &print.objects {
            heights.extend(object.layers.iter().map(|l| l.print_z));
            heights.extend(object.support_layers.iter().map(|l| l.print_z));
        }
        heights.sort_by(|a, b| a.total_cmp(b));
        heights.dedup_by(|a, b| (*a - *b).abs() < LAYER_HEIGHT_EPSILON);

        let mut layers: Vec<LayerTools> = heights.into_iter().map(LayerTools::new).collect();
        for object in &print.objects {
            for layer in &object.layers {
                let Some(lt) = find_mut(&mut layers, layer.print_z) else {
                    continue;
                };
                for (region_id, layerm) in layer.regions.iter().enumerate() {
                    let region = print.region(region_id);
                    if !layerm.perimeters.is_empty() {
                        lt.has_object = true;
                        push_unique(&mut lt.extruders, region.perimeter_extruder);
                    }
                    for fill in &layerm.fills.entities {
                        if let Some(coll) = fill.as_collection() {
                            lt.has_object = true;
                            let extruder = lt.extruder(coll, &region) + 1;
                            push_unique(&mut lt.extruders, extruder);
                        }
                    }
                    if !layerm.ironings.is_empty() {
                        lt.has_object = true;
                        push_unique(&mut lt.extruders, region.perimeter_extruder);
                    }
                }
            }
            for support in &object.support_layers {
                if support.support_fills.is_empty() {
                    continue;
                }
                let Some(lt) = find_mut(&mut layers, support.print_z) else {
                    continue;
                };
                lt.has_support = true;
                push_unique(&mut lt.extruders, object.support_material_extruder);
                push_unique(&mut lt.extruders, object.support_material_interface_extruder);
            }
        }

        // Extruders above are 1-based with 0 = don't care.
        let mut ordering = ToolOrdering {
            layers,
            first_extruder: None,
            all_extruders: Vec::new(),
        };
        ordering.handle_dontcare_extruders();
        ordering.collect_extruders();
        ordering
    }

    /// Turn 1-based ids into 0-based ones, replacing "don't care" (0) by the
    /// extruder that is already active so that no extra tool change happens.
    fn handle_dontcare_extruders(&mut self) {
        let first_real = self
            .layers
            .iter()
            .flat_map(|lt| lt.extruders.iter())
            .copied()
            .find(|&e| e > 0)
            .unwrap_or(1);
        let mut last = first_real;
        for lt in &mut self.layers {
            if lt.extruders.is_empty() {
                continue;
            }
            if lt.extruders.len() == 1 && lt.extruders[0] == 0 {
                lt.extruders[0] = last;
            } else {
                lt.extruders.retain(|&e| e != 0);
                lt.extruders.sort_unstable();
                if let Some(pos) = lt.extruders.iter().position(|&e| e == last) {
                    let e = lt.extruders.remove(pos);
                    lt.extruders.insert(0, e);
                }
            }
            if let Some(&e) = lt.extruders.last() {
                last = e;
            }
            for e in lt.extruders.iter_mut() {
                *e -= 1;
            }
        }
    }

    fn collect_extruders(&mut self) {
        let mut all: Vec<u16> = self
            .layers
            .iter()
            .flat_map(|lt| lt.extruders.iter().copied())
            .collect();
        all.sort_unstable();
        all.dedup();
        self.first_extruder = self.layers.iter().find_map(|lt| lt.extruders.first().copied());
        self.all_extruders = all;
    }
}

fn find_mut(layers: &mut [LayerTools], print_z: CoordF) -> Option<&mut LayerTools> {
    layers
        .iter_mut()
        .find(|lt| (lt.print_z - print_z).abs() < LAYER_HEIGHT_EPSILON)
}

fn push_unique(extruders: &mut Vec<u16>, extruder: u16) {
    if !extruders.contains(&extruder) {
        extruders.push(extruder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrusion::{ExtrusionPath, ExtrusionRole};
    use crate::geometry::Point;
    use crate::print::{Layer, LayerRegion, PrintObject, SupportLayer};

    fn island(role: ExtrusionRole) -> ExtrusionEntityCollection {
        let mut coll = ExtrusionEntityCollection::default();
        coll.push(ExtrusionPath::from_points(
            vec![Point::new(0, 0), Point::new(1_000_000, 0)],
            role,
            0.45,
            0.2,
        ));
        coll
    }

    #[test]
    fn test_extruder_for_island_roles() {
        let region = PrintRegion {
            perimeter_extruder: 1,
            infill_extruder: 2,
            solid_infill_extruder: 3,
            ..Default::default()
        };
        let lt = LayerTools::new(0.2);
        assert_eq!(lt.extruder(&island(ExtrusionRole::Perimeter), &region), 0);
        assert_eq!(lt.extruder(&island(ExtrusionRole::InternalInfill), &region), 1);
        assert_eq!(lt.extruder(&island(ExtrusionRole::TopSolidInfill), &region), 2);

        let forced = LayerTools {
            extruder_override: 4,
            ..LayerTools::new(0.2)
        };
        assert_eq!(forced.extruder(&island(ExtrusionRole::Perimeter), &region), 3);
    }

    #[test]
    fn test_overrides_encode_correct_extruder() {
        let mut wiping = WipingExtrusions::default();
        assert!(!wiping.is_anything_overridden());
        wiping.set_extruder_override(0, 0, EntityKind::Infill, 2, 1, 3, 3);
        assert!(wiping.is_anything_overridden());

        let per_copy = wiping
            .get_extruder_overrides(0, 0, EntityKind::Infill, 2, 1, 3)
            .unwrap();
        assert_eq!(per_copy, vec![-2, 3, -2]);
        assert!(wiping
            .get_extruder_overrides(0, 0, EntityKind::Perimeter, 2, 1, 3)
            .is_none());
    }

    #[test]
    fn test_tools_for_layer_tolerance() {
        let ordering = ToolOrdering {
            layers: vec![LayerTools::new(0.2), LayerTools::new(0.4)],
            ..Default::default()
        };
        assert!(ordering.tools_for_layer(0.40001).is_some());
        assert!(ordering.tools_for_layer(0.3).is_none());
    }

    #[test]
    fn test_from_print_resolves_dont_care_support() {
        let mut object = PrintObject::new("a");
        let mut layer = Layer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            ..Default::default()
        };
        let mut region = LayerRegion::default();
        region.perimeters.push(island(ExtrusionRole::ExternalPerimeter));
        region.fills.push(island(ExtrusionRole::InternalInfill));
        layer.regions.push(region);
        object.layers.push(layer);
        object.support_layers.push(SupportLayer {
            id: 0,
            print_z: 0.4,
            height: 0.2,
            support_fills: island(ExtrusionRole::SupportMaterial),
            support_islands: Vec::new(),
        });

        let print = Print {
            objects: vec![object],
            regions: vec![PrintRegion {
                perimeter_extruder: 1,
                infill_extruder: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let ordering = ToolOrdering::from_print(&print);
        assert_eq!(ordering.layers.len(), 2);
        assert_eq!(ordering.layers[0].extruders, vec![0, 1]);
        // Support with "don't care" stays on the last active extruder.
        assert_eq!(ordering.layers[1].extruders, vec![1]);
        assert!(ordering.layers[1].has_support);
        assert_eq!(ordering.first_extruder, Some(0));
        assert_eq!(ordering.all_extruders, vec![0, 1]);
    }
}
