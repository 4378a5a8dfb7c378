//! Extrusion grouping for one print height.
//!
//! Layers of all objects sharing a `print_z` are paired up ([`LayerToPrint`]),
//! then their extrusions are grouped by extruder, object, island and region
//! ([`ObjectByExtruder`]). The emitter walks the resulting [`LayerPlan`] one
//! extruder at a time so that each extruder is activated at most once per
//! layer.
//!
//! Buckets borrow the entities from the print; nothing here mutates them.

use std::borrow::Cow;
use std::collections::BTreeMap;

use log::warn;

use super::export::{ExportWarning, WarningLevel};
use crate::config::PrintConfig;
use crate::extrusion::{ExtrusionEntity, ExtrusionEntityCollection, ExtrusionRole};
use crate::geometry::Point;
use crate::print::{EntityKind, Layer, LayerTools, Print, PrintObject, SupportLayer};
use crate::{CoordF, Error, Result, EPSILON};

/// An object layer and/or a support layer of one object at one height.
#[derive(Debug, Clone, Copy)]
pub struct LayerToPrint<'a> {
    pub object_idx: usize,
    pub object: &'a PrintObject,
    pub object_layer: Option<&'a Layer>,
    pub support_layer: Option<&'a SupportLayer>,
}

impl<'a> LayerToPrint<'a> {
    /// Print height; the object layer wins when both are present.
    pub fn print_z(&self) -> CoordF {
        match (self.object_layer, self.support_layer) {
            (Some(l), _) => l.print_z,
            (None, Some(s)) => s.print_z,
            (None, None) => 0.0,
        }
    }

    pub fn height(&self) -> CoordF {
        match (self.object_layer, self.support_layer) {
            (Some(l), _) => l.height,
            (None, Some(s)) => s.height,
            (None, None) => 0.0,
        }
    }

    pub fn bottom_z(&self) -> CoordF {
        self.print_z() - self.height()
    }

    /// 0-based index of the layer within its object stack.
    pub fn layer_id(&self) -> usize {
        match (self.object_layer, self.support_layer) {
            (Some(l), _) => l.id,
            (None, Some(s)) => s.id,
            (None, None) => 0,
        }
    }

    pub fn has_extrusions(&self) -> bool {
        self.object_layer.is_some_and(Layer::has_extrusions)
            || self.support_layer.is_some_and(SupportLayer::has_extrusions)
    }
}

/// Pair the object layers of `object` with its support layers by height.
///
/// Fails when the very first layer has nothing to extrude (unless empty layers
/// are allowed). A layer with extrusions floating above the previous extruding
/// layer is reported through `warnings`.
pub fn collect_object_layers<'a>(
    object_idx: usize,
    object: &'a PrintObject,
    config: &PrintConfig,
    warnings: &mut Vec<ExportWarning>,
) -> Result<Vec<LayerToPrint<'a>>> {
    let mut out: Vec<LayerToPrint<'a>> =
        Vec::with_capacity(object.layers.len() + object.support_layers.len());
    let mut idx_object = 0;
    let mut idx_support = 0;
    let mut last_extrusion_z: Option<CoordF> = None;

    while idx_object < object.layers.len() || idx_support < object.support_layers.len() {
        let mut object_layer = object.layers.get(idx_object);
        let mut support_layer = object.support_layers.get(idx_support);
        if object_layer.is_some() {
            idx_object += 1;
        }
        if support_layer.is_some() {
            idx_support += 1;
        }
        if let (Some(ol), Some(sl)) = (object_layer, support_layer) {
            if ol.print_z < sl.print_z - EPSILON {
                support_layer = None;
                idx_support -= 1;
            } else if sl.print_z < ol.print_z - EPSILON {
                object_layer = None;
                idx_object -= 1;
            }
        }
        let ltp = LayerToPrint {
            object_idx,
            object,
            object_layer,
            support_layer,
        };
        out.push(ltp);

        let has_extrusions = ltp.has_extrusions();
        if out.len() == 1 && !has_extrusions && !config.allow_empty_layers {
            return Err(Error::EmptyFirstLayer(object.name.clone()));
        }

        // Empty support layers are allowed, the support generator may produce
        // no extrusions for non-empty support regions.
        if ltp.object_layer.is_some_and(Layer::has_extrusions) || ltp.support_layer.is_some() {
            let extra_gap = object.support_contact_distance.max(0.0);
            let maximal_print_z = last_extrusion_z.unwrap_or(0.0) + ltp.height() + extra_gap;
            if has_extrusions && ltp.print_z() > maximal_print_z + 2.0 * EPSILON {
                let message = format!(
                    "Empty layer between {:.3} and {:.3}. Object name: {}",
                    last_extrusion_z.unwrap_or(0.0),
                    ltp.print_z(),
                    object.name
                );
                warn!("{}", message);
                warnings.push(ExportWarning::new(WarningLevel::Critical, message));
            }
            if has_extrusions {
                last_extrusion_z = Some(ltp.print_z());
            }
        }
    }
    Ok(out)
}

/// Layers of every object, merged by print height (ascending).
///
/// Heights closer than `EPSILON` are merged and get their average `print_z`.
/// Within one height the entries are sorted by object index.
pub fn collect_layers_to_print<'a>(
    print: &'a Print,
    config: &PrintConfig,
    warnings: &mut Vec<ExportWarning>,
) -> Result<Vec<(CoordF, Vec<LayerToPrint<'a>>)>> {
    let mut ordering: Vec<LayerToPrint<'a>> = Vec::new();
    for (idx, object) in print.objects.iter().enumerate() {
        ordering.extend(collect_object_layers(idx, object, config, warnings)?);
    }
    ordering.sort_by(|a, b| a.print_z().total_cmp(&b.print_z()));

    let mut merged = Vec::new();
    let mut i = 0;
    while i < ordering.len() {
        let zmax = ordering[i].print_z() + EPSILON;
        let mut j = i + 1;
        while j < ordering.len() && ordering[j].print_z() <= zmax {
            j += 1;
        }
        let print_z = 0.5 * (ordering[i].print_z() + ordering[j - 1].print_z());
        let mut layers = ordering[i..j].to_vec();
        layers.sort_by_key(|l| l.object_idx);
        merged.push((print_z, layers));
        i = j;
    }
    Ok(merged)
}

/// Per-copy extruder assignment of a bucket entry (see
/// [`crate::print::WipingExtrusions::get_extruder_overrides`]).
pub type ExtruderPerCopy = Vec<i32>;

/// An entity together with its per-copy override, if any.
pub type BucketEntry<'a> = (&'a ExtrusionEntity, Option<ExtruderPerCopy>);

/// Extrusions of one region within one island.
#[derive(Debug, Clone, Default)]
pub struct Region<'a> {
    pub perimeters: Vec<BucketEntry<'a>>,
    pub infills: Vec<BucketEntry<'a>>,
    pub ironings: Vec<BucketEntry<'a>>,
}

impl<'a> Region<'a> {
    fn bucket_mut(&mut self, kind: EntityKind) -> &mut Vec<BucketEntry<'a>> {
        match kind {
            EntityKind::Perimeter => &mut self.perimeters,
            EntityKind::Infill => &mut self.infills,
            EntityKind::Ironing => &mut self.ironings,
        }
    }

    pub fn bucket(&self, kind: EntityKind) -> &[BucketEntry<'a>] {
        match kind {
            EntityKind::Perimeter => &self.perimeters,
            EntityKind::Infill => &self.infills,
            EntityKind::Ironing => &self.ironings,
        }
    }

    /// Append the island collection `island` (wrapped in `entity`).
    ///
    /// A sortable collection is unpacked so its members can be re-chained
    /// together with the rest of the region; a `no_sort` one stays whole.
    fn append(
        &mut self,
        kind: EntityKind,
        entity: &'a ExtrusionEntity,
        island: Option<&'a ExtrusionEntityCollection>,
        overrides: Option<&ExtruderPerCopy>,
    ) {
        let bucket = self.bucket_mut(kind);
        match island {
            Some(island) if !island.no_sort => {
                bucket.extend(island.entities.iter().map(|e| (e, overrides.cloned())));
            }
            _ => bucket.push((entity, overrides.cloned())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.perimeters.is_empty() && self.infills.is_empty() && self.ironings.is_empty()
    }

    fn has_overrides(&self) -> bool {
        [&self.perimeters, &self.infills, &self.ironings]
            .iter()
            .any(|bucket| bucket.iter().any(|(_, o)| o.is_some()))
    }

    pub fn entity_count(&self) -> usize {
        self.perimeters.len() + self.infills.len() + self.ironings.len()
    }
}

/// Extrusions of one island (slice) of a layer, indexed by region.
#[derive(Debug, Clone, Default)]
pub struct Island<'a> {
    pub by_region: Vec<Region<'a>>,
}

impl<'a> Island<'a> {
    pub fn is_empty(&self) -> bool {
        self.by_region.iter().all(Region::is_empty)
    }

    /// Regions filtered for copy `copy` printed by `extruder`.
    ///
    /// With `wiping`, only entries whose copy is overridden to `extruder`;
    /// otherwise only entries printed normally by `extruder`.
    pub fn by_region_per_copy(&self, copy: usize, extruder: u16, wiping: bool) -> Cow<'_, [Region<'a>]> {
        if !self.by_region.iter().any(Region::has_overrides) {
            return if wiping {
                Cow::Owned(Vec::new())
            } else {
                Cow::Borrowed(&self.by_region)
            };
        }
        let extruder = i32::from(extruder);
        let keep = |overrides: &Option<ExtruderPerCopy>| -> bool {
            let per_copy = overrides.as_ref().and_then(|o| o.get(copy).copied());
            if wiping {
                per_copy == Some(extruder)
            } else {
                match (overrides, per_copy) {
                    (None, _) => true,
                    (Some(_), value) => value == Some(-extruder - 1),
                }
            }
        };
        let filter = |bucket: &[BucketEntry<'a>]| -> Vec<BucketEntry<'a>> {
            bucket.iter().filter(|(_, o)| keep(o)).cloned().collect()
        };
        Cow::Owned(
            self.by_region
                .iter()
                .map(|region| Region {
                    perimeters: filter(&region.perimeters),
                    infills: filter(&region.infills),
                    ironings: filter(&region.ironings),
                })
                .collect(),
        )
    }
}

/// Everything one object prints with one extruder on one layer.
#[derive(Debug, Clone, Default)]
pub struct ObjectByExtruder<'a> {
    pub support: Option<&'a ExtrusionEntityCollection>,
    /// `Mixed` when base and interface share the extruder.
    pub support_extrusion_role: ExtrusionRole,
    pub islands: Vec<Island<'a>>,
}

impl<'a> ObjectByExtruder<'a> {
    pub fn is_empty(&self) -> bool {
        self.support.is_none() && self.islands.iter().all(Island::is_empty)
    }
}

/// One copy of an object to print with the current extruder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceToPrint {
    /// Index into the layer's [`LayerToPrint`] list.
    pub layer_idx: usize,
    pub instance_id: usize,
}

/// The grouping of one print height.
#[derive(Debug, Default)]
pub struct LayerPlan<'a> {
    /// Indexed by 0-based extruder; each vector is indexed like the layer list.
    pub by_extruder: BTreeMap<u16, Vec<ObjectByExtruder<'a>>>,
    pub is_anything_overridden: bool,
}

impl<'a> LayerPlan<'a> {
    /// Group the extrusions of `layers` for the extruders of `layer_tools`.
    pub fn build(
        print: &'a Print,
        config: &PrintConfig,
        layers: &[LayerToPrint<'a>],
        layer_tools: &LayerTools,
    ) -> Self {
        let mut plan = LayerPlan {
            by_extruder: BTreeMap::new(),
            is_anything_overridden: layer_tools.wiping.is_anything_overridden(),
        };
        let Some(&first_extruder) = layer_tools.extruders.first() else {
            return plan;
        };
        let n_layers = layers.len();

        for (layer_idx, ltp) in layers.iter().enumerate() {
            if let Some(support_layer) = ltp.support_layer {
                plan.add_support(config, layer_tools, first_extruder, layer_idx, n_layers, ltp.object, support_layer);
            }
            if let Some(layer) = ltp.object_layer {
                plan.add_object_layer(print, layer_tools, layer_idx, n_layers, ltp, layer);
            }
        }
        plan
    }

    fn object_by_extruder(&mut self, extruder: u16, layer_idx: usize, n_layers: usize) -> &mut ObjectByExtruder<'a> {
        let objects = self
            .by_extruder
            .entry(extruder)
            .or_insert_with(|| vec![ObjectByExtruder::default(); n_layers]);
        &mut objects[layer_idx]
    }

    #[allow(clippy::too_many_arguments)]
    fn add_support(
        &mut self,
        config: &PrintConfig,
        layer_tools: &LayerTools,
        first_extruder: u16,
        layer_idx: usize,
        n_layers: usize,
        object: &PrintObject,
        support_layer: &'a SupportLayer,
    ) {
        let fills = &support_layer.support_fills;
        if fills.is_empty() {
            return;
        }
        let role = fills.role();
        let has_support = matches!(role, ExtrusionRole::Mixed | ExtrusionRole::SupportMaterial);
        let has_interface = matches!(role, ExtrusionRole::Mixed | ExtrusionRole::SupportMaterialInterface);

        // Don't care: print with the active extruder, preferably a non-soluble one.
        let mut dontcare = first_extruder;
        if config.extruder(dontcare as usize).soluble {
            if let Some(&e) = layer_tools
                .extruders
                .iter()
                .find(|&&e| !config.extruder(e as usize).soluble)
            {
                dontcare = e;
            }
        }
        let resolve = |configured: u16| if configured == 0 { dontcare } else { configured - 1 };
        let support_extruder = resolve(object.support_material_extruder);
        let interface_extruder = resolve(object.support_material_interface_extruder);

        // Same extruder: the interface may be interleaved with the base.
        let single_extruder = !has_support || support_extruder == interface_extruder;
        let base = if has_support { support_extruder } else { interface_extruder };
        let obj = self.object_by_extruder(base, layer_idx, n_layers);
        obj.support = Some(fills);
        obj.support_extrusion_role = if single_extruder {
            ExtrusionRole::Mixed
        } else {
            ExtrusionRole::SupportMaterial
        };
        if !single_extruder && has_interface {
            let obj = self.object_by_extruder(interface_extruder, layer_idx, n_layers);
            obj.support = Some(fills);
            obj.support_extrusion_role = ExtrusionRole::SupportMaterialInterface;
        }
    }

    fn add_object_layer(
        &mut self,
        print: &Print,
        layer_tools: &LayerTools,
        layer_idx: usize,
        n_layers: usize,
        ltp: &LayerToPrint<'a>,
        layer: &'a Layer,
    ) {
        let n_slices = layer.slices.len();
        let bboxes = layer.slice_bboxes();
        // Smallest islands first, so nested islands are tested before their parents.
        let mut test_order: Vec<usize> = (0..n_slices).collect();
        test_order.sort_by(|&i, &j| bboxes[i].area().total_cmp(&bboxes[j].area()));
        let island_of = |p: Point| -> usize {
            test_order
                .iter()
                .copied()
                .find(|&i| {
                    let bbox = &bboxes[i];
                    p.x >= bbox.min.x
                        && p.x < bbox.max.x
                        && p.y >= bbox.min.y
                        && p.y < bbox.max.y
                        && layer.slices[i].contour.contains_point(&p)
                })
                .unwrap_or(n_slices)
        };
        let n_copies = ltp.object.instances.len();
        let n_regions = print.regions.len().max(layer.regions.len());

        for (region_id, layerm) in layer.regions.iter().enumerate() {
            let region = print.region(region_id);
            let kinds = [
                (EntityKind::Infill, &layerm.fills),
                (EntityKind::Perimeter, &layerm.perimeters),
                (EntityKind::Ironing, &layerm.ironings),
            ];
            for (kind, list) in kinds {
                for (index, entity) in list.entities.iter().enumerate() {
                    // Bare entities outside an island collection form an island of their own.
                    let island = entity.as_collection();
                    let empty = match island {
                        Some(island) => island.is_empty(),
                        None => entity.is_empty(),
                    };
                    if empty {
                        continue;
                    }
                    let mut correct = layer_tools.entity_extruder(entity, &region);
                    if !layer_tools.has_extruder(correct) {
                        // The ideal extruder was pruned from this layer.
                        if let Some(&last) = layer_tools.extruders.last() {
                            correct = last;
                        }
                    }

                    let overrides = if self.is_anything_overridden {
                        layer_tools.wiping.get_extruder_overrides(
                            ltp.object_idx,
                            region_id,
                            kind,
                            index,
                            correct,
                            n_copies,
                        )
                    } else {
                        None
                    };
                    let mut printing_extruders: Vec<u16> = match &overrides {
                        None => vec![correct],
                        Some(per_copy) => per_copy
                            .iter()
                            .map(|&e| if e >= 0 { e as u16 } else { (-e - 1) as u16 })
                            .collect(),
                    };
                    printing_extruders.sort_unstable();
                    printing_extruders.dedup();

                    let island_idx = island_of(entity.first_point());
                    for extruder in printing_extruders {
                        let obj = self.object_by_extruder(extruder, layer_idx, n_layers);
                        if obj.islands.len() < n_slices + 1 {
                            obj.islands.resize_with(n_slices + 1, Island::default);
                        }
                        let target = &mut obj.islands[island_idx];
                        if target.by_region.is_empty() {
                            target.by_region.resize_with(n_regions, Region::default);
                        }
                        target.by_region[region_id].append(kind, entity, island, overrides.as_ref());
                    }
                }
            }
        }
    }

    /// Objects printed by `extruder`, indexed like the layer list.
    pub fn objects(&self, extruder: u16) -> Option<&[ObjectByExtruder<'a>]> {
        self.by_extruder.get(&extruder).map(Vec::as_slice)
    }

    /// Copies to visit with `extruder`, object by object.
    pub fn instances_to_print(&self, extruder: u16, layers: &[LayerToPrint<'a>]) -> Vec<InstanceToPrint> {
        let Some(objects) = self.objects(extruder) else {
            return Vec::new();
        };
        objects
            .iter()
            .enumerate()
            .filter(|(_, obj)| !obj.is_empty())
            .flat_map(|(layer_idx, _)| {
                let copies = layers.get(layer_idx).map_or(0, |l| l.object.instances.len());
                (0..copies).map(move |instance_id| InstanceToPrint {
                    layer_idx,
                    instance_id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrusion::ExtrusionPath;
    use crate::geometry::ExPolygon;
    use crate::print::{LayerRegion, PrintInstance, PrintRegion};

    fn island_at(x: f64, role: ExtrusionRole, n: usize) -> ExtrusionEntityCollection {
        let mut coll = ExtrusionEntityCollection::default();
        for i in 0..n {
            let y = i as f64;
            coll.push(ExtrusionPath::from_points(
                vec![Point::new_scale(x, y), Point::new_scale(x + 1.0, y)],
                role,
                0.45,
                0.2,
            ));
        }
        coll
    }

    fn square(x: f64, size: f64) -> ExPolygon {
        ExPolygon::rectangle(Point::new_scale(x, -1.0), Point::new_scale(x + size, size))
    }

    fn two_island_object() -> PrintObject {
        let mut region = LayerRegion::default();
        region.perimeters.push(island_at(0.5, ExtrusionRole::ExternalPerimeter, 2));
        region.perimeters.push(island_at(20.5, ExtrusionRole::ExternalPerimeter, 1));
        region.fills.push(island_at(0.5, ExtrusionRole::InternalInfill, 3));
        region.fills.push(island_at(50.0, ExtrusionRole::InternalInfill, 1));
        let layer = Layer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            slices: vec![square(0.0, 10.0), square(20.0, 10.0)],
            regions: vec![region],
        };
        let mut object = PrintObject::new("part");
        object.layers.push(layer);
        object
    }

    fn tools(extruders: Vec<u16>) -> LayerTools {
        LayerTools {
            extruders,
            has_object: true,
            ..LayerTools::new(0.2)
        }
    }

    #[test]
    fn test_pairs_support_and_object_layers() {
        let mut object = two_island_object();
        object.support_layers.push(SupportLayer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            support_fills: island_at(40.0, ExtrusionRole::SupportMaterial, 1),
            support_islands: Vec::new(),
        });
        object.support_layers.push(SupportLayer {
            id: 1,
            print_z: 0.35,
            height: 0.15,
            support_fills: island_at(40.0, ExtrusionRole::SupportMaterial, 1),
            support_islands: Vec::new(),
        });
        let mut warnings = Vec::new();
        let layers = collect_object_layers(0, &object, &PrintConfig::default(), &mut warnings).unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers[0].object_layer.is_some() && layers[0].support_layer.is_some());
        assert!(layers[1].object_layer.is_none());
        assert!((layers[1].print_z() - 0.35).abs() < 1e-12);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_empty_first_layer_is_fatal() {
        let mut object = PrintObject::new("ghost");
        object.layers.push(Layer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            ..Default::default()
        });
        let mut warnings = Vec::new();
        let err = collect_object_layers(0, &object, &PrintConfig::default(), &mut warnings).unwrap_err();
        assert!(matches!(err, Error::EmptyFirstLayer(ref name) if name == "ghost"));

        let mut config = PrintConfig::default();
        config.allow_empty_layers = true;
        assert!(collect_object_layers(0, &object, &config, &mut warnings).is_ok());
    }

    #[test]
    fn test_floating_layer_warns() {
        let mut object = two_island_object();
        let mut high = object.layers[0].clone();
        high.id = 1;
        high.print_z = 1.0;
        object.layers.push(high);
        let mut warnings = Vec::new();
        let layers = collect_object_layers(0, &object, &PrintConfig::default(), &mut warnings).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarningLevel::Critical);
        assert!(warnings[0].message.contains("part"));
    }

    #[test]
    fn test_merges_close_heights_across_objects() {
        let a = two_island_object();
        let mut b = two_island_object();
        b.name = "other".into();
        b.layers[0].print_z = 0.20005;
        let print = Print {
            objects: vec![a, b],
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let merged = collect_layers_to_print(&print, &PrintConfig::default(), &mut warnings).unwrap();
        assert_eq!(merged.len(), 1);
        assert!((merged[0].0 - 0.200025).abs() < 1e-9);
        assert_eq!(merged[0].1.iter().map(|l| l.object_idx).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_plan_assigns_islands_and_catch_all() {
        let object = two_island_object();
        let print = Print {
            objects: vec![object],
            regions: vec![PrintRegion {
                perimeter_extruder: 1,
                infill_extruder: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: Some(&print.objects[0].layers[0]),
            support_layer: None,
        }];
        let plan = LayerPlan::build(&print, &PrintConfig::default(), &layers, &tools(vec![0, 1]));

        let perimeters = &plan.objects(0).unwrap()[0];
        assert_eq!(perimeters.islands.len(), 3);
        assert_eq!(perimeters.islands[0].by_region[0].perimeters.len(), 2);
        assert_eq!(perimeters.islands[1].by_region[0].perimeters.len(), 1);
        assert!(perimeters.islands[0].by_region[0].infills.is_empty());

        let infill = &plan.objects(1).unwrap()[0];
        assert_eq!(infill.islands[0].by_region[0].infills.len(), 3);
        // Infill outside every slice lands in the catch-all island.
        assert_eq!(infill.islands[2].by_region[0].infills.len(), 1);
    }

    #[test]
    fn test_plan_covers_every_entity_once() {
        let object = two_island_object();
        let print = Print {
            objects: vec![object],
            ..Default::default()
        };
        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: Some(&print.objects[0].layers[0]),
            support_layer: None,
        }];
        let plan = LayerPlan::build(&print, &PrintConfig::default(), &layers, &tools(vec![0]));
        let total: usize = plan
            .by_extruder
            .values()
            .flatten()
            .flat_map(|o| o.islands.iter())
            .flat_map(|i| i.by_region.iter())
            .map(Region::entity_count)
            .sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_bare_entities_are_planned() {
        let mut object = two_island_object();
        let region = &mut object.layers[0].regions[0];
        region.perimeters.push(ExtrusionPath::from_points(
            vec![Point::new_scale(21.0, 5.0), Point::new_scale(25.0, 5.0)],
            ExtrusionRole::Perimeter,
            0.45,
            0.2,
        ));
        region.fills.push(ExtrusionPath::from_points(
            vec![Point::new_scale(2.0, 5.0), Point::new_scale(6.0, 5.0)],
            ExtrusionRole::InternalInfill,
            0.45,
            0.2,
        ));
        let print = Print {
            objects: vec![object],
            regions: vec![PrintRegion {
                perimeter_extruder: 1,
                infill_extruder: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: Some(&print.objects[0].layers[0]),
            support_layer: None,
        }];
        let plan = LayerPlan::build(&print, &PrintConfig::default(), &layers, &tools(vec![0, 1]));

        let perimeters = &plan.objects(0).unwrap()[0];
        assert_eq!(perimeters.islands[1].by_region[0].perimeters.len(), 2);
        let infill = &plan.objects(1).unwrap()[0];
        assert_eq!(infill.islands[0].by_region[0].infills.len(), 4);
    }

    #[test]
    fn test_pruned_extruder_falls_back_to_last() {
        let object = two_island_object();
        let print = Print {
            objects: vec![object],
            regions: vec![PrintRegion {
                perimeter_extruder: 3,
                infill_extruder: 3,
                ..Default::default()
            }],
            ..Default::default()
        };
        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: Some(&print.objects[0].layers[0]),
            support_layer: None,
        }];
        let plan = LayerPlan::build(&print, &PrintConfig::default(), &layers, &tools(vec![0, 1]));
        assert!(plan.objects(2).is_none());
        assert!(plan.objects(1).is_some());
        assert!(plan.objects(0).is_none());
    }

    #[test]
    fn test_support_dontcare_prefers_non_soluble() {
        let mut object = PrintObject::new("s");
        let mut fills = island_at(0.0, ExtrusionRole::SupportMaterial, 1);
        fills.push(ExtrusionPath::from_points(
            vec![Point::new_scale(0.0, 5.0), Point::new_scale(1.0, 5.0)],
            ExtrusionRole::SupportMaterialInterface,
            0.45,
            0.2,
        ));
        object.support_layers.push(SupportLayer {
            id: 0,
            print_z: 0.2,
            height: 0.2,
            support_fills: fills,
            support_islands: Vec::new(),
        });
        object.support_material_interface_extruder = 3;
        let print = Print {
            objects: vec![object],
            ..Default::default()
        };
        let mut config = PrintConfig::default();
        config.extruders = vec![Default::default(); 3];
        config.extruders[0].soluble = true;

        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: None,
            support_layer: Some(&print.objects[0].support_layers[0]),
        }];
        let plan = LayerPlan::build(&print, &config, &layers, &tools(vec![0, 1, 2]));
        let base = &plan.objects(1).unwrap()[0];
        assert_eq!(base.support_extrusion_role, ExtrusionRole::SupportMaterial);
        let interface = &plan.objects(2).unwrap()[0];
        assert_eq!(interface.support_extrusion_role, ExtrusionRole::SupportMaterialInterface);
        assert!(plan.objects(0).is_none());
    }

    #[test]
    fn test_overrides_split_wiping_and_normal_passes() {
        let mut object = two_island_object();
        object.instances = vec![PrintInstance::default(), PrintInstance::default()];
        let print = Print {
            objects: vec![object],
            ..Default::default()
        };
        let layers = vec![LayerToPrint {
            object_idx: 0,
            object: &print.objects[0],
            object_layer: Some(&print.objects[0].layers[0]),
            support_layer: None,
        }];
        let mut lt = tools(vec![0, 1]);
        // Copy 1 of the first infill island purges extruder 1.
        lt.wiping.set_extruder_override(0, 0, EntityKind::Infill, 0, 1, 1, 2);
        let plan = LayerPlan::build(&print, &PrintConfig::default(), &layers, &lt);
        assert!(plan.is_anything_overridden);

        let island = &plan.objects(1).unwrap()[0].islands[0];
        let wiping = island.by_region_per_copy(1, 1, true);
        assert_eq!(wiping[0].infills.len(), 3);
        assert!(island.by_region_per_copy(0, 1, true)[0].infills.is_empty());

        let island0 = &plan.objects(0).unwrap()[0].islands[0];
        assert_eq!(island0.by_region_per_copy(0, 0, false)[0].infills.len(), 3);
        assert!(island0.by_region_per_copy(1, 0, false)[0].infills.is_empty());
        // Perimeters carry no override and stay in the normal pass of every copy.
        assert_eq!(island0.by_region_per_copy(1, 0, false)[0].perimeters.len(), 2);

        let instances = plan.instances_to_print(0, &layers);
        assert_eq!(instances.len(), 2);
    }
}
