//! Toolpath emission.
//!
//! [`ToolpathEmitter`] turns extrusion entities into G-code text. It owns the
//! [`GCodeWriter`] and every tracker that has to survive from one entity to
//! the next: the last position, the last role and width/height written, the
//! pending wipe path and the leftover of a path that was too short to print
//! on its own.
//!
//! Coordinates inside the emitter are scaled object coordinates. The current
//! origin (the shift of the object copy being printed) is added when a point
//! is handed to the writer, and the nozzle offset of the active tool is
//! subtracted.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use log::{debug, warn};

use super::avoid_crossing::AvoidCrossingPerimeters;
use super::ordering::{LayerToPrint, Region};
use super::retract_crossing::RetractWhenCrossingPerimeters;
use super::seam::{LowerLayerEdges, NearestSeamPlacer, SeamPlacer, SeamRequest};
use super::template::{PlaceholderParser, TemplateContext, TemplateEngine};
use super::wipe::Wipe;
use super::wipe_tower::{check_expected_tool, post_process_moves, splice_placeholders, transform_path};
use super::writer::{format_number, Extruder, GCodeWriter};
use crate::config::{LiftPolicy, PrintConfig};
use crate::extrusion::{
    ExtrusionEntity, ExtrusionEntityCollection, ExtrusionLoop, ExtrusionLoopRole, ExtrusionMultiPath,
    ExtrusionPath, ExtrusionRole,
};
use crate::geometry::{get_extents, BoundingBox, Point, PointF, Polyline};
use crate::print::{Layer, Print, PrintObject, PrintRegion, SupportLayer, ToolChangeResult, WipeTowerData};
use crate::{scaled, unscale, unscaled, CoordF, Result, EPSILON};

/// Flow reduction at external perimeter corners, indexed by the turn angle
/// in degrees from 30 to 144.
pub const CUT_CORNER_TABLE: [CoordF; 115] = [
    0.001537451157993, 0.001699627500179, 0.001873176359929, 0.002058542095754, 0.002256177154906,
    0.002466542444994, 0.002690107718482, 0.002927351970781, 0.003178763852686, 0.003444842097951,
    0.003726095966834, 0.004023045706492, 0.004336223029152, 0.00466617160904, 0.005013447599101,
    0.005378620168593, 0.005762272062727, 0.006165000185567, 0.006587416207474, 0.007030147198493,
    0.007493836289104, 0.007979143359902, 0.008486745761834, 0.009017339068734, 0.00957163786399,
    0.010150376563326, 0.010754310275767, 0.011384215705013, 0.012040892093603, 0.012725162212361,
    0.013437873397832, 0.01417989864057, 0.01495213772733, 0.01575551844043, 0.016590997817786,
    0.017459563477334, 0.018362235009846, 0.019300065444398, 0.020274142791089, 0.021285591665892,
    0.022335575002924, 0.023425295859755, 0.024555999321851, 0.025728974512639, 0.026945556716223,
    0.028207129620272, 0.029515127687218, 0.030871038662503, 0.032276406229305, 0.033732832819934,
    0.035241982594887, 0.036805584601441, 0.038425436124638, 0.040103406244574, 0.041841439615055,
    0.043641560479958, 0.045505876945025, 0.047436585524337, 0.049435975982392, 0.051506436494553,
    0.053650459150638, 0.055870645828676, 0.058169714468295, 0.0605505057759, 0.063015990396837,
    0.065569276592991, 0.068213618467979, 0.070952424786126, 0.073789268435947, 0.076727896593837,
    0.079772241649261, 0.082926432958949, 0.086194809504486, 0.089581933535469, 0.093092605289007,
    0.096731878886046, 0.100505079515854, 0.10441782203221, 0.108476031098559, 0.112685963034856,
    0.117054229536308, 0.121587823453898, 0.126294146848979, 0.131181041559526, 0.136256822544454,
    0.141530314305188, 0.147010890721085, 0.152708518678027, 0.158633805918466, 0.164798053597366,
    0.17121331409307, 0.17789245469658, 0.184849227888721, 0.192098349014236, 0.199655582277462,
    0.207537836118677, 0.215763269187181, 0.224351408310655, 0.233323280075731, 0.242701557887958,
    0.252510726678311, 0.262777267777188, 0.27352986689699, 0.284799648665007, 0.296620441746888,
    0.309029079319231, 0.322065740515038, 0.335774339512048, 0.350202970204428, 0.365404415947691,
    0.381436735764648, 0.398363940736199, 0.416256777189962, 0.435193636891737, 0.455261618934834,
];

const CUT_CORNER_FIRST_ANGLE: i64 = 30;

/// Flow reduction for the corner whose counter-clockwise angle (as returned by
/// [`Point::ccw_angle`]) is `ccw_angle`, or `None` when the turn does not
/// exceed `threshold_deg`.
pub fn corner_cut_coefficient(ccw_angle: CoordF, threshold_deg: CoordF) -> Option<CoordF> {
    let turn = if ccw_angle > PI { ccw_angle - PI } else { PI - ccw_angle };
    let degrees = turn.to_degrees().round() as i64;
    if degrees as CoordF <= threshold_deg {
        return None;
    }
    let last = CUT_CORNER_FIRST_ANGLE + CUT_CORNER_TABLE.len() as i64 - 1;
    let idx = degrees.clamp(CUT_CORNER_FIRST_ANGLE, last) - CUT_CORNER_FIRST_ANGLE;
    Some(CUT_CORNER_TABLE[idx as usize])
}

/// Split a travel so that only its final `tail` (scaled) runs at the print
/// acceleration. Travels shorter than three tails are cut in half.
///
/// The head ends where the tail starts.
pub fn split_for_deceleration(travel: &Polyline, tail: CoordF) -> (Polyline, Polyline) {
    let length = travel.length();
    let split_at = if length > 3.0 * tail { length - tail } else { 0.5 * length };
    let mut head = travel.clone();
    head.clip_end(length - split_at);
    let mut end = travel.clone();
    end.clip_start(split_at);
    (head, end)
}

/// How the feed rate of a path is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedRequest {
    /// Speed configured for the path's role, blended toward the small
    /// perimeter speed when `factor` is below 1.
    Role { factor: CoordF },
    /// Derived from the volumetric speed target.
    Auto,
    /// Explicit speed (mm/s).
    Fixed(CoordF),
}

impl SpeedRequest {
    pub const ROLE: SpeedRequest = SpeedRequest::Role { factor: 1.0 };
}

/// The layer (object and/or support) being printed.
#[derive(Debug, Clone, Copy)]
pub struct LayerContext<'a> {
    pub id: usize,
    pub print_z: CoordF,
    pub height: CoordF,
    pub object_layer: Option<&'a Layer>,
    pub support_layer: Option<&'a SupportLayer>,
}

impl<'a> LayerContext<'a> {
    pub fn bottom_z(&self) -> CoordF {
        self.print_z - self.height
    }
}

impl<'a> From<&LayerToPrint<'a>> for LayerContext<'a> {
    fn from(layer: &LayerToPrint<'a>) -> Self {
        Self {
            id: layer.layer_id(),
            print_z: layer.print_z(),
            height: layer.height(),
            object_layer: layer.object_layer,
            support_layer: layer.support_layer,
        }
    }
}

fn to_gcode(p: Point, origin: PointF, offset: PointF) -> PointF {
    PointF::new(unscale(p.x) + origin.x - offset.x, unscale(p.y) + origin.y - offset.y)
}

/// Single-pass G-code emitter for extrusion entities.
pub struct ToolpathEmitter<'a> {
    config: &'a PrintConfig,
    writer: GCodeWriter,
    templates: Box<dyn TemplateEngine + 'a>,
    seam_placer: Box<dyn SeamPlacer + 'a>,
    wipe: Wipe,
    avoid_crossing: AvoidCrossingPerimeters,
    retract_crossing: RetractWhenCrossingPerimeters,
    /// Edges of the layer below the current object layer, keyed by (object, layer id).
    lower_layer: Option<((usize, usize), LowerLayerEdges)>,
    object_idx: usize,
    object_bbox: Option<BoundingBox>,
    /// Shift of the copy being printed (mm).
    origin: PointF,
    last_pos: Option<Point>,
    last_role: ExtrusionRole,
    /// Role of the last `;TYPE:` tag.
    last_tag_role: ExtrusionRole,
    last_notgapfill_role: ExtrusionRole,
    last_width: CoordF,
    last_height: CoordF,
    last_too_small: Option<ExtrusionPath>,
    layer: Option<LayerContext<'a>>,
    /// Number of layer changes so far minus one.
    layer_index: i64,
    max_layer_z: CoordF,
    enable_loop_clipping: bool,
    enable_cooling_markers: bool,
    vase_loops: bool,
    fill_density: CoordF,
    region_perimeters: usize,
    template_failures: BTreeMap<String, String>,
    toolchange_count: usize,
}

impl<'a> ToolpathEmitter<'a> {
    pub fn new(config: &'a PrintConfig) -> Self {
        Self {
            config,
            writer: GCodeWriter::new(config),
            templates: Box::new(PlaceholderParser::from_config(config)),
            seam_placer: Box::new(NearestSeamPlacer::new(config.seam_position)),
            wipe: Wipe::new(false),
            avoid_crossing: AvoidCrossingPerimeters::new(config.avoid_crossing_max_detour),
            retract_crossing: RetractWhenCrossingPerimeters::new(),
            lower_layer: None,
            object_idx: 0,
            object_bbox: None,
            origin: PointF::default(),
            last_pos: None,
            last_role: ExtrusionRole::None,
            last_tag_role: ExtrusionRole::None,
            last_notgapfill_role: ExtrusionRole::None,
            last_width: 0.0,
            last_height: 0.0,
            last_too_small: None,
            layer: None,
            layer_index: -1,
            max_layer_z: 0.0,
            enable_loop_clipping: true,
            enable_cooling_markers: config.cooling,
            vase_loops: false,
            fill_density: 0.0,
            region_perimeters: config.perimeters,
            template_failures: BTreeMap::new(),
            toolchange_count: 0,
        }
    }

    pub fn with_template_engine(mut self, engine: impl TemplateEngine + 'a) -> Self {
        self.templates = Box::new(engine);
        self
    }

    pub fn with_seam_placer(mut self, placer: impl SeamPlacer + 'a) -> Self {
        self.seam_placer = Box::new(placer);
        self
    }

    pub fn config(&self) -> &'a PrintConfig {
        self.config
    }

    pub fn writer(&self) -> &GCodeWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut GCodeWriter {
        &mut self.writer
    }

    pub fn wipe_mut(&mut self) -> &mut Wipe {
        &mut self.wipe
    }

    pub fn avoid_crossing_mut(&mut self) -> &mut AvoidCrossingPerimeters {
        &mut self.avoid_crossing
    }

    pub fn last_pos(&self) -> Option<Point> {
        self.last_pos
    }

    pub fn set_last_pos(&mut self, pos: Point) {
        self.last_pos = Some(pos);
    }

    pub fn layer_index(&self) -> i64 {
        self.layer_index
    }

    pub fn layer(&self) -> Option<LayerContext<'a>> {
        self.layer
    }

    pub fn set_layer(&mut self, layer: LayerContext<'a>) {
        self.layer = Some(layer);
    }

    pub fn set_enable_loop_clipping(&mut self, enabled: bool) {
        self.enable_loop_clipping = enabled;
    }

    pub fn set_enable_cooling_markers(&mut self, enabled: bool) {
        self.enable_cooling_markers = enabled;
    }

    /// Print external perimeters marked as vase loops with a rising Z.
    pub fn set_vase_loops(&mut self, enabled: bool) {
        self.vase_loops = enabled;
    }

    pub fn toolchange_count(&self) -> usize {
        self.toolchange_count
    }

    /// First error message of every template that failed to render.
    pub fn template_failures(&self) -> &BTreeMap<String, String> {
        &self.template_failures
    }

    pub fn origin(&self) -> PointF {
        self.origin
    }

    /// Move the origin to the copy at `origin` (mm), keeping the tracked
    /// position and the wipe path where they are on the bed.
    pub fn set_origin(&mut self, origin: PointF) {
        let delta = Point::new_scale(self.origin.x - origin.x, self.origin.y - origin.y);
        if let Some(p) = self.last_pos.as_mut() {
            *p += delta;
        }
        if self.wipe.has_path() {
            let mut path = self.wipe.path().clone();
            path.translate(delta);
            self.wipe.set_path(path);
        }
        self.origin = origin;
    }

    /// Select the object (and its current layer) the next extrusions belong to.
    pub fn set_object(&mut self, object_idx: usize, object: &'a PrintObject) {
        self.object_idx = object_idx;
        let layer = self.layer.and_then(|l| l.object_layer);
        self.object_bbox = layer
            .filter(|l| !l.slices.is_empty())
            .map(|l| get_extents(&l.slices));
        let Some(layer) = layer.filter(|l| l.id > 0) else {
            self.lower_layer = None;
            return;
        };
        let key = (object_idx, layer.id);
        if self.lower_layer.as_ref().is_some_and(|(k, _)| *k == key) {
            return;
        }
        self.lower_layer = object
            .layers
            .iter()
            .find(|l| l.id + 1 == layer.id)
            .map(|lower| (key, LowerLayerEdges::new(&lower.slices)));
    }

    fn gcode_origin(&self) -> PointF {
        self.origin + self.config.origin
    }

    fn extruder_offset(&self) -> PointF {
        self.writer
            .tool_id()
            .map_or_else(PointF::default, |id| self.config.extruder(id as usize).extruder_offset)
    }

    pub fn point_to_gcode(&self, p: Point) -> PointF {
        to_gcode(p, self.gcode_origin(), self.extruder_offset())
    }

    pub fn gcode_to_point(&self, p: PointF) -> Point {
        let origin = self.gcode_origin();
        let offset = self.extruder_offset();
        Point::new_scale(p.x - origin.x + offset.x, p.y - origin.y + offset.y)
    }

    fn current_pos(&self) -> Point {
        self.last_pos
            .unwrap_or_else(|| self.gcode_to_point(self.writer.position()))
    }

    fn on_first_layer(&self) -> bool {
        self.layer.is_some_and(|l| l.id == 0)
    }

    fn layer_z(&self) -> CoordF {
        self.layer.map_or(0.0, |l| l.print_z)
    }

    fn nozzle_diameter(&self) -> CoordF {
        let id = self.writer.tool_id().unwrap_or(0);
        self.config.extruder(id as usize).nozzle_diameter
    }

    /// Render a custom G-code template.
    ///
    /// A failure is logged, remembered and embedded in the output between
    /// marker comments so the stream stays valid.
    pub fn render_template(&mut self, name: &str, template: &str, ctx: &TemplateContext) -> String {
        if template.is_empty() {
            return String::new();
        }
        match self.templates.render(name, template, ctx) {
            Ok(mut text) => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text
            }
            Err(err) => {
                warn!("{}", err);
                self.template_failures
                    .entry(name.to_string())
                    .or_insert_with(|| err.message.clone());
                format!(
                    "\n!!!!! Failed to process the custom G-code template {name}\n{}\n!!!!! End of an error report for the custom G-code template {name}\n\n",
                    err.message
                )
            }
        }
    }

    /// Variables shared by every custom G-code template.
    pub fn template_context(&self) -> TemplateContext {
        TemplateContext::new()
            .with("layer_num", self.layer_index + 1)
            .with("layer_z", self.layer_z())
            .with("max_layer_z", self.max_layer_z)
    }

    // ------------------------------------------------------------------
    // Speeds
    // ------------------------------------------------------------------

    fn role_speed(&self, role: ExtrusionRole) -> CoordF {
        let c = self.config;
        match role {
            ExtrusionRole::Perimeter => c.perimeter_speed,
            ExtrusionRole::ExternalPerimeter => c.external_perimeter_speed.get_abs_value(c.perimeter_speed),
            ExtrusionRole::OverhangPerimeter => c.overhangs_speed.get_abs_value(c.perimeter_speed),
            ExtrusionRole::BridgeInfill => c.bridge_speed,
            ExtrusionRole::InternalBridgeInfill => c.bridge_speed_internal.get_abs_value(c.bridge_speed),
            ExtrusionRole::InternalInfill => c.infill_speed,
            ExtrusionRole::SolidInfill => c.solid_infill_speed.get_abs_value(c.infill_speed),
            ExtrusionRole::TopSolidInfill => c
                .top_solid_infill_speed
                .get_abs_value(c.solid_infill_speed.get_abs_value(c.infill_speed)),
            ExtrusionRole::ThinWall => c.thin_walls_speed,
            ExtrusionRole::GapFill => c.gap_fill_speed,
            ExtrusionRole::Ironing => c.ironing_speed,
            ExtrusionRole::Skirt => c.brim_speed,
            ExtrusionRole::SupportMaterial => c.support_material_speed,
            ExtrusionRole::SupportMaterialInterface => c
                .support_material_interface_speed
                .get_abs_value(c.support_material_speed),
            ExtrusionRole::Milling => c.milling_speed,
            ExtrusionRole::None | ExtrusionRole::WipeTower | ExtrusionRole::Custom | ExtrusionRole::Mixed => 0.0,
        }
    }

    /// Speed derived from the volumetric target, honoring roles configured
    /// as a percentage.
    fn volumetric_role_speed(&self, role: ExtrusionRole, volumetric: CoordF) -> CoordF {
        let c = self.config;
        let relative = match role {
            ExtrusionRole::ExternalPerimeter => Some(c.external_perimeter_speed),
            ExtrusionRole::OverhangPerimeter => Some(c.overhangs_speed),
            ExtrusionRole::InternalBridgeInfill => Some(c.bridge_speed_internal),
            ExtrusionRole::SolidInfill => Some(c.solid_infill_speed),
            ExtrusionRole::TopSolidInfill => Some(c.top_solid_infill_speed),
            ExtrusionRole::SupportMaterialInterface => Some(c.support_material_interface_speed),
            _ => None,
        };
        match relative {
            Some(fop) if fop.percent => fop.get_abs_value(volumetric),
            _ => volumetric,
        }
    }

    /// Feed rate (mm/s) of `path`.
    ///
    /// Role and volumetric resolution come first, then the first layer cap,
    /// the volumetric ceilings and filament limits, which only ever lower the
    /// speed. The first layer minimum is applied last.
    pub fn compute_speed(&self, path: &ExtrusionPath, request: SpeedRequest) -> CoordF {
        let c = self.config;
        let mut speed = match request {
            SpeedRequest::Fixed(v) => v,
            SpeedRequest::Auto => 0.0,
            SpeedRequest::Role { factor } => {
                let mut speed = self.role_speed(path.role);
                if factor < 1.0 && !path.role.is_bridge() {
                    let small = c.small_perimeter_speed.get_abs_value(c.perimeter_speed);
                    if small > 0.0 {
                        speed = speed * factor + (1.0 - factor) * small;
                    }
                }
                speed
            }
        };

        if speed == 0.0 && c.volumetric_speed > 0.0 && path.mm3_per_mm > 0.0 {
            let mut volumetric = c.volumetric_speed / path.mm3_per_mm;
            if c.max_print_speed > 0.0 {
                volumetric = volumetric.min(c.max_print_speed);
            }
            speed = self.volumetric_role_speed(path.role, volumetric);
        }
        if speed == 0.0 {
            speed = c.max_print_speed;
        }

        let first_layer = self.on_first_layer();
        if first_layer {
            let cap = if path.role.is_infill() && c.first_layer_infill_speed.value > 0.0 {
                c.first_layer_infill_speed.get_abs_value(speed)
            } else {
                c.first_layer_speed.get_abs_value(speed)
            };
            if cap > 0.0 {
                speed = speed.min(cap);
            }
        }

        if c.max_volumetric_speed > 0.0 && path.mm3_per_mm > 0.0 {
            speed = speed.min(c.max_volumetric_speed / path.mm3_per_mm);
        }
        let ext = c.extruder(self.writer.tool_id().unwrap_or(0) as usize);
        if ext.filament_max_volumetric_speed > 0.0 && path.mm3_per_mm > 0.0 {
            speed = speed.min(ext.filament_max_volumetric_speed / path.mm3_per_mm);
        }
        if ext.filament_max_speed > 0.0 {
            speed = speed.min(ext.filament_max_speed);
        }

        if first_layer && c.first_layer_min_speed > 0.0 {
            speed = speed.max(c.first_layer_min_speed);
        }
        speed
    }

    fn print_acceleration(&self, role: ExtrusionRole) -> CoordF {
        let c = self.config;
        if self.on_first_layer() && c.first_layer_acceleration > 0.0 {
            c.first_layer_acceleration
        } else if role.is_perimeter() && c.perimeter_acceleration > 0.0 {
            c.perimeter_acceleration
        } else if matches!(role, ExtrusionRole::BridgeInfill | ExtrusionRole::InternalBridgeInfill)
            && c.bridge_acceleration > 0.0
        {
            c.bridge_acceleration
        } else if role.is_infill() && c.infill_acceleration > 0.0 {
            c.infill_acceleration
        } else {
            c.default_acceleration
        }
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Dispatch on the entity kind.
    pub fn extrude_entity(&mut self, entity: &ExtrusionEntity, description: &str, speed: SpeedRequest) -> String {
        match entity {
            ExtrusionEntity::Path(path) => self.extrude_path(path, description, speed),
            ExtrusionEntity::MultiPath(multipath) => self.extrude_multipath(multipath, description, speed),
            ExtrusionEntity::Loop(extrusion_loop) => self.extrude_loop(extrusion_loop, description, speed),
            ExtrusionEntity::Collection(collection) => self.extrude_collection(collection, description, speed),
        }
    }

    /// Members in stored order for `no_sort` or mixed collections, otherwise
    /// chained from the current position.
    pub fn extrude_collection(
        &mut self,
        collection: &ExtrusionEntityCollection,
        description: &str,
        speed: SpeedRequest,
    ) -> String {
        let mut out = String::new();
        if collection.no_sort || collection.role() == ExtrusionRole::Mixed {
            for entity in &collection.entities {
                out.push_str(&self.extrude_entity(entity, description, speed));
            }
        } else {
            let chained = collection.chained_path_from(self.current_pos());
            for entity in &chained.entities {
                out.push_str(&self.extrude_entity(entity, description, speed));
            }
        }
        out
    }

    pub fn extrude_multipath(&mut self, multipath: &ExtrusionMultiPath, description: &str, speed: SpeedRequest) -> String {
        let mut out = String::new();
        for path in &multipath.paths {
            out.push_str(&self.extrude_path(path, description, speed));
        }
        self.writer.set_acceleration(self.config.default_acceleration);
        out
    }

    /// Extrude one open path.
    ///
    /// With a positive `min_length`, a leftover shorter than it is merged into
    /// the next path starting next to it, and a path still too short after
    /// simplification is held back.
    pub fn extrude_path(&mut self, path: &ExtrusionPath, description: &str, speed: SpeedRequest) -> String {
        if !path.polyline.is_valid() {
            return String::new();
        }
        let mut path = path.clone();
        let min_length = scaled(self.config.min_length);
        if min_length > 0.0 {
            if let Some(small) = self.last_too_small.take() {
                if small.last_point().distance(&path.first_point()) < min_length {
                    let (a, b) = (small.length(), path.length());
                    if a + b > 0.0 {
                        path.height = (small.height * a + path.height * b) / (a + b);
                        path.mm3_per_mm = (small.mm3_per_mm * a + path.mm3_per_mm * b) / (a + b);
                    }
                    let mut polyline = small.polyline;
                    polyline.append(&path.polyline);
                    path.polyline = polyline;
                } else {
                    debug!("dropping a {:.4} mm leftover", unscaled(small.length()));
                }
            }
            path.polyline.simplify(min_length / 10.0);
            path.polyline.remove_short_segments(min_length);
            if path.length() < min_length {
                self.last_too_small = Some(path);
                return String::new();
            }
        }

        let out = self.extrude(&path, description, speed);
        if self.wipe.enabled {
            self.wipe.set_path(path.polyline.reversed());
        }
        self.writer.set_acceleration(self.config.default_acceleration);
        out
    }

    /// Extrude a closed loop starting at its seam.
    pub fn extrude_loop(&mut self, original: &ExtrusionLoop, description: &str, speed: SpeedRequest) -> String {
        let c = self.config;
        if self.vase_loops && original.is_vase && original.role() == ExtrusionRole::ExternalPerimeter {
            let min_height = c.extruder(self.writer.tool_id().unwrap_or(0) as usize).min_layer_height;
            if self
                .layer
                .is_some_and(|l| l.id > 0 && l.height >= 2.0 * min_height - EPSILON)
            {
                return self.extrude_loop_vase(original, description, speed);
            }
        }

        let mut extrusion_loop = original.clone();
        if c.spiral_vase {
            extrusion_loop.make_counter_clockwise();
            extrusion_loop.is_hole = false;
        }
        let last_pos = self.current_pos();
        let nozzle = self.nozzle_diameter();
        if extrusion_loop.loop_role == ExtrusionLoopRole::Skirt || c.spiral_vase {
            extrusion_loop.split_at(&last_pos, false);
        } else {
            let request = SeamRequest {
                last_pos,
                nozzle_diameter: nozzle,
                object_idx: self.object_idx,
                object_bbox: self.object_bbox,
                layer_id: self.layer.map_or(0, |l| l.id),
                lower_layer: self.lower_layer.as_ref().map(|(_, edges)| edges),
            };
            let seam = self.seam_placer.place_seam(&extrusion_loop, &request);
            if !extrusion_loop.split_at_vertex(&seam) {
                extrusion_loop.split_at(&seam, true);
            }
        }
        let clockwise = !extrusion_loop.is_counter_clockwise();

        let clip = if self.enable_loop_clipping {
            scaled(c.seam_gap.get_abs_value(nozzle))
        } else {
            0.0
        };
        let paths = extrusion_loop.clip_end(clip);
        if paths.is_empty() {
            return String::new();
        }

        let speed = match speed {
            SpeedRequest::Role { .. } if extrusion_loop.role().is_perimeter() => {
                let length = unscaled(extrusion_loop.length());
                let min = c.small_perimeter_min_length.get_abs_value(nozzle);
                let max = c.small_perimeter_max_length.get_abs_value(nozzle);
                if length <= min {
                    SpeedRequest::Role { factor: 0.0 }
                } else if length <= max && max > min {
                    SpeedRequest::Role {
                        factor: (length - min) / (max - min),
                    }
                } else {
                    speed
                }
            }
            other => other,
        };

        let mut out = String::new();
        for path in paths.iter().filter(|p| p.polyline.len() > 1) {
            out.push_str(&self.extrude_path(path, description, speed));
        }
        self.writer.set_acceleration(c.default_acceleration);
        if self.wipe.enabled {
            self.wipe.set_path(paths[0].polyline.clone());
        }

        // Tuck the nozzle inside the loop before travelling away from the seam.
        let (Some(front), Some(back)) = (paths.first(), paths.last()) else {
            return out;
        };
        if back.role == ExtrusionRole::ExternalPerimeter
            && self.layer.is_some()
            && self.region_perimeters > 1
            && front.polyline.len() >= 2
            && back.polyline.len() >= 3
        {
            let start = front.polyline.points[0];
            let mut a = front.polyline.points[1];
            let mut b = back.polyline.points[back.polyline.len() - 3];
            if clockwise {
                std::mem::swap(&mut a, &mut b);
            }
            let mut angle = start.ccw_angle(&a, &b) / 3.0;
            if clockwise {
                angle = -angle;
            }
            let p1 = start.to_f64();
            let p2 = front.polyline.points[1].to_f64();
            let v = p2 - p1;
            let l2 = v.x * v.x + v.y * v.y;
            let target = if nozzle * nozzle >= l2 {
                front.polyline.points[1]
            } else {
                (p1 + v * (nozzle / l2.sqrt())).to_scaled()
            };
            let target = target.rotate_around(angle, start);
            let gcode = self.point_to_gcode(target);
            out.push_str(&self.writer.travel_to_xy(gcode, "move inwards before travel"));
        }
        out
    }

    /// Continuous-Z rendition of an external perimeter loop: one pass rising
    /// from the previous layer with growing flow, then one pass at the layer
    /// height with shrinking flow.
    fn extrude_loop_vase(&mut self, original: &ExtrusionLoop, description: &str, speed: SpeedRequest) -> String {
        let c = self.config;
        let Some(layer) = self.layer else {
            return String::new();
        };
        let mut extrusion_loop = original.clone();
        extrusion_loop.make_counter_clockwise();
        extrusion_loop.split_at(&self.current_pos(), false);
        let nozzle = self.nozzle_diameter();
        let paths = if self.enable_loop_clipping {
            extrusion_loop.clip_end(scaled(c.seam_gap.get_abs_value(nozzle)))
        } else {
            extrusion_loop.paths.clone()
        };
        let total: CoordF = paths.iter().map(ExtrusionPath::length).sum();
        if paths.is_empty() || total <= 0.0 {
            return String::new();
        }

        let min_height = c.extruder(self.writer.tool_id().unwrap_or(0) as usize).min_layer_height;
        let height = layer.height;
        let bottom = layer.bottom_z() + c.z_offset;
        let top = layer.print_z + c.z_offset;
        let e_per_mm3 = if self.writer.tool_is_extruder() {
            self.writer.tool().map_or(0.0, Extruder::e_per_mm3)
        } else {
            0.0
        };
        let descr = if description.is_empty() { original.role().name() } else { description };

        let mut out = String::new();
        for rising in [true, false] {
            let mut done = 0.0;
            for path in &paths {
                out.push_str(&self.before_extrude(path, descr, speed));
                let e_per_mm_per_height = if path.height > 0.0 {
                    path.mm3_per_mm / path.height * e_per_mm3
                } else {
                    0.0
                };
                for line in path.polyline.lines() {
                    if line.a == line.b {
                        continue;
                    }
                    let length = line.length();
                    let sections = (unscaled(length) / nozzle).ceil().max(1.0) as usize;
                    for i in 1..=sections {
                        let t = i as CoordF / sections as CoordF;
                        let frac = (done + length * t) / total;
                        let ramp = frac * (height - 2.0 * min_height);
                        let (z, flow_height) = if rising {
                            (bottom + min_height + ramp, min_height + ramp)
                        } else {
                            (top, height - min_height - ramp)
                        };
                        let de = e_per_mm_per_height * unscaled(length) / sections as CoordF * flow_height;
                        let target = self.point_to_gcode(line.point_at(t));
                        out.push_str(&self.writer.extrude_to_xyz(target, z, de, descr));
                    }
                    done += length;
                }
                out.push_str(&self.after_extrude(path));
            }
        }
        self.writer.set_acceleration(c.default_acceleration);
        out
    }

    /// Support extrusions of `fills` whose role matches `role` (`Mixed` for both).
    pub fn extrude_support(&mut self, fills: &ExtrusionEntityCollection, role: ExtrusionRole) -> String {
        let mut out = String::new();
        let chained = fills.chained_path_from(self.current_pos());
        for entity in &chained.entities {
            if let ExtrusionEntity::Collection(nested) = entity {
                out.push_str(&self.extrude_support(nested, role));
                continue;
            }
            let entity_role = entity.role();
            if role != ExtrusionRole::Mixed && entity_role != role {
                continue;
            }
            let label = if entity_role == ExtrusionRole::SupportMaterialInterface {
                "support material interface"
            } else {
                "support material"
            };
            out.push_str(&self.extrude_entity(entity, label, SpeedRequest::ROLE));
        }
        out
    }

    /// Switch to the settings of `region`; returns the temperature change, if any.
    fn apply_region(&mut self, region: &PrintRegion) -> String {
        self.fill_density = region.fill_density;
        self.region_perimeters = region.perimeters;
        let Some(id) = self.writer.tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let temperature = if region.print_temperature > 0 {
            region.print_temperature
        } else if self.on_first_layer() {
            ext.first_layer_temperature
        } else {
            ext.temperature
        };
        if temperature > 0 {
            self.writer.set_temperature(temperature, false, Some(id))
        } else {
            String::new()
        }
    }

    pub fn extrude_perimeters(&mut self, print: &Print, regions: &[Region<'_>]) -> String {
        let mut out = String::new();
        for (idx, region) in regions.iter().enumerate() {
            if region.perimeters.is_empty() {
                continue;
            }
            out.push_str(&self.apply_region(&print.region(idx)));
            for (entity, _) in &region.perimeters {
                out.push_str(&self.extrude_entity(entity, "perimeter", SpeedRequest::ROLE));
            }
        }
        out
    }

    /// Infill of the regions whose `infill_first` equals `infill_first`.
    pub fn extrude_infill(&mut self, print: &Print, regions: &[Region<'_>], infill_first: bool) -> String {
        let mut out = String::new();
        for (idx, region) in regions.iter().enumerate() {
            let settings = print.region(idx);
            if region.infills.is_empty() || settings.infill_first != infill_first {
                continue;
            }
            out.push_str(&self.apply_region(&settings));
            let chained = ExtrusionEntityCollection::new(region.infills.iter().map(|(e, _)| (*e).clone()).collect())
                .chained_path_from(self.current_pos());
            for entity in &chained.entities {
                out.push_str(&self.extrude_entity(entity, "infill", SpeedRequest::ROLE));
            }
        }
        out
    }

    pub fn extrude_ironing(&mut self, print: &Print, regions: &[Region<'_>]) -> String {
        let mut out = String::new();
        for (idx, region) in regions.iter().enumerate() {
            if region.ironings.is_empty() {
                continue;
            }
            out.push_str(&self.apply_region(&print.region(idx)));
            let chained =
                ExtrusionEntityCollection::new(region.ironings.iter().map(|(e, _)| (*e).clone()).collect())
                    .chained_path_from(self.current_pos());
            for entity in &chained.entities {
                out.push_str(&self.extrude_entity(entity, "ironing", SpeedRequest::ROLE));
            }
        }
        out
    }

    fn extrude(&mut self, path: &ExtrusionPath, description: &str, speed: SpeedRequest) -> String {
        let c = self.config;
        let descr = if description.is_empty() { path.role.name() } else { description };
        let mut out = self.before_extrude(path, descr, speed);

        let mut e_per_mm = path.mm3_per_mm * self.writer.tool().map_or(0.0, Extruder::e_per_mm3);
        if self.layer.is_some_and(|l| l.bottom_z() < EPSILON) {
            e_per_mm *= c.first_layer_flow_ratio;
        }
        if !self.writer.tool_is_extruder() {
            e_per_mm = 0.0;
        }

        if path.role != ExtrusionRole::ExternalPerimeter || c.external_perimeter_cut_corners <= 0.0 {
            for line in path.polyline.lines() {
                if line.a == line.b {
                    continue;
                }
                let target = self.point_to_gcode(line.b);
                out.push_str(&self.writer.extrude_to_xy(target, e_per_mm * unscaled(line.length()), descr));
            }
        } else {
            out.push_str(&self.extrude_cut_corners(path, e_per_mm, descr));
        }

        out.push_str(&self.after_extrude(path));
        out
    }

    /// Lines of an external perimeter with the flow reduced right after sharp corners.
    fn extrude_cut_corners(&mut self, path: &ExtrusionPath, e_per_mm: CoordF, descr: &str) -> String {
        let c = self.config;
        let strength = c.external_perimeter_cut_corners / 100.0;
        let width = path.width;
        let mut out = String::new();
        let mut previous: Option<Point> = None;
        for line in path.polyline.lines() {
            if line.a == line.b {
                continue;
            }
            let length = unscaled(line.length());
            let coeff = previous
                .and_then(|prev| corner_cut_coefficient(line.a.ccw_angle(&prev, &line.b), c.corner_cut_threshold))
                .map(|coeff| coeff * strength);
            previous = Some(line.a);

            let Some(coeff) = coeff else {
                let target = self.point_to_gcode(line.b);
                out.push_str(&self.writer.extrude_to_xy(target, e_per_mm * length, descr));
                continue;
            };
            let length1 = width / 4.0;
            let length2 = width / 2.0;
            if length > length1 {
                let p1 = self.point_to_gcode(line.point_at_distance(scaled(length1)));
                out.push_str(&self.writer.extrude_to_xy(p1, e_per_mm * length1 * (1.0 - 2.0 * coeff), descr));
                let rest = length - length1;
                if rest > length2 {
                    let p2 = self.point_to_gcode(line.point_at_distance(scaled(length1 + length2)));
                    out.push_str(&self.writer.extrude_to_xy(p2, e_per_mm * length2 * (1.0 - coeff), descr));
                    let end = self.point_to_gcode(line.b);
                    out.push_str(&self.writer.extrude_to_xy(end, e_per_mm * (rest - length2), descr));
                } else {
                    let mult = (1.0 - coeff * (length2 / rest)).max(0.1);
                    let end = self.point_to_gcode(line.b);
                    out.push_str(&self.writer.extrude_to_xy(end, e_per_mm * rest * mult, descr));
                }
            } else {
                let mult = (1.0 - coeff * (width / length)).max(0.1);
                let end = self.point_to_gcode(line.b);
                out.push_str(&self.writer.extrude_to_xy(end, e_per_mm * length * mult, descr));
            }
        }
        out
    }

    fn before_extrude(&mut self, path: &ExtrusionPath, descr: &str, speed: SpeedRequest) -> String {
        let c = self.config;
        let mut out = String::new();

        let print_acceleration = self.print_acceleration(path.role);
        let travel_acceleration = if c.travel_acceleration > 0.0 {
            c.travel_acceleration
        } else {
            print_acceleration
        };
        let first = path.first_point();
        if self.last_pos != Some(first) {
            let travel = self.travel_to(&mut out, first, path.role);
            let comment = format!("move to first {} point", descr);
            if (travel_acceleration - print_acceleration).abs() < EPSILON {
                self.writer.set_acceleration(print_acceleration);
                self.write_travel(&mut out, &travel, &comment);
            } else {
                let tail = scaled(20.0 * self.nozzle_diameter());
                let (head, end) = split_for_deceleration(&travel, tail);
                self.writer.set_acceleration(travel_acceleration);
                self.write_travel(&mut out, &head, &comment);
                self.writer.set_acceleration(print_acceleration);
                self.write_travel(&mut out, &end, &comment);
            }
        }
        self.writer.set_acceleration(print_acceleration);
        out.push_str(&self.unretract());

        if path.role != self.last_role {
            if !c.feature_gcode.is_empty() {
                let ctx = self
                    .template_context()
                    .with("extrusion_role", path.role.template_name())
                    .with("last_extrusion_role", self.last_role.template_name());
                out.push_str(&self.render_template("feature_gcode", &c.feature_gcode, &ctx));
            }
            self.last_role = path.role;
        }
        let after_tower = self.last_tag_role == ExtrusionRole::WipeTower;
        if path.role != self.last_tag_role {
            out.push_str(&format!(";TYPE:{}\n", path.role.name()));
        }
        if after_tower || (path.width - self.last_width).abs() > EPSILON {
            self.last_width = path.width;
            out.push_str(&format!(";WIDTH:{}\n", format_number(path.width, 6)));
        }
        if after_tower || (path.height - self.last_height).abs() > EPSILON {
            self.last_height = path.height;
            out.push_str(&format!(";HEIGHT:{}\n", format_number(path.height, 6)));
        }
        self.last_tag_role = path.role;

        let feed = self.compute_speed(path, speed) * 60.0;
        let mut marker = String::new();
        if self.enable_cooling_markers {
            match path.role {
                ExtrusionRole::InternalBridgeInfill => out.push_str(";_BRIDGE_INTERNAL_FAN_START\n"),
                ExtrusionRole::BridgeInfill | ExtrusionRole::OverhangPerimeter => {
                    out.push_str(";_BRIDGE_FAN_START\n")
                }
                ExtrusionRole::TopSolidInfill => out.push_str(";_TOP_FAN_START\n"),
                _ => {}
            }
            marker.push_str(";_EXTRUDE_SET_SPEED");
            if matches!(path.role, ExtrusionRole::ExternalPerimeter | ExtrusionRole::ThinWall) {
                marker.push_str(";_EXTERNAL_PERIMETER");
            }
        }
        out.push_str(&self.writer.set_speed(feed, "", &marker));
        out
    }

    fn after_extrude(&mut self, path: &ExtrusionPath) -> String {
        let mut out = String::new();
        if self.enable_cooling_markers {
            out.push_str(match path.role {
                ExtrusionRole::InternalBridgeInfill => ";_BRIDGE_INTERNAL_FAN_END\n",
                ExtrusionRole::BridgeInfill | ExtrusionRole::OverhangPerimeter => ";_BRIDGE_FAN_END\n",
                ExtrusionRole::TopSolidInfill => ";_TOP_FAN_END\n",
                _ => ";_EXTRUDE_END\n",
            });
        }
        if path.role != ExtrusionRole::GapFill {
            self.last_notgapfill_role = path.role;
        }
        self.last_pos = Some(path.last_point());
        out
    }

    // ------------------------------------------------------------------
    // Travel and retraction
    // ------------------------------------------------------------------

    /// Route around islands in bed coordinates.
    fn route_around(&self, from: Point, to: Point) -> (Polyline, bool) {
        let shift = self.origin.to_scaled();
        let (mut route, inside) = self.avoid_crossing.travel_to(from + shift, to + shift);
        route.translate(-shift);
        (route, inside)
    }

    /// Plan the travel to `point`, retracting into `out` when needed.
    ///
    /// The returned route starts at the position before the travel; write it
    /// with [`Self::write_travel`].
    pub fn travel_to(&mut self, out: &mut String, point: Point, role: ExtrusionRole) -> Polyline {
        let c = self.config;
        let from = self.current_pos();
        let mut travel = Polyline::from_points(vec![from, point]);
        let mut needs_retraction = self.needs_retraction(&travel, role);

        let mut inside_island = false;
        let avoid = c.avoid_crossing_perimeters
            && !self.avoid_crossing.disabled_once()
            && !(c.avoid_crossing_not_first_layer && self.on_first_layer());
        if needs_retraction && avoid {
            let (route, inside) = self.route_around(from, point);
            travel = route;
            inside_island = inside;
            needs_retraction = self.needs_retraction(&travel, role);
        }
        self.avoid_crossing.reset_once_modifiers();

        if needs_retraction {
            if inside_island {
                self.wipe.reset_path();
            }
            let before = self.last_pos;
            out.push_str(&self.retract(false));
            if let Some(after) = self.last_pos.filter(|p| Some(*p) != before) {
                if avoid {
                    // The wipe moved the nozzle; come back without crossing walls.
                    let (mut back, _) = self.route_around(after, from);
                    back.append(&travel);
                    travel = back;
                }
            }
        } else {
            self.wipe.reset_path();
        }
        travel
    }

    /// Emit travel moves along `travel` (its first point is the current position).
    pub fn write_travel(&mut self, out: &mut String, travel: &Polyline, comment: &str) {
        for &p in travel.points.iter().skip(1) {
            let target = self.point_to_gcode(p);
            out.push_str(&self.writer.travel_to_xy(target, comment));
        }
        if let Some(&last) = travel.points.last() {
            self.last_pos = Some(last);
        }
    }

    fn needs_retraction(&mut self, travel: &Polyline, role: ExtrusionRole) -> bool {
        let Some(id) = self.writer.tool_id() else {
            return false;
        };
        let c = self.config;
        if travel.length() < scaled(c.extruder(id as usize).retract_before_travel) {
            return false;
        }
        let Some(layer) = self.layer else {
            return true;
        };
        if role.is_support() {
            if let Some(support) = layer.support_layer {
                if support.islands_contain(travel) {
                    return false;
                }
            }
        }
        if c.only_retract_when_crossing_perimeters && self.fill_density > 0.0 {
            if let Some(object_layer) = layer.object_layer {
                if !self.retract_crossing.check_travel(object_layer, travel).should_retract() {
                    return false;
                }
            }
        }
        true
    }

    /// Retract the active tool, wiping first when enabled and lifting as configured.
    pub fn retract(&mut self, toolchange: bool) -> String {
        let mut out = String::new();
        let Some(id) = self.writer.tool_id() else {
            return out;
        };
        let c = self.config;
        let ext = c.extruder(id as usize);

        out.push_str(&self.writer.reset_e(false));
        if ext.wipe && self.wipe.has_path() {
            out.push_str(&if toolchange {
                self.writer.retract_for_toolchange(true)
            } else {
                self.writer.retract(true)
            });
            let last = self.current_pos();
            let (origin, offset) = (self.gcode_origin(), self.extruder_offset());
            let (wipe, end) = self.wipe.wipe(
                &mut self.writer,
                last,
                |p| to_gcode(p, origin, offset),
                toolchange,
                self.enable_cooling_markers,
            );
            out.push_str(&wipe);
            self.last_pos = Some(end);
        }
        out.push_str(&if toolchange {
            self.writer.retract_for_toolchange(false)
        } else {
            self.writer.retract(false)
        });

        let lift_first_layer = ext.retract_lift_first_layer && self.layer_index == 0;
        let mut need_lift = !self.writer.tool_is_extruder() || toolchange || lift_first_layer;
        if !need_lift && ext.retract_lift > 0.0 {
            let last = if self.last_role == ExtrusionRole::GapFill {
                self.last_notgapfill_role
            } else {
                self.last_role
            };
            let on_top = last == ExtrusionRole::TopSolidInfill;
            need_lift = match ext.retract_lift_top {
                LiftPolicy::Always => true,
                LiftPolicy::OnlyOnTop => on_top,
                LiftPolicy::NotOnTop => !on_top,
            };
        }
        if need_lift && (ext.retract_length > 0.0 || c.use_firmware_retraction || lift_first_layer) {
            out.push_str(&self.writer.lift(self.layer_index.max(0) as usize));
        }
        out
    }

    pub fn unretract(&mut self) -> String {
        let mut out = self.writer.unlift();
        out.push_str(&self.writer.unretract());
        out
    }

    // ------------------------------------------------------------------
    // Tools and layers
    // ------------------------------------------------------------------

    /// Writer tool switch preceded by the tool change template. The `T`
    /// command is left out when the template already issues it.
    fn toolchange(&mut self, extruder_id: u16, print_z: CoordF) -> String {
        let c = self.config;
        let previous = self.writer.tool_id();
        let mut out = String::new();
        if !c.toolchange_gcode.is_empty() {
            let ctx = self
                .template_context()
                .with("previous_extruder", previous.map_or(-1, i64::from))
                .with("next_extruder", extruder_id)
                .with("layer_z", print_z);
            out.push_str(&self.render_template("toolchange_gcode", &c.toolchange_gcode, &ctx));
        }
        let command = self.writer.toolchange(extruder_id);
        let issued = out
            .lines()
            .any(|l| l.split(';').next().is_some_and(|code| code.trim() == format!("T{}", extruder_id)));
        if !issued {
            out.push_str(&command);
        }
        self.wipe.enabled = c.extruder(extruder_id as usize).wipe;
        out
    }

    fn filament_template(&mut self, name: &str, template: &str, extruder_id: u16) -> String {
        let ctx = self.template_context().with("filament_extruder_id", extruder_id);
        self.render_template(name, template, &ctx)
    }

    /// Activate `extruder_id` (0-based) outside the wipe tower.
    pub fn set_extruder(&mut self, extruder_id: u16, print_z: CoordF) -> String {
        if !self.writer.need_toolchange(extruder_id) {
            return String::new();
        }
        let c = self.config;
        let ext = c.extruder(extruder_id as usize);

        let Some(previous) = self.writer.tool_id() else {
            let mut out = self.toolchange(extruder_id, print_z);
            out.push_str(&self.filament_template("start_filament_gcode", &ext.start_filament_gcode, extruder_id));
            return out;
        };

        let mut out = self.retract(true);
        self.wipe.reset_path();
        let end_filament = &c.extruder(previous as usize).end_filament_gcode;
        out.push_str(&self.filament_template("end_filament_gcode", end_filament, previous));
        out.push_str(&self.toolchange(extruder_id, print_z));
        self.toolchange_count += 1;

        if c.single_extruder_multi_material {
            let temperature = if self.layer_index <= 0 {
                ext.first_layer_temperature
            } else {
                ext.temperature
            };
            if temperature > 0 {
                out.push_str(&self.writer.set_temperature(temperature, false, Some(extruder_id)));
            }
        }
        out.push_str(&self.filament_template("start_filament_gcode", &ext.start_filament_gcode, extruder_id));
        out
    }

    /// Move to the next layer at `print_z`.
    pub fn change_layer(&mut self, print_z: CoordF) -> String {
        self.layer_index += 1;
        self.max_layer_z = self.max_layer_z.max(print_z);
        let z = print_z + self.config.z_offset;
        let mut out = String::new();
        if self.writer.will_move_z(z) {
            out.push_str(&self.retract(false));
        }
        let comment = format!("move to next layer ({})", self.layer_index);
        out.push_str(&self.writer.travel_to_z(z, &comment));
        self.wipe.reset_path();
        out
    }

    fn tower_point_to_object(&self, p: PointF) -> Point {
        let origin = self.gcode_origin();
        Point::new_scale(p.x - origin.x, p.y - origin.y)
    }

    /// Splice a pre-built wipe tower result into the stream.
    ///
    /// `new_extruder` is the tool the caller expects the result to switch
    /// to; a result switching to another tool is an error.
    pub fn append_tool_change_result(
        &mut self,
        tcr: &ToolChangeResult,
        data: &WipeTowerData,
        new_extruder: Option<u16>,
    ) -> Result<String> {
        check_expected_tool(tcr, new_extruder)?;
        let c = self.config;

        let (translation, angle) = if tcr.priming {
            (PointF::default(), 0.0)
        } else {
            (data.position, data.rotation_rad())
        };
        let (start, end) = if tcr.priming {
            (tcr.start_pos, tcr.end_pos)
        } else {
            (data.to_bed(tcr.start_pos), data.to_bed(tcr.end_pos))
        };
        let tower_gcode = post_process_moves(tcr, data, translation, angle);

        let mut out = String::new();
        if !tcr.priming {
            out.push_str(&self.retract(true));
            self.avoid_crossing.use_external_mp_once();
            let target = self.tower_point_to_object(start);
            let travel = self.travel_to(&mut out, target, ExtrusionRole::Mixed);
            self.write_travel(&mut out, &travel, "Travel to a Wipe Tower");
            out.push_str(&self.unretract());
        }

        let current_z = self.writer.z();
        let tower_z = tcr.print_z + c.z_offset;
        let z_changed = !tcr.priming && (tower_z - current_z).abs() > EPSILON;
        if z_changed {
            out.push_str(&self.writer.retract(false));
            out.push_str(&self.writer.travel_to_z(tower_z, "Travel down to the last wipe tower layer."));
            out.push_str(&self.writer.unretract());
        }

        let previous = self.writer.tool_id();
        let changing = new_extruder.filter(|&id| tcr.priming || self.writer.need_toolchange(id));
        let mut end_filament = String::new();
        let mut toolchange = String::new();
        let mut start_filament = String::new();
        if let Some(id) = changing {
            if let Some(prev) = previous.filter(|_| !tcr.priming) {
                let template = &c.extruder(prev as usize).end_filament_gcode;
                end_filament = self.filament_template("end_filament_gcode", template, prev);
            }
            toolchange = self.toolchange(id, tcr.print_z);
            if previous.is_some_and(|prev| prev != id) {
                self.toolchange_count += 1;
            }
            let template = &c.extruder(id as usize).start_filament_gcode;
            start_filament = self.filament_template("start_filament_gcode", template, id);
        }
        out.push_str(&splice_placeholders(&tower_gcode, &end_filament, &toolchange, &start_filament));

        // The tower moved the nozzle behind the writer's back.
        let end_point = self.tower_point_to_object(end);
        let end_gcode = self.point_to_gcode(end_point);
        let z = self.writer.z();
        self.writer.set_position(end_gcode, z);
        self.last_pos = Some(end_point);

        if z_changed {
            out.push_str(&self.writer.retract(false));
            out.push_str(&self.writer.travel_to_z(current_z, "Travel back up to the topmost object layer."));
            out.push_str(&self.writer.unretract());
        } else {
            let path: Vec<Point> = transform_path(&tcr.wipe_path, translation, angle)
                .into_iter()
                .map(|p| self.tower_point_to_object(p))
                .collect();
            self.wipe.set_path(Polyline::from_points(path));
        }

        self.avoid_crossing.use_external_mp_once();
        self.last_tag_role = ExtrusionRole::WipeTower;
        Ok(out)
    }

    /// Consume the emitter, returning the writer with its extrusion statistics.
    pub fn into_writer(self) -> GCodeWriter {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtruderConfig;
    use crate::print::LayerRegion;

    fn emitter(config: &PrintConfig) -> ToolpathEmitter<'_> {
        let mut e = ToolpathEmitter::new(config);
        e.writer_mut().set_extruders(vec![0]);
        e.set_extruder(0, 0.2);
        e
    }

    fn path(points: &[(f64, f64)], role: ExtrusionRole) -> ExtrusionPath {
        ExtrusionPath::from_points(
            points.iter().map(|&(x, y)| Point::new_scale(x, y)).collect(),
            role,
            0.45,
            0.2,
        )
    }

    fn e_values(gcode: &str) -> Vec<f64> {
        gcode
            .lines()
            .filter(|l| l.starts_with("G1 X"))
            .filter_map(|l| l.split_whitespace().find(|w| w.starts_with('E')))
            .filter_map(|w| w[1..].parse().ok())
            .collect()
    }

    fn layer(id: usize) -> Layer {
        Layer {
            id,
            print_z: 0.2 * (id + 1) as f64,
            height: 0.2,
            regions: vec![LayerRegion::default()],
            ..Default::default()
        }
    }

    fn context(layer: &Layer) -> LayerContext<'_> {
        LayerContext {
            id: layer.id,
            print_z: layer.print_z,
            height: layer.height,
            object_layer: Some(layer),
            support_layer: None,
        }
    }

    #[test]
    fn test_speed_monotonic_in_max_volumetric_speed() {
        let p = ExtrusionPath {
            mm3_per_mm: 0.1,
            ..path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::Perimeter)
        };
        let mut previous = 0.0;
        for max in [0.5, 1.0, 2.0, 5.0, 10.0, 50.0] {
            let mut config = PrintConfig::default();
            config.max_volumetric_speed = max;
            let e = emitter(&config);
            let speed = e.compute_speed(&p, SpeedRequest::ROLE);
            assert!(speed >= previous, "{} < {} at {}", speed, previous, max);
            previous = speed;
        }
        // No cap beyond the role speed.
        assert!((previous - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_layer_speed_floor() {
        let mut config = PrintConfig::default().first_layer_min_speed(40.0);
        config.max_volumetric_speed = 1.0;
        let first = layer(0);
        let mut e = emitter(&config);
        e.set_layer(context(&first));
        let p = ExtrusionPath {
            mm3_per_mm: 0.1,
            ..path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::InternalInfill)
        };
        // Volumetric cap alone would give 10 mm/s.
        assert!((e.compute_speed(&p, SpeedRequest::ROLE) - 40.0).abs() < 1e-9);
        assert!((e.compute_speed(&p, SpeedRequest::Fixed(5.0)) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_layer_cap() {
        let config = PrintConfig::default();
        let first = layer(0);
        let second = layer(1);
        let mut e = emitter(&config);
        let p = path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::Perimeter);
        e.set_layer(context(&second));
        assert!((e.compute_speed(&p, SpeedRequest::ROLE) - 60.0).abs() < 1e-9);
        e.set_layer(context(&first));
        assert!((e.compute_speed(&p, SpeedRequest::ROLE) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_retract_with_wipe() {
        let config = PrintConfig::default().extruders(vec![ExtruderConfig::default().wipe(true, 40.0)]);
        let mut e = emitter(&config);
        e.set_last_pos(Point::new_scale(10.0, 0.0));
        e.wipe_mut()
            .set_path(Polyline::from_points(vec![Point::new_scale(10.0, 0.0), Point::new_scale(0.0, 0.0)]));
        let out = e.retract(false);
        assert_eq!(out.matches(";WIPE_START").count(), 1);
        assert_eq!(out.matches(";WIPE_END").count(), 1);
        let after = &out[out.find(";WIPE_END").unwrap_or(0)..];
        assert!(after.lines().skip(1).any(|l| l.starts_with("G1 E-")));
        assert!(!e.wipe.has_path());
    }

    #[test]
    fn test_corner_coefficient_boundaries() {
        let ccw = |turn: f64| PI - turn.to_radians();
        assert_eq!(corner_cut_coefficient(ccw(10.0), 20.0), None);
        assert_eq!(corner_cut_coefficient(ccw(30.0), 10.0), Some(CUT_CORNER_TABLE[0]));
        // Below the table start: clamped, not extrapolated.
        assert_eq!(corner_cut_coefficient(ccw(25.0), 10.0), Some(CUT_CORNER_TABLE[0]));
        assert_eq!(corner_cut_coefficient(ccw(170.0), 10.0), CUT_CORNER_TABLE.last().copied());
        // Turning the other way gives the same reduction.
        assert_eq!(corner_cut_coefficient(PI + 30f64.to_radians(), 10.0), Some(CUT_CORNER_TABLE[0]));
    }

    #[test]
    fn test_shallow_corner_extrudes_uncompensated() {
        let t = 10f64.to_radians();
        let points = [(0.0, 0.0), (10.0, 0.0), (10.0 + 10.0 * t.cos(), 10.0 * t.sin())];
        let p = path(&points, ExtrusionRole::ExternalPerimeter);

        let mut plain = PrintConfig::default();
        plain.external_perimeter_cut_corners = 0.0;
        let mut cut = plain.clone();
        cut.external_perimeter_cut_corners = 100.0;
        cut.corner_cut_threshold = 20.0;

        let reference: f64 = e_values(&emitter(&plain).extrude_path(&p, "", SpeedRequest::ROLE)).iter().sum();
        let compensated: f64 = e_values(&emitter(&cut).extrude_path(&p, "", SpeedRequest::ROLE)).iter().sum();
        assert!(reference > 0.0);
        assert!((reference - compensated).abs() < 1e-4);

        let sharp = path(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)], ExtrusionRole::ExternalPerimeter);
        let reference: f64 = e_values(&emitter(&plain).extrude_path(&sharp, "", SpeedRequest::ROLE)).iter().sum();
        let compensated: f64 = e_values(&emitter(&cut).extrude_path(&sharp, "", SpeedRequest::ROLE)).iter().sum();
        assert!(compensated < reference);
    }

    #[test]
    fn test_short_leftover_is_merged() {
        let mut config = PrintConfig::default();
        config.min_length = 1.0;
        let mut e = emitter(&config);
        let tiny = path(&[(0.0, 0.0), (0.5, 0.0)], ExtrusionRole::Perimeter);
        assert!(e.extrude_path(&tiny, "", SpeedRequest::ROLE).is_empty());
        let out = e.extrude_path(&path(&[(0.5, 0.0), (3.0, 0.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        assert!(out.contains("G1 X0 Y0 F"));
        assert!(out.contains("G1 X3 Y0 E"));
        assert!(!out.contains("X0.5"));
    }

    #[test]
    fn test_split_for_deceleration() {
        let long = Polyline::from_points(vec![Point::new_scale(0.0, 0.0), Point::new_scale(100.0, 0.0)]);
        let (head, tail) = split_for_deceleration(&long, scaled(10.0));
        assert_eq!(head.last_point(), Point::new_scale(90.0, 0.0));
        assert_eq!(tail.first_point(), Point::new_scale(90.0, 0.0));
        assert_eq!(tail.last_point(), Point::new_scale(100.0, 0.0));

        let short = Polyline::from_points(vec![Point::new_scale(0.0, 0.0), Point::new_scale(20.0, 0.0)]);
        let (head, tail) = split_for_deceleration(&short, scaled(10.0));
        assert_eq!(head.last_point(), Point::new_scale(10.0, 0.0));
        assert_eq!(tail.first_point(), Point::new_scale(10.0, 0.0));
    }

    #[test]
    fn test_role_tags_only_on_change() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let mut out = e.extrude_path(&path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        out.push_str(&e.extrude_path(&path(&[(10.0, 0.0), (10.0, 10.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE));
        out.push_str(&e.extrude_path(&path(&[(10.0, 10.0), (0.0, 10.0)], ExtrusionRole::GapFill), "", SpeedRequest::ROLE));
        assert_eq!(out.matches(";TYPE:Perimeter").count(), 1);
        assert_eq!(out.matches(";TYPE:Gap fill").count(), 1);
        assert_eq!(out.matches(";WIDTH:").count(), 1);
        assert_eq!(out.matches(";_EXTRUDE_SET_SPEED").count(), 3);
    }

    #[test]
    fn test_failed_template_is_embedded() {
        let mut config = PrintConfig::default();
        config.feature_gcode = "{no_such_variable}".into();
        let mut e = emitter(&config);
        let out = e.extrude_path(&path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        assert!(out.contains("!!!!! Failed to process the custom G-code template feature_gcode"));
        assert!(out.contains("!!!!! End of an error report for the custom G-code template feature_gcode"));
        assert!(e.template_failures().contains_key("feature_gcode"));
        // Extrusion continues after the report.
        assert!(out.contains("G1 X10 Y0 E"));
    }

    #[test]
    fn test_long_travel_retracts() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let mut out = e.extrude_path(&path(&[(0.0, 0.0), (10.0, 0.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        out.push_str(&e.extrude_path(&path(&[(50.0, 0.0), (60.0, 0.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE));
        let retract = out.find("G1 E-2").expect("retraction");
        let travel = out.find("G1 X50 Y0 F").expect("travel");
        let unretract = out.find("G1 E2 ").expect("unretraction");
        assert!(retract < travel && travel < unretract);
    }

    fn square_loop(size: f64, role: ExtrusionRole) -> ExtrusionLoop {
        let points = vec![
            Point::new_scale(0.0, 0.0),
            Point::new_scale(size, 0.0),
            Point::new_scale(size, size),
            Point::new_scale(0.0, size),
            Point::new_scale(0.0, 0.0),
        ];
        ExtrusionLoop::new(
            vec![ExtrusionPath::from_points(points, role, 0.45, 0.2)],
            ExtrusionLoopRole::Default,
        )
    }

    #[test]
    fn test_external_loop_hides_seam() {
        let mut config = PrintConfig::default();
        config.gcode_comments = true;
        let first = layer(1);
        let mut e = emitter(&config);
        e.set_layer(context(&first));
        let out = e.extrude_loop(&square_loop(10.0, ExtrusionRole::ExternalPerimeter), "", SpeedRequest::ROLE);
        let last = out.lines().last().unwrap_or_default();
        assert!(last.contains("move inwards before travel"), "{}", out);
        // The seam gap keeps the loop open.
        assert!(e.last_pos().is_some_and(|p| p != Point::new_scale(0.0, 0.0)));
    }

    #[test]
    fn test_small_perimeter_slows_down() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let out = e.extrude_loop(&square_loop(1.0, ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        assert!(out.contains("G1 F900"), "{}", out);
        let out = e.extrude_loop(&square_loop(10.0, ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        assert!(out.contains("G1 F3600"), "{}", out);
    }

    #[test]
    fn test_collection_no_sort_keeps_order() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let far = path(&[(50.0, 0.0), (60.0, 0.0)], ExtrusionRole::InternalInfill);
        let near = path(&[(1.0, 0.0), (2.0, 0.0)], ExtrusionRole::InternalInfill);
        let collection = ExtrusionEntityCollection::ordered(vec![far.into(), near.into()]);
        let out = e.extrude_collection(&collection, "", SpeedRequest::ROLE);
        let a = out.find("X60").unwrap_or(usize::MAX);
        let b = out.find("X2 ").unwrap_or(usize::MAX);
        assert!(a < b);
    }

    #[test]
    fn test_unexpected_tool_change_fails() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let tcr = ToolChangeResult {
            initial_tool: 0,
            new_tool: 1,
            ..Default::default()
        };
        let err = e.append_tool_change_result(&tcr, &WipeTowerData::default(), Some(2));
        assert!(matches!(err, Err(crate::Error::WipeTower(_))));
    }

    #[test]
    fn test_tool_change_result_updates_position() {
        let config = PrintConfig::default();
        let mut e = emitter(&config);
        let data = WipeTowerData {
            position: PointF::new(100.0, 50.0),
            ..Default::default()
        };
        let tcr = ToolChangeResult {
            print_z: 0.0,
            gcode: "G1 X5 Y0 E1\n".into(),
            start_pos: PointF::new(0.0, 0.0),
            end_pos: PointF::new(5.0, 0.0),
            initial_tool: 0,
            new_tool: 0,
            ..Default::default()
        };
        let out = e.append_tool_change_result(&tcr, &data, None).expect("tower");
        assert!(out.contains("G1 X105 Y50 E1"));
        assert_eq!(e.last_pos(), Some(Point::new_scale(105.0, 50.0)));
        // Tags come back after the tower.
        let out = e.extrude_path(&path(&[(105.0, 50.0), (110.0, 50.0)], ExtrusionRole::Perimeter), "", SpeedRequest::ROLE);
        assert!(out.contains(";WIDTH:"));
    }
}
