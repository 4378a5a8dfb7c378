//! Whole-print export.
//!
//! [`LayerExportDriver`] walks the merged print heights in ascending order
//! and hands every layer to the [`ToolpathEmitter`], one extruder at a time.
//! Around the object extrusions it places the skirt, the brim, wipe tower
//! tool changes and custom G-code, and it switches from first layer to
//! steady-state temperatures once. Everything that only lives for one export
//! run is kept in an [`ExportSession`].
//!
//! The text of each layer goes through the spiral vase filter (when enabled)
//! and then through the [`FanTimingBuffer`] before it reaches the output.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use super::emitter::{LayerContext, SpeedRequest, ToolpathEmitter};
use super::fan_mover::FanTimingBuffer;
use super::ordering::{collect_layers_to_print, LayerPlan, LayerToPrint, ObjectByExtruder, Region};
use super::spiral_vase::SpiralVase;
use super::template::TemplateEngine;
use super::wipe_tower::WipeTowerIntegration;
use super::writer::format_number;
use crate::config::{GCodeFlavor, PrintConfig};
use crate::extrusion::{flow_mm3_per_mm, ExtrusionEntity, ExtrusionPath};
use crate::geometry::{get_extents, BoundingBox, ExPolygon, PointF};
use crate::print::{CustomGCode, CustomGCodeKind, Layer, LayerTools, Print, PrintObject, SupportLayer, ToolOrdering};
use crate::{scale, CoordF, Error, Result, EPSILON};

/// Severity of a printability warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningLevel {
    NonCritical,
    Critical,
}

/// A problem that does not stop the export but should be shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportWarning {
    pub level: WarningLevel,
    pub message: String,
}

impl ExportWarning {
    pub fn new(level: WarningLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Outcome of a finished export.
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    /// Number of print heights written.
    pub layer_count: usize,
    /// Filament used per extruder (mm).
    pub filament_used_mm: Vec<(u16, CoordF)>,
    /// Filament used per extruder (cm³).
    pub filament_used_cm3: Vec<(u16, CoordF)>,
    pub toolchanges: usize,
    pub warnings: Vec<ExportWarning>,
    /// First error of every custom G-code template that failed, by template name.
    pub template_failures: BTreeMap<String, String>,
}

impl ExportReport {
    pub fn total_filament_mm(&self) -> CoordF {
        self.filament_used_mm.iter().map(|(_, mm)| mm).sum()
    }

    pub fn has_critical_warnings(&self) -> bool {
        self.warnings.iter().any(|w| w.level == WarningLevel::Critical)
    }
}

/// Where the driver is in the print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    /// Start G-code written; the first to second layer temperature switch is pending.
    FirstLayerTransitionPending,
    SteadyState,
    Finished,
}

/// Per-export bookkeeping, created at the start of an export and dropped with it.
#[derive(Debug, Clone)]
pub struct ExportSession {
    state: DriverState,
    /// `print_z` of every layer that got a skirt.
    skirt_done: Vec<CoordF>,
    brim_done: bool,
    /// Object index and shift of the copy printed last.
    last_obj_copy: Option<(usize, crate::geometry::Point)>,
    last_layer_z: Option<CoordF>,
    layer_count: usize,
    warnings: Vec<ExportWarning>,
}

impl Default for ExportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportSession {
    pub fn new() -> Self {
        Self {
            state: DriverState::Initializing,
            skirt_done: Vec::new(),
            brim_done: false,
            last_obj_copy: None,
            last_layer_z: None,
            layer_count: 0,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn skirt_done(&self) -> &[CoordF] {
        &self.skirt_done
    }

    pub fn brim_done(&self) -> bool {
        self.brim_done
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn warnings(&self) -> &[ExportWarning] {
        &self.warnings
    }

    fn warn(&mut self, level: WarningLevel, message: impl Into<String>) {
        let warning = ExportWarning::new(level, message);
        warn!("{}", warning.message);
        self.warnings.push(warning);
    }
}

/// Split `n_loops` skirt loops over `extruders`. Every extruder but the last
/// gets `ceil(n_loops / n_extruders)` loops, the last one the remainder.
pub fn skirt_loops_per_extruder(n_loops: usize, extruders: &[u16]) -> Vec<(u16, Range<usize>)> {
    if n_loops == 0 || extruders.is_empty() {
        return Vec::new();
    }
    let per_extruder = n_loops.div_ceil(extruders.len());
    (0..n_loops)
        .step_by(per_extruder)
        .zip(extruders)
        .map(|(start, &extruder)| (extruder, start..(start + per_extruder).min(n_loops)))
        .collect()
}

fn set_layer_height(entity: &mut ExtrusionEntity, height: CoordF) {
    let adjust = |path: &mut ExtrusionPath| {
        path.height = height;
        path.mm3_per_mm = flow_mm3_per_mm(path.width, height);
    };
    match entity {
        ExtrusionEntity::Path(path) => adjust(path),
        ExtrusionEntity::MultiPath(multipath) => multipath.paths.iter_mut().for_each(adjust),
        ExtrusionEntity::Loop(extrusion_loop) => extrusion_loop.paths.iter_mut().for_each(adjust),
        ExtrusionEntity::Collection(collection) => collection
            .entities
            .iter_mut()
            .for_each(|e| set_layer_height(e, height)),
    }
}

/// True when a line of `gcode` starts with one of `codes`.
fn mentions(gcode: &str, codes: &[&str]) -> bool {
    gcode.lines().any(|line| {
        let code = line.split(';').next().unwrap_or("").trim_start();
        codes.iter().any(|c| {
            code.strip_prefix(c)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        })
    })
}

/// True when `gcode` selects a tool by itself (`T<n>`).
fn selects_tool(gcode: &str) -> bool {
    gcode.lines().any(|line| {
        let code = line.split(';').next().unwrap_or("").trim();
        code.strip_prefix('T')
            .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Drives the emitter over every layer of a print.
pub struct LayerExportDriver<'a> {
    print: &'a Print,
    config: &'a PrintConfig,
    emitter: ToolpathEmitter<'a>,
    session: ExportSession,
    /// Only installed when fan commands are actually retimed.
    fan: Option<FanTimingBuffer>,
    spiral_vase: Option<SpiralVase>,
    wipe_tower: Option<WipeTowerIntegration<'a>>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> LayerExportDriver<'a> {
    pub fn new(print: &'a Print, config: &'a PrintConfig) -> Self {
        let mut emitter = ToolpathEmitter::new(config);
        emitter.set_vase_loops(!config.spiral_vase);
        Self {
            print,
            config,
            emitter,
            session: ExportSession::new(),
            fan: Some(FanTimingBuffer::from_config(config)).filter(FanTimingBuffer::is_active),
            spiral_vase: config
                .spiral_vase
                .then(|| SpiralVase::new(config.use_relative_e_distances)),
            wipe_tower: print
                .wipe_tower
                .as_ref()
                .filter(|_| config.wipe_tower)
                .map(WipeTowerIntegration::new),
            cancel: None,
        }
    }

    pub fn with_template_engine(mut self, engine: impl TemplateEngine + 'a) -> Self {
        self.emitter = self.emitter.with_template_engine(engine);
        self
    }

    /// Poll `flag` between layers and extruders; once set the export stops
    /// with [`Error::Cancelled`].
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn session(&self) -> &ExportSession {
        &self.session
    }

    pub fn emitter(&self) -> &ToolpathEmitter<'a> {
        &self.emitter
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Export the whole print into `out`.
    ///
    /// `progress` is called after every layer with the number of layers done
    /// and the total.
    pub fn run<W: Write>(mut self, out: &mut W, progress: Option<&dyn Fn(usize, usize)>) -> Result<ExportReport> {
        let print = self.print;
        let mut warnings = Vec::new();
        let layers = collect_layers_to_print(print, self.config, &mut warnings)?;
        self.session.warnings.extend(warnings);

        let ordering: Cow<'_, ToolOrdering> = if print.tool_ordering.is_empty() {
            Cow::Owned(ToolOrdering::from_print(print))
        } else {
            Cow::Borrowed(&print.tool_ordering)
        };
        info!(
            "Exporting {} layers of {} objects with extruders {:?}",
            layers.len(),
            print.objects.len(),
            ordering.all_extruders
        );

        let start = self.start(&layers, &ordering)?;
        self.write(out, &start, false)?;

        let total = layers.len();
        for (done, (print_z, layer)) in layers.iter().enumerate() {
            self.check_cancelled()?;
            let Some(layer_tools) = ordering.tools_for_layer(*print_z) else {
                debug!("No extruders planned at z = {:.3}, skipping", print_z);
                continue;
            };
            if layer_tools.has_wipe_tower {
                if let Some(tower) = self.wipe_tower.as_mut() {
                    tower.next_layer();
                }
            }
            let text = self.process_layer(layer, layer_tools)?;
            self.write(out, &text, false)?;
            if let Some(progress) = progress {
                progress(done + 1, total);
            }
        }

        let end = self.finish()?;
        self.write(out, &end, true)?;
        out.flush()?;

        let report = self.into_report();
        info!(
            "Export finished: {} layers, {:.1} mm of filament, {} tool changes",
            report.layer_count,
            report.total_filament_mm(),
            report.toolchanges
        );
        Ok(report)
    }

    fn write<W: Write>(&mut self, out: &mut W, text: &str, flush: bool) -> Result<()> {
        match self.fan.as_mut() {
            Some(fan) => out.write_all(fan.process(text, flush).as_bytes())?,
            None => out.write_all(text.as_bytes())?,
        }
        Ok(())
    }

    fn into_report(self) -> ExportReport {
        let (filament_used_mm, filament_used_cm3) = self.filament_stats();
        ExportReport {
            layer_count: self.session.layer_count,
            filament_used_mm,
            filament_used_cm3,
            toolchanges: self.emitter.toolchange_count(),
            template_failures: self.emitter.template_failures().clone(),
            warnings: self.session.warnings,
        }
    }

    fn filament_stats(&self) -> (Vec<(u16, CoordF)>, Vec<(u16, CoordF)>) {
        self.emitter
            .writer()
            .extruders()
            .iter()
            .map(|e| ((e.id(), e.used_filament()), (e.id(), e.extruded_volume() * 0.001)))
            .unzip()
    }

    fn labels_use_m486(&self) -> bool {
        matches!(self.config.gcode_flavor, GCodeFlavor::Marlin | GCodeFlavor::RepRap)
    }

    /// Index of a copy among all copies of the print.
    fn plater_instance_id(&self, object_idx: usize, instance_id: usize) -> usize {
        self.print.objects[..object_idx.min(self.print.objects.len())]
            .iter()
            .map(|o| o.instances.len())
            .sum::<usize>()
            + instance_id
    }

    /// Header, start G-code, first layer temperatures, the initial tool and
    /// the wipe tower priming.
    pub fn start(&mut self, layers: &[(CoordF, Vec<LayerToPrint<'a>>)], ordering: &ToolOrdering) -> Result<String> {
        let c = self.config;
        let print = self.print;
        let mut out = format!("; generated by {} {}\n\n", env!("CARGO_PKG_NAME"), crate::VERSION);

        if c.gcode_label_objects {
            let mut count = 0;
            for (idx, object) in print.objects.iter().enumerate() {
                for copy in 0..object.instances.len() {
                    out.push_str(&format!("; object {} id:{} copy {}\n", object.name, idx, copy));
                    count += 1;
                }
            }
            if self.labels_use_m486() {
                out.push_str(&format!("M486 T{}\n", count));
            }
            out.push('\n');
        }

        let mut extruders = ordering.all_extruders.clone();
        if extruders.is_empty() {
            extruders.push(ordering.first_extruder.unwrap_or(0));
        }
        let initial = ordering
            .first_extruder
            .or_else(|| extruders.first().copied())
            .unwrap_or(0);
        self.emitter.writer_mut().set_extruders(extruders);

        if c.avoid_crossing_perimeters {
            let footprints: Vec<ExPolygon> = print
                .objects
                .iter()
                .filter_map(|o| o.layers.first().map(|l| (o, l)))
                .flat_map(|(o, l)| {
                    o.instances.iter().flat_map(move |i| {
                        l.slices.iter().cloned().map(move |mut s| {
                            s.translate(i.shift);
                            s
                        })
                    })
                })
                .collect();
            let clearance = c.extruder(initial as usize).nozzle_diameter;
            self.emitter.avoid_crossing_mut().init_external(&footprints, clearance);
        }

        out.push_str(";TYPE:Custom\n");
        let ctx = self
            .emitter
            .template_context()
            .with("initial_extruder", initial)
            .with("current_extruder", initial);
        let start_gcode = self.emitter.render_template("start_gcode", &c.start_gcode, &ctx);

        if c.first_layer_bed_temperature > 0 && !mentions(&start_gcode, &["M140", "M190"]) {
            out.push_str(&self.emitter.writer_mut().set_bed_temperature(c.first_layer_bed_temperature, true));
        }
        if !mentions(&start_gcode, &["M104", "M109"]) {
            out.push_str(&self.first_layer_temperatures(initial));
        }
        out.push_str(&start_gcode);

        if c.disable_fan_first_layers > 0 {
            out.push_str(&self.emitter.writer_mut().set_fan(0));
        }
        out.push_str(&self.emitter.writer_mut().preamble());

        if selects_tool(&start_gcode) {
            // The start script already switched; only track it.
            self.emitter.writer_mut().toolchange(initial);
        } else {
            out.push_str(&self.emitter.set_extruder(initial, 0.0));
        }

        out.push_str(&self.prime_wipe_tower(layers)?);
        self.session.state = DriverState::FirstLayerTransitionPending;
        Ok(out)
    }

    /// First layer temperatures; only the initial extruder is waited for.
    fn first_layer_temperatures(&mut self, initial: u16) -> String {
        let c = self.config;
        let mut out = String::new();
        let ids = self.emitter.writer().extruder_ids();
        for id in ids {
            if c.single_extruder_multi_material && id != initial {
                continue;
            }
            let temperature = c.extruder(id as usize).first_layer_temperature;
            if temperature > 0 && id != initial {
                out.push_str(&self.emitter.writer_mut().set_temperature(temperature, false, Some(id)));
            }
        }
        let temperature = c.extruder(initial as usize).first_layer_temperature;
        if temperature > 0 {
            out.push_str(&self.emitter.writer_mut().set_temperature(temperature, true, Some(initial)));
        }
        out
    }

    fn prime_wipe_tower(&mut self, layers: &[(CoordF, Vec<LayerToPrint<'a>>)]) -> Result<String> {
        let c = self.config;
        let mut out = String::new();
        let Some(tower) = self.wipe_tower.as_ref() else {
            return Ok(out);
        };
        let (priming, data) = (tower.priming(), tower.data());
        let Some(first_height) = layers.first().map(|(z, _)| *z) else {
            return Ok(out);
        };
        if priming.is_empty() {
            return Ok(out);
        }

        out.push_str(
            &self
                .emitter
                .writer_mut()
                .travel_to_z(first_height + c.z_offset, "Move to the first layer height"),
        );
        for tcr in priming {
            let tool = u16::try_from(tcr.new_tool).ok();
            out.push_str(&self.emitter.append_tool_change_result(tcr, data, tool)?);
        }

        let overlap = self.priming_overlaps_print(layers);
        if c.gcode_flavor == GCodeFlavor::Marlin {
            out.push_str(&self.emitter.retract(false));
            out.push_str("M300 S800 P500\n");
            if overlap {
                out.push_str("M1 Remove priming towers and click button.\n");
            } else {
                out.push_str("M1 S10\n");
            }
        } else if overlap {
            self.session.warn(
                WarningLevel::Critical,
                "Your print is very close to the priming regions. Make sure there is no collision.",
            );
        }
        Ok(out)
    }

    /// Whether the priming extrusions come near the first two layers or the tower.
    fn priming_overlaps_print(&self, layers: &[(CoordF, Vec<LayerToPrint<'a>>)]) -> bool {
        let Some(tower) = self.wipe_tower.as_ref() else {
            return false;
        };
        let mut prime = BoundingBox::new();
        for tcr in tower.priming() {
            for p in [tcr.start_pos, tcr.end_pos].iter().chain(&tcr.wipe_path) {
                prime.merge_point(p.to_scaled());
            }
        }
        prime.offset(scale(0.5));

        let Some(two_layers_z) = layers.get(1).or(layers.first()).map(|(z, _)| z + EPSILON) else {
            return false;
        };
        let mut extents = BoundingBox::new();
        for object in &self.print.objects {
            for layer in object.layers.iter().take_while(|l| l.print_z <= two_layers_z) {
                if layer.slices.is_empty() {
                    continue;
                }
                let bbox = get_extents(&layer.slices);
                for instance in &object.instances {
                    extents.merge_point(bbox.min + instance.shift);
                    extents.merge_point(bbox.max + instance.shift);
                }
            }
        }
        for corner in tower.data().footprint() {
            extents.merge_point(corner.to_scaled());
        }
        prime.overlap(&extents)
    }

    fn spiral_vase_enabled(&self, object: &PrintObject, layer: Option<&Layer>) -> bool {
        let c = self.config;
        let Some(layer) = layer else {
            return false;
        };
        let enable = (layer.id > 0 || object.brim_width <= 0.0) && layer.id >= c.skirt_height && !c.draft_shield;
        enable
            && layer.regions.iter().enumerate().all(|(idx, region)| {
                self.print.region(idx).bottom_solid_layers <= layer.id
                    && region.perimeters.items_count() <= 1
                    && region.fills.items_count() == 0
            })
    }

    /// Print one merged height.
    ///
    /// `layers` are the object and support layers sharing the height,
    /// `layer_tools` the extruders planned for it.
    pub fn process_layer(&mut self, layers: &[LayerToPrint<'a>], layer_tools: &LayerTools) -> Result<String> {
        let (Some(&first_extruder), Some(first)) = (layer_tools.extruders.first(), layers.first()) else {
            return Ok(String::new());
        };
        let c = self.config;
        let print = self.print;
        if self.session.state == DriverState::Initializing {
            self.session.state = DriverState::FirstLayerTransitionPending;
        }

        let primary = layers.iter().find(|l| l.object_layer.is_some()).unwrap_or(first);
        let mut context = LayerContext::from(primary);
        if context.support_layer.is_none() {
            context.support_layer = layers.iter().find_map(|l| l.support_layer);
        }
        let print_z = context.print_z;
        let first_layer = context.id == 0;
        debug!(
            "Layer {} at z = {:.3}: {} object layer(s), extruders {:?}",
            context.id,
            print_z,
            layers.len(),
            layer_tools.extruders
        );

        self.emitter.set_enable_loop_clipping(true);
        if self.spiral_vase.is_some() && layers.len() == 1 && context.support_layer.is_none() {
            let enable = layer_tools.extruders.len() == 1 && self.spiral_vase_enabled(first.object, context.object_layer);
            if let Some(vase) = self.spiral_vase.as_mut() {
                vase.enable(enable);
            }
            self.emitter.set_enable_loop_clipping(!enable);
        }

        let mut gcode = String::from(";LAYER_CHANGE\n");
        let height = match self.session.last_layer_z {
            Some(z) if !first_layer => print_z - z,
            _ => print_z,
        };
        gcode.push_str(&format!(";Z:{}\n;HEIGHT:{}\n", format_number(print_z, 6), format_number(height, 6)));
        let previous_z = self.session.last_layer_z.unwrap_or(0.0);
        self.session.last_layer_z = Some(print_z);

        if !c.before_layer_gcode.is_empty() {
            let ctx = self
                .emitter
                .template_context()
                .with("previous_layer_z", previous_z)
                .with("layer_z", print_z);
            gcode.push_str(&self.emitter.render_template("before_layer_gcode", &c.before_layer_gcode, &ctx));
        }
        gcode.push_str(&self.emitter.change_layer(print_z));
        self.emitter.set_layer(context);
        if !c.layer_gcode.is_empty() {
            let ctx = self
                .emitter
                .template_context()
                .with("previous_layer_z", previous_z)
                .with("layer_num", self.emitter.layer_index());
            gcode.push_str(&self.emitter.render_template("layer_gcode", &c.layer_gcode, &ctx));
        }

        let layer_index = self.emitter.layer_index().max(0) as usize;
        if layer_index < c.disable_fan_first_layers {
            gcode.push_str(&self.emitter.writer_mut().set_fan(0));
        } else if c.cooling {
            gcode.push_str(&self.emitter.writer_mut().set_fan(c.fan_speed));
        }

        if !first_layer && self.session.state == DriverState::FirstLayerTransitionPending {
            gcode.push_str(&self.steady_state_temperatures());
            self.session.state = DriverState::SteadyState;
        }

        if let Some(custom) = &layer_tools.custom_gcode {
            gcode.push_str(&self.custom_gcode(custom, first_extruder));
        }

        let skirt_loops = self.skirt_loops(print_z, first_layer, layer_tools, context.support_layer, first.object);
        let plan = LayerPlan::build(print, c, layers, layer_tools);

        for &extruder_id in &layer_tools.extruders {
            self.check_cancelled()?;
            let finish_layer = layer_tools.extruders.last() == Some(&extruder_id);
            if layer_tools.has_wipe_tower && self.wipe_tower.is_some() {
                gcode.push_str(&self.wipe_tower_tool_change(extruder_id, finish_layer)?);
            }
            gcode.push_str(&self.emitter.set_extruder(extruder_id, print_z));

            if let Some((_, loops)) = skirt_loops.iter().find(|(e, _)| *e == extruder_id) {
                gcode.push_str(&self.extrude_skirt(loops.clone(), first_layer));
            }
            if !self.session.brim_done {
                gcode.push_str(&self.extrude_brim());
            }

            let Some(objects) = plan.objects(extruder_id) else {
                continue;
            };
            let instances = plan.instances_to_print(extruder_id, layers);
            let passes: &[Option<bool>] = if plan.is_anything_overridden {
                &[Some(true), Some(false)]
            } else {
                &[None]
            };
            for &wiping in passes {
                if wiping == Some(false) {
                    gcode.push_str("; PURGING FINISHED\n");
                }
                for instance in &instances {
                    let (Some(ltp), Some(by_extruder)) = (layers.get(instance.layer_idx), objects.get(instance.layer_idx))
                    else {
                        continue;
                    };
                    gcode.push_str(&self.extrude_instance(ltp, by_extruder, instance.instance_id, extruder_id, wiping));
                }
            }
        }

        if let Some(vase) = self.spiral_vase.as_mut() {
            gcode = vase.process_layer(&gcode);
        }
        self.session.layer_count += 1;
        Ok(gcode)
    }

    /// Tool change through the wipe tower; a no-op past the last tower layer.
    fn wipe_tower_tool_change(&mut self, extruder_id: u16, finish_layer: bool) -> Result<String> {
        let need_toolchange = self.emitter.writer().need_toolchange(extruder_id);
        let Some(tower) = self.wipe_tower.as_mut() else {
            return Ok(String::new());
        };
        let data = tower.data();
        match tower.next_tool_change(need_toolchange, finish_layer)? {
            Some(tcr) => {
                debug!("Wipe tower tool change to T{} at z = {:.3}", extruder_id, tcr.print_z);
                self.emitter.append_tool_change_result(tcr, data, Some(extruder_id))
            }
            None => Ok(String::new()),
        }
    }

    /// Steady-state nozzle and bed temperatures, applied once after the first layer.
    fn steady_state_temperatures(&mut self) -> String {
        let c = self.config;
        let mut out = String::new();
        let current = self.emitter.writer().tool_id();
        for id in self.emitter.writer().extruder_ids() {
            if c.single_extruder_multi_material && Some(id) != current {
                continue;
            }
            let temperature = c.extruder(id as usize).temperature;
            if temperature > 0 {
                out.push_str(&self.emitter.writer_mut().set_temperature(temperature, false, Some(id)));
            }
        }
        if c.bed_temperature > 0 {
            out.push_str(&self.emitter.writer_mut().set_bed_temperature(c.bed_temperature, false));
        }
        out
    }

    /// Color change, pause or custom code scheduled before this layer.
    fn custom_gcode(&mut self, custom: &CustomGCode, first_extruder: u16) -> String {
        let c = self.config;
        let mut out = String::new();
        let ctx = self.emitter.template_context().with("color", custom.color.as_str());
        match custom.kind {
            CustomGCodeKind::ColorChange => {
                let target = custom.extruder.checked_sub(1).unwrap_or(first_extruder);
                out.push_str(&format!(";COLOR_CHANGE,T{},{}\n", target, custom.color));
                let ctx = ctx.with("color_change_extruder", target);
                if c.extruders.len() > 1 && target != first_extruder {
                    // A multi-extruder printer cannot swap the filament of an idle tool.
                    out.push_str(&format!("M117 Change filament for Extruder {}\n", target));
                    out.push_str(&self.emitter.render_template("pause_print_gcode", &c.pause_print_gcode, &ctx));
                } else {
                    out.push_str(&self.emitter.render_template("color_change_gcode", &c.color_change_gcode, &ctx));
                }
            }
            CustomGCodeKind::PausePrint => {
                out.push_str(";PAUSE_PRINT\n");
                if !custom.extra.is_empty() {
                    out.push_str(&format!("M117 {}\n", custom.extra));
                }
                out.push_str(&self.emitter.render_template("pause_print_gcode", &c.pause_print_gcode, &ctx));
            }
            CustomGCodeKind::Custom => {
                out.push_str(";CUSTOM_GCODE\n");
                out.push_str(&custom.extra);
                if !custom.extra.ends_with('\n') {
                    out.push('\n');
                }
            }
            CustomGCodeKind::Template => {
                out.push_str(";CUSTOM_GCODE\n");
                out.push_str(&self.emitter.render_template("template_custom_gcode", &c.template_custom_gcode, &ctx));
            }
        }
        out
    }

    /// Skirt loops to print on this layer, per extruder.
    fn skirt_loops(
        &mut self,
        print_z: CoordF,
        first_layer: bool,
        layer_tools: &LayerTools,
        support_layer: Option<&SupportLayer>,
        object: &PrintObject,
    ) -> Vec<(u16, Range<usize>)> {
        let c = self.config;
        let print = self.print;
        if !print.has_skirt() {
            return Vec::new();
        }
        let session = &mut self.session;
        if first_layer {
            if !session.skirt_done.is_empty() {
                return Vec::new();
            }
            let skirt = print.skirt_first_layer.as_ref().unwrap_or(&print.skirt);
            session.skirt_done.push(print_z);
            return skirt_loops_per_extruder(skirt.len(), &layer_tools.extruders);
        }

        let raft = support_layer.is_some_and(|s| s.id < object.raft_layers);
        let within_height = session.skirt_done.len() < c.skirt_height || c.draft_shield;
        let above_last = session.skirt_done.last().is_some_and(|&z| z < print_z - EPSILON);
        match layer_tools.extruders.first() {
            Some(&extruder) if within_height && above_last && (layer_tools.has_object || raft) && !print.skirt.is_empty() => {
                session.skirt_done.push(print_z);
                vec![(extruder, 0..print.skirt.len())]
            }
            _ => Vec::new(),
        }
    }

    fn extrude_skirt(&mut self, loops: Range<usize>, first_layer: bool) -> String {
        let print = self.print;
        let skirt = if first_layer {
            print.skirt_first_layer.as_ref().unwrap_or(&print.skirt)
        } else {
            &print.skirt
        };
        let done = &self.session.skirt_done;
        let height = match done.len() {
            0 => return String::new(),
            1 => done[0],
            n => done[n - 1] - done[n - 2],
        };

        self.emitter.set_origin(PointF::default());
        self.emitter.avoid_crossing_mut().use_external_mp(true);
        let speed = SpeedRequest::Fixed(self.config.support_material_speed);
        let mut out = String::new();
        for entity in skirt.entities.get(loops.clone()).unwrap_or(&[]) {
            let mut entity = entity.clone();
            set_layer_height(&mut entity, height);
            out.push_str(&self.emitter.extrude_entity(&entity, "skirt", speed));
        }
        self.emitter.avoid_crossing_mut().use_external_mp(false);
        if first_layer && loops.start == 0 {
            self.emitter.avoid_crossing_mut().disable_once();
        }
        out
    }

    fn extrude_brim(&mut self) -> String {
        self.session.brim_done = true;
        let print = self.print;
        let brim = &print.brim;
        if brim.is_empty() {
            return String::new();
        }
        self.emitter.set_origin(PointF::default());
        self.emitter.avoid_crossing_mut().use_external_mp(true);
        let speed = SpeedRequest::Fixed(self.config.support_material_speed);
        let out = self.emitter.extrude_collection(brim, "brim", speed);
        self.emitter.avoid_crossing_mut().use_external_mp(false);
        self.emitter.avoid_crossing_mut().disable_once();
        out
    }

    /// Support and islands of one copy, printed with `extruder_id`.
    ///
    /// `wiping` selects the pass when some extrusions are overridden to purge
    /// into the object: `Some(true)` prints only those, `Some(false)` the rest.
    fn extrude_instance(
        &mut self,
        ltp: &LayerToPrint<'a>,
        by_extruder: &ObjectByExtruder<'_>,
        instance_id: usize,
        extruder_id: u16,
        wiping: Option<bool>,
    ) -> String {
        let c = self.config;
        let print = self.print;
        let object = ltp.object;
        let Some(instance) = object.instances.get(instance_id) else {
            return String::new();
        };
        let mut out = String::new();
        let label = format!("{} id:{} copy {}", object.name, ltp.object_idx, instance_id);
        if c.gcode_label_objects {
            out.push_str(&format!("; printing object {}\n", label));
            if self.labels_use_m486() {
                out.push_str(&format!("M486 S{}\n", self.plater_instance_id(ltp.object_idx, instance_id)));
            }
        }

        self.emitter.set_layer(LayerContext::from(ltp));
        self.emitter.set_object(ltp.object_idx, object);
        let copy = (ltp.object_idx, instance.shift);
        if self.session.last_obj_copy != Some(copy) {
            self.emitter.avoid_crossing_mut().use_external_mp_once();
        }
        self.session.last_obj_copy = Some(copy);
        self.emitter.set_origin(instance.shift.to_f64());

        if c.avoid_crossing_perimeters {
            if let Some(layer) = ltp.object_layer {
                let islands: Vec<ExPolygon> = layer
                    .slices
                    .iter()
                    .cloned()
                    .map(|mut s| {
                        s.translate(instance.shift);
                        s
                    })
                    .collect();
                let clearance = 0.5 * c.extruder(extruder_id as usize).nozzle_diameter;
                self.emitter.avoid_crossing_mut().init_layer(&islands, clearance);
            }
        }

        if let Some(support) = by_extruder.support.filter(|_| wiping != Some(true)) {
            out.push_str(&self.support_temperature(ltp));
            out.push_str(&self.emitter.extrude_support(support, by_extruder.support_extrusion_role));
        }

        for island in &by_extruder.islands {
            let regions: Cow<'_, [Region<'_>]> = match wiping {
                Some(wiping) => island.by_region_per_copy(instance_id, extruder_id, wiping),
                None => Cow::Borrowed(island.by_region.as_slice()),
            };
            out.push_str(&self.emitter.extrude_infill(print, &regions, true));
            out.push_str(&self.emitter.extrude_perimeters(print, &regions));
            out.push_str(&self.emitter.extrude_infill(print, &regions, false));
            out.push_str(&self.emitter.extrude_ironing(print, &regions));
        }

        if c.gcode_label_objects {
            out.push_str(&format!("; stop printing object {}\n", label));
            if self.labels_use_m486() {
                out.push_str("M486 S-1\n");
            }
        }
        out
    }

    fn support_temperature(&mut self, ltp: &LayerToPrint<'a>) -> String {
        let Some(id) = self.emitter.writer().tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let on_bed = ltp.support_layer.is_some_and(|s| s.bottom_z() < EPSILON);
        let temperature = if on_bed && ext.first_layer_temperature > 0 {
            ext.first_layer_temperature
        } else {
            ext.temperature
        };
        if temperature > 0 {
            self.emitter.writer_mut().set_temperature(temperature, false, Some(id))
        } else {
            String::new()
        }
    }

    /// Final purge, end scripts and the statistics trailer.
    pub fn finish(&mut self) -> Result<String> {
        let c = self.config;
        let mut out = String::new();
        let purge = self
            .wipe_tower
            .as_ref()
            .and_then(|tower| tower.final_purge().map(|tcr| (tcr, tower.data())));
        if let Some((tcr, data)) = purge {
            out.push_str(&self.emitter.append_tool_change_result(tcr, data, None)?);
        }
        out.push_str(&self.emitter.retract(false));
        out.push_str(&self.emitter.writer_mut().set_fan(0));
        out.push_str(";TYPE:Custom\n");

        if let Some(tool) = self.emitter.writer().tool_id() {
            let ctx = self.emitter.template_context().with("current_extruder_id", tool);
            let ends: Vec<u16> = if c.single_extruder_multi_material {
                vec![tool]
            } else {
                self.emitter.writer().extruder_ids()
            };
            for id in ends {
                let template = &c.extruder(id as usize).end_filament_gcode;
                let ctx = ctx.clone().with("filament_extruder_id", id);
                out.push_str(&self.emitter.render_template("end_filament_gcode", template, &ctx));
            }
            out.push_str(&self.emitter.render_template("end_gcode", &c.end_gcode, &ctx));
        }

        let (mm, cm3) = self.filament_stats();
        let join = |values: &[(u16, CoordF)]| {
            values
                .iter()
                .map(|(_, v)| format!("{:.2}", v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        out.push_str(&format!("\n; filament used [mm] = {}\n", join(&mm)));
        out.push_str(&format!("; filament used [cm3] = {}\n", join(&cm3)));
        let toolchanges = self.emitter.toolchange_count();
        if toolchanges > 0 {
            out.push_str(&format!("; total toolchanges = {}\n", toolchanges));
        }
        out.push_str(&format!("; total layers count = {}\n", self.session.layer_count));
        self.session.state = DriverState::Finished;
        Ok(out)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_to_file(
    print: &Print,
    config: &PrintConfig,
    tmp: &Path,
    progress: Option<&dyn Fn(usize, usize)>,
    cancel: Option<&AtomicBool>,
) -> Result<ExportReport> {
    let mut out = BufWriter::new(File::create(tmp)?);
    let mut driver = LayerExportDriver::new(print, config);
    if let Some(flag) = cancel {
        driver = driver.with_cancel(flag);
    }
    driver.run(&mut out, progress)
}

fn failed_templates_message(path: &Path, failures: &BTreeMap<String, String>) -> String {
    let path = path.display();
    let mut msg = format!("G-code export to {} failed due to invalid custom G-code sections:\n\n", path);
    for (name, error) in failures {
        msg.push_str(&format!("{}\n{}\n", name, error));
    }
    msg.push_str(&format!(
        "\nPlease inspect the file {} for error messages enclosed between\n        \
         !!!!! Failed to process the custom G-code template ...\nand\n        \
         !!!!! End of an error report for the custom G-code template ...\nfor all macros containing errors.",
        path
    ));
    msg
}

/// Export `print` to the G-code file at `path`.
///
/// The file is written next to `path` first and moved into place once
/// complete; on error or cancellation nothing is left behind. Custom G-code
/// template failures are embedded in the file and reported as
/// [`Error::Template`] after it has been written.
pub fn export_gcode(
    print: &Print,
    config: &PrintConfig,
    path: &Path,
    progress: Option<&dyn Fn(usize, usize)>,
    cancel: Option<&AtomicBool>,
) -> Result<ExportReport> {
    config.validate().map_err(Error::Config)?;
    print.validate()?;
    info!("Exporting G-code to {}", path.display());

    let tmp = tmp_path(path);
    let report = match write_to_file(print, config, &tmp, progress, cancel) {
        Ok(report) => report,
        Err(err) => {
            if let Err(rm) = fs::remove_file(&tmp) {
                debug!("Could not remove {}: {}", tmp.display(), rm);
            }
            return Err(err);
        }
    };

    if fs::rename(&tmp, path).is_err() {
        if let Err(err) = fs::copy(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Export(format!(
                "Failed to copy the temporary G-code {} to the output file {}: {}",
                tmp.display(),
                path.display(),
                err
            )));
        }
        fs::remove_file(&tmp)?;
    }

    if !report.template_failures.is_empty() {
        return Err(Error::Template(failed_templates_message(path, &report.template_failures)));
    }
    Ok(report)
}
