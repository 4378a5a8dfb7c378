//! Print configuration types.
//!
//! [`PrintConfig`] gathers every option the G-code pipeline reads, grouped
//! by concern. Per-extruder settings live in [`ExtruderConfig`] entries.
//! Speeds and lengths that can be given either absolutely or as a percentage
//! of another value use [`FloatOrPercent`].

use crate::geometry::PointF;
use crate::CoordF;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value given either in absolute units or as a percentage of a base value.
///
/// Serialized as a JSON number (absolute) or a string such as `"50%"`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FloatOrPercentRepr", into = "FloatOrPercentRepr")]
pub struct FloatOrPercent {
    pub value: CoordF,
    pub percent: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum FloatOrPercentRepr {
    Number(CoordF),
    Text(String),
}

impl FloatOrPercent {
    pub const fn abs(value: CoordF) -> Self {
        Self {
            value,
            percent: false,
        }
    }

    pub const fn percent(value: CoordF) -> Self {
        Self {
            value,
            percent: true,
        }
    }

    /// Resolve against `base` when given as a percentage.
    pub fn get_abs_value(&self, base: CoordF) -> CoordF {
        if self.percent {
            base * self.value / 100.0
        } else {
            self.value
        }
    }
}

impl TryFrom<FloatOrPercentRepr> for FloatOrPercent {
    type Error = String;

    fn try_from(repr: FloatOrPercentRepr) -> Result<Self, Self::Error> {
        match repr {
            FloatOrPercentRepr::Number(v) => Ok(Self::abs(v)),
            FloatOrPercentRepr::Text(s) => {
                let s = s.trim();
                let (number, percent) = match s.strip_suffix('%') {
                    Some(n) => (n.trim(), true),
                    None => (s, false),
                };
                number
                    .parse::<CoordF>()
                    .map(|value| Self { value, percent })
                    .map_err(|_| format!("invalid value '{}', expected a number or a percentage", s))
            }
        }
    }
}

impl From<FloatOrPercent> for FloatOrPercentRepr {
    fn from(v: FloatOrPercent) -> Self {
        if v.percent {
            FloatOrPercentRepr::Text(format!("{}%", v.value))
        } else {
            FloatOrPercentRepr::Number(v.value)
        }
    }
}

impl fmt::Display for FloatOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.percent {
            write!(f, "{}%", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// When a retraction may lift the nozzle, depending on the last surface printed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiftPolicy {
    /// Lift on every retraction.
    #[default]
    Always,
    /// Lift only when leaving a top solid surface.
    OnlyOnTop,
    /// Never lift when leaving a top solid surface.
    NotOnTop,
}

/// G-code flavor/dialect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GCodeFlavor {
    /// Marlin firmware (most common).
    #[default]
    Marlin,
    /// RepRap firmware.
    RepRap,
    /// Klipper firmware.
    Klipper,
    /// Smoothieware firmware.
    Smoothie,
    /// No extrusion axis (for plotters and mills).
    NoExtrusion,
}

/// Seam position preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeamPosition {
    /// Pseudo-random but stable per layer.
    Random,
    /// Close to the seam of the previous layer.
    #[default]
    Aligned,
    /// Rear of the model.
    Rear,
    /// Nearest to the current nozzle position.
    Nearest,
}

/// Settings of one extruder and the filament loaded in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtruderConfig {
    // === Hardware ===
    /// Nozzle diameter (mm).
    pub nozzle_diameter: CoordF,
    /// Nozzle offset relative to the first extruder (mm).
    pub extruder_offset: PointF,
    /// Thinnest layer the nozzle can print (mm), used by the no-seam loop.
    pub min_layer_height: CoordF,

    // === Filament ===
    /// Filament diameter (mm).
    pub filament_diameter: CoordF,
    /// Flow multiplier.
    pub extrusion_multiplier: CoordF,
    /// Nozzle temperature (°C).
    pub temperature: i32,
    /// Nozzle temperature for the first layer (°C).
    pub first_layer_temperature: i32,
    /// Maximum speed for this filament (mm/s), 0 = unlimited.
    pub filament_max_speed: CoordF,
    /// Maximum volumetric speed for this filament (mm³/s), 0 = unlimited.
    pub filament_max_volumetric_speed: CoordF,
    /// Filament dissolves (support interface material).
    pub soluble: bool,
    /// Template run after switching to this filament.
    pub start_filament_gcode: String,
    /// Template run before switching away from this filament.
    pub end_filament_gcode: String,

    // === Retraction ===
    /// Retraction length (mm).
    pub retract_length: CoordF,
    /// Retraction length before a tool change (mm).
    pub retract_length_toolchange: CoordF,
    /// Retraction speed (mm/s).
    pub retract_speed: CoordF,
    /// Deretraction speed (mm/s), 0 = same as retraction.
    pub deretract_speed: CoordF,
    /// Extra length pushed after a retraction (mm).
    pub retract_restart_extra: CoordF,
    /// Extra length pushed after a tool change retraction (mm).
    pub retract_restart_extra_toolchange: CoordF,
    /// Minimum travel distance that triggers a retraction (mm).
    pub retract_before_travel: CoordF,
    /// Share of the retraction done before wiping (%).
    pub retract_before_wipe: CoordF,
    /// Z lift on retraction (mm).
    pub retract_lift: CoordF,
    /// Only lift above this Z (mm).
    pub retract_lift_above: CoordF,
    /// Only lift below this Z (mm), 0 = no limit.
    pub retract_lift_below: CoordF,
    /// Always lift on the first layer.
    pub retract_lift_first_layer: bool,
    /// Lift depending on the surface just printed.
    pub retract_lift_top: LiftPolicy,

    // === Wipe ===
    /// Wipe while retracting.
    pub wipe: bool,
    /// Wipe speed (mm/s), 0 = 80% of travel speed.
    pub wipe_speed: CoordF,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self::STOCK
    }
}

impl ExtruderConfig {
    /// Stock settings for a 0.4 mm nozzle and 1.75 mm filament.
    pub const STOCK: ExtruderConfig = ExtruderConfig {
        nozzle_diameter: 0.4,
        extruder_offset: PointF::new(0.0, 0.0),
        min_layer_height: 0.07,

        filament_diameter: 1.75,
        extrusion_multiplier: 1.0,
        temperature: 210,
        first_layer_temperature: 215,
        filament_max_speed: 0.0,
        filament_max_volumetric_speed: 0.0,
        soluble: false,
        start_filament_gcode: String::new(),
        end_filament_gcode: String::new(),

        retract_length: 2.0,
        retract_length_toolchange: 10.0,
        retract_speed: 40.0,
        deretract_speed: 0.0,
        retract_restart_extra: 0.0,
        retract_restart_extra_toolchange: 0.0,
        retract_before_travel: 2.0,
        retract_before_wipe: 0.0,
        retract_lift: 0.0,
        retract_lift_above: 0.0,
        retract_lift_below: 0.0,
        retract_lift_first_layer: false,
        retract_lift_top: LiftPolicy::Always,

        wipe: false,
        wipe_speed: 0.0,
    };
}

impl ExtruderConfig {
    /// Builder method: enable wipe with the given speed.
    pub fn wipe(mut self, enabled: bool, speed: CoordF) -> Self {
        self.wipe = enabled;
        self.wipe_speed = speed;
        self
    }

    /// Builder method: set retraction length and speed.
    pub fn retract(mut self, length: CoordF, speed: CoordF) -> Self {
        self.retract_length = length;
        self.retract_speed = speed;
        self
    }

    /// Builder method: set lift height and policy.
    pub fn lift(mut self, lift: CoordF, policy: LiftPolicy) -> Self {
        self.retract_lift = lift;
        self.retract_lift_top = policy;
        self
    }

    /// Filament cross-section (mm²).
    pub fn filament_crossection(&self) -> CoordF {
        self.filament_diameter * self.filament_diameter * std::f64::consts::PI / 4.0
    }
}

/// Main print configuration for G-code export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintConfig {
    // === Machine ===
    /// G-code flavor.
    pub gcode_flavor: GCodeFlavor,
    /// Use relative extrusion mode (M83).
    pub use_relative_e_distances: bool,
    /// Emit E values as volumes (mm³) instead of filament lengths.
    pub use_volumetric_e: bool,
    /// Use G10/G11 instead of explicit E moves for retractions.
    pub use_firmware_retraction: bool,
    /// Add explanatory comments to emitted lines.
    pub gcode_comments: bool,
    /// Surround each object instance with start/stop comments.
    pub gcode_label_objects: bool,
    /// Z offset added to every emitted Z (mm).
    pub z_offset: CoordF,
    /// Print origin on the bed (mm).
    pub origin: PointF,
    /// One entry per extruder.
    pub extruders: Vec<ExtruderConfig>,
    /// Several filaments share one nozzle.
    pub single_extruder_multi_material: bool,
    /// Bed temperature (°C).
    pub bed_temperature: u32,
    /// First layer bed temperature (°C).
    pub first_layer_bed_temperature: u32,

    // === Speeds (mm/s) ===
    pub travel_speed: CoordF,
    /// Vertical travel speed, 0 = same as travel.
    pub travel_speed_z: CoordF,
    pub perimeter_speed: CoordF,
    /// Percentages are of `perimeter_speed` (or of the volumetric speed in auto mode).
    pub external_perimeter_speed: FloatOrPercent,
    /// Percentages are of `perimeter_speed`.
    pub small_perimeter_speed: FloatOrPercent,
    /// Loops shorter than this print entirely at the small perimeter speed.
    /// Percentages are of the nozzle diameter.
    pub small_perimeter_min_length: FloatOrPercent,
    /// Loops longer than this are not slowed down.
    pub small_perimeter_max_length: FloatOrPercent,
    pub overhangs_speed: FloatOrPercent,
    pub bridge_speed: CoordF,
    /// Percentages are of `bridge_speed`.
    pub bridge_speed_internal: FloatOrPercent,
    pub infill_speed: CoordF,
    /// Percentages are of `infill_speed`.
    pub solid_infill_speed: FloatOrPercent,
    /// Percentages are of the solid infill speed.
    pub top_solid_infill_speed: FloatOrPercent,
    pub thin_walls_speed: CoordF,
    pub gap_fill_speed: CoordF,
    pub ironing_speed: CoordF,
    pub support_material_speed: CoordF,
    /// Percentages are of `support_material_speed`.
    pub support_material_interface_speed: FloatOrPercent,
    /// Skirt and brim speed.
    pub brim_speed: CoordF,
    pub milling_speed: CoordF,
    /// Upper bound for automatic speeds.
    pub max_print_speed: CoordF,
    /// Target volumetric rate for roles with a speed of 0 (mm³/s), 0 = off.
    pub volumetric_speed: CoordF,
    /// Global volumetric ceiling (mm³/s), 0 = off.
    pub max_volumetric_speed: CoordF,

    // === First layer ===
    /// Percentages are of the role speed.
    pub first_layer_speed: FloatOrPercent,
    /// Percentages are of the role speed.
    pub first_layer_infill_speed: FloatOrPercent,
    /// Absolute floor for every first layer speed.
    pub first_layer_min_speed: CoordF,
    /// Flow multiplier on the first layer.
    pub first_layer_flow_ratio: CoordF,

    // === Acceleration (mm/s²), 0 = leave unchanged ===
    pub default_acceleration: CoordF,
    pub first_layer_acceleration: CoordF,
    pub perimeter_acceleration: CoordF,
    pub bridge_acceleration: CoordF,
    pub infill_acceleration: CoordF,
    pub travel_acceleration: CoordF,

    // === Extrusion details ===
    /// External perimeter corner flow reduction (0-100%).
    pub external_perimeter_cut_corners: CoordF,
    /// Corners turning less than this (degrees) keep the full flow.
    pub corner_cut_threshold: CoordF,
    /// Shortest segment worth emitting (mm), 0 = keep everything.
    pub min_length: CoordF,
    /// Gap left at the seam of a loop. Percentages are of the nozzle diameter.
    pub seam_gap: FloatOrPercent,
    pub seam_position: SeamPosition,
    /// Number of perimeters; the seam hiding move needs at least two.
    pub perimeters: usize,

    // === Travel ===
    pub avoid_crossing_perimeters: bool,
    /// Do not reroute travels on the first layer.
    pub avoid_crossing_not_first_layer: bool,
    /// Give up rerouting when the detour exceeds this share of the direct travel (%), 0 = no limit.
    pub avoid_crossing_max_detour: CoordF,
    /// Skip retractions for travels fully inside sparse infill.
    pub only_retract_when_crossing_perimeters: bool,

    // === Skirt ===
    /// Layers of skirt, counted from the first.
    pub skirt_height: usize,
    /// Skirt runs up the whole print.
    pub draft_shield: bool,

    // === Cooling ===
    /// Emit cooling markers for a downstream cooling pass.
    pub cooling: bool,
    /// Fan speed for regular layers (%).
    pub fan_speed: u8,
    /// Keep the fan off for this many first layers.
    pub disable_fan_first_layers: usize,
    /// Advance fan increases by this many seconds, 0 = off.
    pub fan_speedup_time: CoordF,
    /// Split moves so advanced fan commands land exactly on time.
    pub fan_speedup_split: bool,
    /// Full-power kick before spinning up from zero (s), 0 = off.
    pub fan_kickstart: CoordF,

    // === Modes ===
    pub spiral_vase: bool,
    /// Keep going when a layer has nothing to print.
    pub allow_empty_layers: bool,
    pub wipe_tower: bool,

    // === Custom G-code templates ===
    pub start_gcode: String,
    pub end_gcode: String,
    pub before_layer_gcode: String,
    pub layer_gcode: String,
    pub feature_gcode: String,
    pub toolchange_gcode: String,
    pub between_objects_gcode: String,
    pub color_change_gcode: String,
    pub pause_print_gcode: String,
    pub template_custom_gcode: String,
}

impl PrintConfig {
    /// Create a new PrintConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the extruder list.
    pub fn extruders(mut self, extruders: Vec<ExtruderConfig>) -> Self {
        self.extruders = extruders;
        self
    }

    /// Builder method: set travel speed.
    pub fn travel_speed(mut self, speed: CoordF) -> Self {
        self.travel_speed = speed;
        self
    }

    /// Builder method: set the volumetric ceiling.
    pub fn max_volumetric_speed(mut self, speed: CoordF) -> Self {
        self.max_volumetric_speed = speed;
        self
    }

    /// Builder method: set the first layer minimum speed.
    pub fn first_layer_min_speed(mut self, speed: CoordF) -> Self {
        self.first_layer_min_speed = speed;
        self
    }

    /// Builder method: enable or disable avoid crossing perimeters.
    pub fn avoid_crossing_perimeters(mut self, enabled: bool) -> Self {
        self.avoid_crossing_perimeters = enabled;
        self
    }

    /// Builder method: set relative extrusion mode (M83).
    pub fn use_relative_e_distances(mut self, relative: bool) -> Self {
        self.use_relative_e_distances = relative;
        self
    }

    /// Builder method: set the fan advance time.
    pub fn fan_speedup_time(mut self, seconds: CoordF) -> Self {
        self.fan_speedup_time = seconds;
        self
    }

    /// Builder method: enable spiral vase mode.
    pub fn spiral_vase(mut self, enabled: bool) -> Self {
        self.spiral_vase = enabled;
        self
    }

    /// Settings of extruder `id`, falling back to the first one.
    pub fn extruder(&self, id: usize) -> &ExtruderConfig {
        self.extruders
            .get(id)
            .or_else(|| self.extruders.first())
            .unwrap_or(&DEFAULT_EXTRUDER)
    }

    /// More than one physical or virtual extruder is configured.
    pub fn has_multiple_extruders(&self) -> bool {
        self.extruders.len() > 1
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.extruders.is_empty() {
            return Err("At least one extruder must be configured".into());
        }
        for (i, e) in self.extruders.iter().enumerate() {
            if e.nozzle_diameter <= 0.0 {
                return Err(format!("Extruder {}: nozzle diameter must be positive", i));
            }
            if e.filament_diameter <= 0.0 {
                return Err(format!("Extruder {}: filament diameter must be positive", i));
            }
            if e.extrusion_multiplier <= 0.0 {
                return Err(format!("Extruder {}: extrusion multiplier must be positive", i));
            }
            if e.retract_speed <= 0.0 && e.retract_length > 0.0 {
                return Err(format!("Extruder {}: retraction speed must be positive", i));
            }
            if !(0.0..=100.0).contains(&e.retract_before_wipe) {
                return Err(format!("Extruder {}: retract before wipe must be within 0-100%", i));
            }
        }
        if self.travel_speed <= 0.0 {
            return Err("Travel speed must be positive".into());
        }
        if self.max_print_speed <= 0.0 {
            return Err("Max print speed must be positive".into());
        }
        if self.first_layer_flow_ratio <= 0.0 {
            return Err("First layer flow ratio must be positive".into());
        }
        if !(0.0..=100.0).contains(&self.external_perimeter_cut_corners) {
            return Err("Cut corners must be within 0-100%".into());
        }
        if self.fan_speed > 100 {
            return Err("Fan speed is a percentage".into());
        }
        let min = self.small_perimeter_min_length.get_abs_value(1.0);
        let max = self.small_perimeter_max_length.get_abs_value(1.0);
        if self.small_perimeter_min_length.percent == self.small_perimeter_max_length.percent
            && min > max
        {
            return Err("Small perimeter min length exceeds max length".into());
        }
        Ok(())
    }
}

static DEFAULT_EXTRUDER: ExtruderConfig = ExtruderConfig::STOCK;

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            // Machine
            gcode_flavor: GCodeFlavor::Marlin,
            use_relative_e_distances: true,
            use_volumetric_e: false,
            use_firmware_retraction: false,
            gcode_comments: false,
            gcode_label_objects: true,
            z_offset: 0.0,
            origin: PointF::new(0.0, 0.0),
            extruders: vec![ExtruderConfig::default()],
            single_extruder_multi_material: false,
            bed_temperature: 60,
            first_layer_bed_temperature: 65,

            // Speeds
            travel_speed: 130.0,
            travel_speed_z: 0.0,
            perimeter_speed: 60.0,
            external_perimeter_speed: FloatOrPercent::percent(50.0),
            small_perimeter_speed: FloatOrPercent::abs(15.0),
            small_perimeter_min_length: FloatOrPercent::abs(6.0),
            small_perimeter_max_length: FloatOrPercent::abs(20.0),
            overhangs_speed: FloatOrPercent::abs(20.0),
            bridge_speed: 60.0,
            bridge_speed_internal: FloatOrPercent::percent(150.0),
            infill_speed: 80.0,
            solid_infill_speed: FloatOrPercent::abs(20.0),
            top_solid_infill_speed: FloatOrPercent::abs(15.0),
            thin_walls_speed: 30.0,
            gap_fill_speed: 20.0,
            ironing_speed: 15.0,
            support_material_speed: 60.0,
            support_material_interface_speed: FloatOrPercent::percent(100.0),
            brim_speed: 30.0,
            milling_speed: 30.0,
            max_print_speed: 80.0,
            volumetric_speed: 0.0,
            max_volumetric_speed: 0.0,

            // First layer
            first_layer_speed: FloatOrPercent::abs(30.0),
            first_layer_infill_speed: FloatOrPercent::abs(30.0),
            first_layer_min_speed: 0.0,
            first_layer_flow_ratio: 1.0,

            // Acceleration
            default_acceleration: 0.0,
            first_layer_acceleration: 0.0,
            perimeter_acceleration: 0.0,
            bridge_acceleration: 0.0,
            infill_acceleration: 0.0,
            travel_acceleration: 0.0,

            // Extrusion details
            external_perimeter_cut_corners: 0.0,
            corner_cut_threshold: 60.0,
            min_length: 0.035,
            seam_gap: FloatOrPercent::percent(15.0),
            seam_position: SeamPosition::Aligned,
            perimeters: 3,

            // Travel
            avoid_crossing_perimeters: false,
            avoid_crossing_not_first_layer: true,
            avoid_crossing_max_detour: 0.0,
            only_retract_when_crossing_perimeters: false,

            // Skirt
            skirt_height: 1,
            draft_shield: false,

            // Cooling
            cooling: true,
            fan_speed: 100,
            disable_fan_first_layers: 1,
            fan_speedup_time: 0.0,
            fan_speedup_split: false,
            fan_kickstart: 0.0,

            // Modes
            spiral_vase: false,
            allow_empty_layers: false,
            wipe_tower: false,

            // Templates
            start_gcode: "G28 ; home all axes\nG1 Z5 F5000 ; lift nozzle".into(),
            end_gcode: "M104 S0 ; turn off temperature\nG28 X0 ; home X axis\nM84 ; disable motors"
                .into(),
            before_layer_gcode: String::new(),
            layer_gcode: String::new(),
            feature_gcode: String::new(),
            toolchange_gcode: String::new(),
            between_objects_gcode: String::new(),
            color_change_gcode: "M600".into(),
            pause_print_gcode: "M601".into(),
            template_custom_gcode: String::new(),
        }
    }
}

impl fmt::Display for PrintConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrintConfig(extruders={}, nozzle={:.2}mm, travel={:.0}mm/s)",
            self.extruders.len(),
            self.extruder(0).nozzle_diameter,
            self.travel_speed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_config_default() {
        let config = PrintConfig::default();
        assert_eq!(config.extruders.len(), 1);
        assert!((config.extruder(0).nozzle_diameter - 0.4).abs() < 1e-6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_print_config_builder() {
        let config = PrintConfig::new()
            .travel_speed(200.0)
            .max_volumetric_speed(12.0)
            .first_layer_min_speed(10.0)
            .avoid_crossing_perimeters(true);

        assert!((config.travel_speed - 200.0).abs() < 1e-6);
        assert!((config.max_volumetric_speed - 12.0).abs() < 1e-6);
        assert!((config.first_layer_min_speed - 10.0).abs() < 1e-6);
        assert!(config.avoid_crossing_perimeters);
    }

    #[test]
    fn test_print_config_validation() {
        let mut config = PrintConfig::default();
        config.extruders[0].nozzle_diameter = 0.0;
        assert!(config.validate().is_err());

        let mut config = PrintConfig::default();
        config.extruders.clear();
        assert!(config.validate().is_err());

        let mut config = PrintConfig::default();
        config.external_perimeter_cut_corners = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extruder_fallback() {
        let config = PrintConfig::default();
        assert!((config.extruder(5).filament_diameter - 1.75).abs() < 1e-9);
        assert!(!config.has_multiple_extruders());
    }

    #[test]
    fn test_float_or_percent_serde() {
        let v: FloatOrPercent = serde_json::from_str("\"50%\"").unwrap();
        assert!(v.percent);
        assert!((v.get_abs_value(60.0) - 30.0).abs() < 1e-9);

        let v: FloatOrPercent = serde_json::from_str("25").unwrap();
        assert!(!v.percent);
        assert!((v.get_abs_value(60.0) - 25.0).abs() < 1e-9);

        assert!(serde_json::from_str::<FloatOrPercent>("\"fast\"").is_err());
        assert_eq!(serde_json::to_string(&FloatOrPercent::percent(15.0)).unwrap(), "\"15%\"");
    }

    #[test]
    fn test_config_json_partial() {
        let config: PrintConfig =
            serde_json::from_str(r#"{"travel_speed": 180, "external_perimeter_speed": "40%"}"#)
                .unwrap();
        assert!((config.travel_speed - 180.0).abs() < 1e-9);
        assert!((config.external_perimeter_speed.get_abs_value(config.perimeter_speed) - 24.0).abs() < 1e-9);
        assert!((config.infill_speed - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_lift_policy_default() {
        assert_eq!(LiftPolicy::default(), LiftPolicy::Always);
        assert_eq!(SeamPosition::default(), SeamPosition::Aligned);
        assert_eq!(GCodeFlavor::default(), GCodeFlavor::Marlin);
    }
}
