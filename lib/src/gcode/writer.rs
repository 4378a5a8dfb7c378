//! Machine state writer.
//!
//! [`GCodeWriter`] tracks what the printer believes its state to be
//! (position, active tool, extrusion axis, lift, fan, temperatures,
//! acceleration) and renders single commands. Every method that changes state
//! returns the text that performs the change, terminated by a newline, or an
//! empty string when the machine is already in the requested state.
//!
//! The writer is owned by one export run and handed down as `&mut`; nothing
//! else mutates machine state.

use crate::config::{GCodeFlavor, PrintConfig};
use crate::geometry::PointF;
use crate::{CoordF, EPSILON};

const XYZ_DECIMALS: usize = 3;
const E_DECIMALS: usize = 5;

/// Format `value` with at most `decimals` digits, trimming trailing zeros.
pub fn format_number(value: CoordF, decimals: usize) -> String {
    let mut s = format!("{:.*}", decimals, value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if s == "-0" {
        s = "0".into();
    }
    s
}

#[inline]
pub(crate) fn fmt_xyz(value: CoordF) -> String {
    format_number(value, XYZ_DECIMALS)
}

#[inline]
pub(crate) fn fmt_e(value: CoordF) -> String {
    format_number(value, E_DECIMALS)
}

#[inline]
pub(crate) fn fmt_f(value: CoordF) -> String {
    format_number(value.round(), 0)
}

/// Extrusion axis bookkeeping for one physical or virtual extruder.
#[derive(Debug, Clone, PartialEq)]
pub struct Extruder {
    id: u16,
    /// Current E position as written to the output.
    e: CoordF,
    /// Sum of all extrusion deltas (including negative ones).
    absolute_e: CoordF,
    /// Length currently retracted.
    retracted: CoordF,
    /// Extra length to push on the next unretract.
    restart_extra: CoordF,
    relative_e: bool,
    volumetric_e: bool,
    e_per_mm3: CoordF,
    filament_crossection: CoordF,
}

impl Extruder {
    pub fn new(id: u16, config: &PrintConfig) -> Self {
        let ext = config.extruder(id as usize);
        let filament_crossection = ext.filament_crossection();
        let e_per_mm3 = if config.use_volumetric_e {
            ext.extrusion_multiplier
        } else {
            ext.extrusion_multiplier / filament_crossection
        };
        Self {
            id,
            e: 0.0,
            absolute_e: 0.0,
            retracted: 0.0,
            restart_extra: 0.0,
            relative_e: config.use_relative_e_distances,
            volumetric_e: config.use_volumetric_e,
            e_per_mm3,
            filament_crossection,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn e(&self) -> CoordF {
        self.e
    }

    pub fn absolute_e(&self) -> CoordF {
        self.absolute_e
    }

    pub fn retracted(&self) -> CoordF {
        self.retracted
    }

    /// Filament length per extruded volume.
    pub fn e_per_mm3(&self) -> CoordF {
        self.e_per_mm3
    }

    /// Advance the axis by `de`; negative deltas count as retraction.
    pub fn extrude(&mut self, de: CoordF) -> CoordF {
        if self.relative_e {
            self.e = 0.0;
        }
        self.e += de;
        self.absolute_e += de;
        if de < 0.0 {
            self.retracted -= de;
        }
        de
    }

    /// Retract up to `length` in total. Returns the length actually pulled back
    /// (zero when already retracted that far).
    pub fn retract(&mut self, length: CoordF, restart_extra: CoordF) -> CoordF {
        if self.relative_e {
            self.e = 0.0;
        }
        let to_retract = (length - self.retracted).max(0.0);
        if to_retract > 0.0 {
            self.e -= to_retract;
            self.absolute_e -= to_retract;
            self.retracted += to_retract;
            self.restart_extra = restart_extra;
        }
        to_retract
    }

    /// Push back everything retracted plus the restart extra.
    pub fn unretract(&mut self) -> CoordF {
        let de = self.retracted + self.restart_extra;
        self.extrude(de);
        self.retracted = 0.0;
        self.restart_extra = 0.0;
        de
    }

    pub fn reset_e(&mut self) {
        self.e = 0.0;
    }

    /// Filament consumed so far (mm); material still retracted is not used up.
    pub fn used_filament(&self) -> CoordF {
        if self.volumetric_e {
            (self.absolute_e + self.retracted) / self.filament_crossection
        } else {
            self.absolute_e + self.retracted
        }
    }

    /// Volume consumed so far (mm³).
    pub fn extruded_volume(&self) -> CoordF {
        if self.volumetric_e {
            self.absolute_e + self.retracted
        } else {
            self.used_filament() * self.filament_crossection
        }
    }
}

/// Renders commands and tracks the believed machine state.
#[derive(Debug, Clone)]
pub struct GCodeWriter {
    config: PrintConfig,
    extruders: Vec<Extruder>,
    /// Index into `extruders` of the active tool.
    tool: Option<usize>,
    pos: PointF,
    z: CoordF,
    /// Current lift above the nominal layer Z.
    lifted: CoordF,
    last_fan: Option<u8>,
    last_temperature: Option<i32>,
    last_bed_temperature: Option<u32>,
    bed_temperature_reached: bool,
    /// Value the next move should run with.
    current_acceleration: CoordF,
    /// Value last written to the output.
    last_acceleration: CoordF,
}

impl GCodeWriter {
    pub fn new(config: &PrintConfig) -> Self {
        Self {
            config: config.clone(),
            extruders: Vec::new(),
            tool: None,
            pos: PointF::default(),
            z: 0.0,
            lifted: 0.0,
            last_fan: None,
            last_temperature: None,
            last_bed_temperature: None,
            bed_temperature_reached: false,
            current_acceleration: 0.0,
            last_acceleration: 0.0,
        }
    }

    pub fn config(&self) -> &PrintConfig {
        &self.config
    }

    /// Register the extruders used by the print (0-based ids, any order).
    pub fn set_extruders(&mut self, mut ids: Vec<u16>) {
        ids.sort_unstable();
        ids.dedup();
        self.extruders = ids.into_iter().map(|id| Extruder::new(id, &self.config)).collect();
    }

    pub fn extruders(&self) -> &[Extruder] {
        &self.extruders
    }

    pub fn extruder_ids(&self) -> Vec<u16> {
        self.extruders.iter().map(Extruder::id).collect()
    }

    /// The active tool, if any.
    pub fn tool(&self) -> Option<&Extruder> {
        self.tool.map(|i| &self.extruders[i])
    }

    pub fn tool_id(&self) -> Option<u16> {
        self.tool().map(Extruder::id)
    }

    /// True when the active tool extrudes filament (not a mill or similar).
    pub fn tool_is_extruder(&self) -> bool {
        self.tool.is_some() && self.config.gcode_flavor != GCodeFlavor::NoExtrusion
    }

    pub fn multiple_extruders(&self) -> bool {
        self.extruders.len() > 1 || self.config.has_multiple_extruders()
    }

    pub fn position(&self) -> PointF {
        self.pos
    }

    pub fn z(&self) -> CoordF {
        self.z
    }

    pub fn lifted(&self) -> CoordF {
        self.lifted
    }

    /// Override the believed position after externally generated moves.
    pub fn set_position(&mut self, pos: PointF, z: CoordF) {
        self.pos = pos;
        self.z = z;
    }

    fn comment(&self, text: &str) -> String {
        if self.config.gcode_comments && !text.is_empty() {
            format!(" ; {}", text)
        } else {
            String::new()
        }
    }

    fn tool_mut(&mut self) -> Option<&mut Extruder> {
        match self.tool {
            Some(i) => self.extruders.get_mut(i),
            None => None,
        }
    }

    /// Units, positioning and extrusion mode header.
    pub fn preamble(&mut self) -> String {
        let mut out = String::from("G21 ; set units to millimeters\nG90 ; use absolute coordinates\n");
        if self.config.gcode_flavor != GCodeFlavor::NoExtrusion {
            if self.config.use_relative_e_distances {
                out.push_str("M83 ; use relative distances for extrusion\n");
            } else {
                out.push_str("M82 ; use absolute distances for extrusion\n");
            }
            out.push_str(&self.reset_e(true));
        }
        out
    }

    /// Nozzle temperature; skipped when unchanged and not waiting.
    pub fn set_temperature(&mut self, temperature: i32, wait: bool, tool: Option<u16>) -> String {
        if !wait && self.last_temperature == Some(temperature) {
            return String::new();
        }
        self.last_temperature = Some(temperature);
        let reprap = self.config.gcode_flavor == GCodeFlavor::RepRap;
        let (code, comment) = if wait {
            ("M109", "set temperature and wait for it to be reached")
        } else if reprap {
            ("G10", "set temperature")
        } else {
            ("M104", "set temperature")
        };
        let mut out = String::from(code);
        if reprap && code == "G10" {
            out.push_str(&format!(" P{}", tool.unwrap_or(0)));
        }
        out.push_str(&format!(" S{}", temperature));
        if let Some(t) = tool {
            if self.multiple_extruders() && !self.config.single_extruder_multi_material && !reprap {
                out.push_str(&format!(" T{}", t));
            }
        }
        out.push_str(&self.comment(comment));
        out.push('\n');
        if reprap && wait {
            out.push_str("M116 ; wait for temperature to be reached\n");
        }
        out
    }

    /// Bed temperature; skipped when unchanged and either not waiting or
    /// already waited for.
    pub fn set_bed_temperature(&mut self, temperature: u32, wait: bool) -> String {
        if self.last_bed_temperature == Some(temperature) && (!wait || self.bed_temperature_reached) {
            return String::new();
        }
        self.last_bed_temperature = Some(temperature);
        self.bed_temperature_reached = wait;
        let (code, comment) = if wait {
            ("M190", "set bed temperature and wait for it to be reached")
        } else {
            ("M140", "set bed temperature")
        };
        format!("{} S{}{}\n", code, temperature, self.comment(comment))
    }

    /// Part cooling fan as a percentage, only written on change.
    pub fn set_fan(&mut self, percent: u8) -> String {
        let percent = percent.min(100);
        if self.last_fan == Some(percent) {
            return String::new();
        }
        self.last_fan = Some(percent);
        if percent == 0 {
            format!("M107{}\n", self.comment("disable fan"))
        } else {
            let pwm = (255.0 * percent as CoordF / 100.0).round() as u32;
            format!("M106 S{}{}\n", pwm, self.comment("enable fan"))
        }
    }

    pub fn last_fan(&self) -> Option<u8> {
        self.last_fan
    }

    /// Remember the acceleration for the next move. Zero leaves it unchanged.
    pub fn set_acceleration(&mut self, acceleration: CoordF) {
        if acceleration > 0.0 {
            self.current_acceleration = acceleration;
        }
    }

    pub fn acceleration(&self) -> CoordF {
        self.current_acceleration
    }

    /// Emit the pending acceleration change, if any.
    pub fn write_acceleration(&mut self) -> String {
        if self.current_acceleration <= 0.0
            || (self.current_acceleration - self.last_acceleration).abs() < EPSILON
        {
            return String::new();
        }
        self.last_acceleration = self.current_acceleration;
        let a = fmt_f(self.current_acceleration);
        match self.config.gcode_flavor {
            GCodeFlavor::RepRap => format!("M204 P{} T{}{}\n", a, a, self.comment("adjust acceleration")),
            _ => format!("M204 S{}{}\n", a, self.comment("adjust acceleration")),
        }
    }

    /// Reset the extrusion axis. Only absolute mode needs a `G92 E0`.
    pub fn reset_e(&mut self, force: bool) -> String {
        if self.config.gcode_flavor == GCodeFlavor::NoExtrusion {
            return String::new();
        }
        if let Some(tool) = self.tool_mut() {
            if tool.e() == 0.0 && !force {
                return String::new();
            }
            tool.reset_e();
        }
        if self.config.use_relative_e_distances {
            String::new()
        } else {
            format!("G92 E0{}\n", self.comment("reset extrusion distance"))
        }
    }

    pub fn need_toolchange(&self, id: u16) -> bool {
        self.tool_id() != Some(id)
    }

    /// Switch the active tool; the command itself only appears with several extruders.
    pub fn toolchange(&mut self, id: u16) -> String {
        let idx = match self.extruders.iter().position(|e| e.id() == id) {
            Some(idx) => idx,
            None => {
                self.extruders.push(Extruder::new(id, &self.config));
                self.extruders.sort_by_key(Extruder::id);
                self.extruders.iter().position(|e| e.id() == id).unwrap_or(0)
            }
        };
        self.tool = Some(idx);
        let mut out = String::new();
        if self.multiple_extruders() {
            match self.config.gcode_flavor {
                GCodeFlavor::Klipper => {
                    let name = if id == 0 { "extruder".to_string() } else { format!("extruder{}", id) };
                    out.push_str(&format!("ACTIVATE_EXTRUDER EXTRUDER={}", name));
                }
                _ => out.push_str(&format!("T{}", id)),
            }
            out.push_str(&self.comment("change extruder"));
            out.push('\n');
            out.push_str(&self.reset_e(true));
        }
        out
    }

    /// Feed rate change (mm/min) with an optional trailing cooling marker.
    pub fn set_speed(&mut self, f: CoordF, comment: &str, cooling_marker: &str) -> String {
        format!("G1 F{}{}{}\n", fmt_f(f), self.comment(comment), cooling_marker)
    }

    pub fn travel_to_xy(&mut self, point: PointF, comment: &str) -> String {
        let mut out = self.write_acceleration();
        self.pos = point;
        out.push_str(&format!(
            "G1 X{} Y{} F{}{}\n",
            fmt_xyz(point.x),
            fmt_xyz(point.y),
            fmt_f(self.config.travel_speed * 60.0),
            self.comment(comment)
        ));
        out
    }

    pub fn travel_to_xyz(&mut self, point: PointF, z: CoordF, comment: &str) -> String {
        if (point.x - self.pos.x).abs() < EPSILON && (point.y - self.pos.y).abs() < EPSILON {
            return self.travel_to_z(z, comment);
        }
        if (z - self.z).abs() < EPSILON {
            return self.travel_to_xy(point, comment);
        }
        // Going down into the lifted band only lowers the pending lift.
        if self.lifted > 0.0 {
            let nominal = self.z - self.lifted;
            if z >= nominal + EPSILON && z <= self.z - EPSILON {
                self.lifted -= z - nominal;
                if self.lifted.abs() < EPSILON {
                    self.lifted = 0.0;
                }
                return self.travel_to_xy(point, comment);
            }
        }
        self.lifted = 0.0;
        let mut out = self.write_acceleration();
        self.pos = point;
        self.z = z;
        out.push_str(&format!(
            "G1 X{} Y{} Z{} F{}{}\n",
            fmt_xyz(point.x),
            fmt_xyz(point.y),
            fmt_xyz(z),
            fmt_f(self.config.travel_speed * 60.0),
            self.comment(comment)
        ));
        out
    }

    /// False when `z` lies inside the current lift band, where moving to it
    /// only consumes part of the lift.
    pub fn will_move_z(&self, z: CoordF) -> bool {
        if self.lifted > 0.0 {
            let nominal = self.z - self.lifted;
            if z >= nominal + EPSILON && z <= self.z - EPSILON {
                return false;
            }
        }
        true
    }

    pub fn travel_to_z(&mut self, z: CoordF, comment: &str) -> String {
        if !self.will_move_z(z) {
            let nominal = self.z - self.lifted;
            self.lifted -= z - nominal;
            if self.lifted.abs() < EPSILON {
                self.lifted = 0.0;
            }
            return String::new();
        }
        self.lifted = 0.0;
        self.raw_travel_to_z(z, comment)
    }

    fn raw_travel_to_z(&mut self, z: CoordF, comment: &str) -> String {
        self.z = z;
        let speed = if self.config.travel_speed_z > 0.0 {
            self.config.travel_speed_z
        } else {
            self.config.travel_speed
        };
        format!("G1 Z{} F{}{}\n", fmt_xyz(z), fmt_f(speed * 60.0), self.comment(comment))
    }

    /// Extruding move; `de` is the filament delta for the move.
    pub fn extrude_to_xy(&mut self, point: PointF, de: CoordF, comment: &str) -> String {
        let mut out = self.write_acceleration();
        self.pos = point;
        out.push_str(&format!("G1 X{} Y{}", fmt_xyz(point.x), fmt_xyz(point.y)));
        out.push_str(&self.e_field(de));
        out.push_str(&self.comment(comment));
        out.push('\n');
        out
    }

    pub fn extrude_to_xyz(&mut self, point: PointF, z: CoordF, de: CoordF, comment: &str) -> String {
        let mut out = self.write_acceleration();
        self.pos = point;
        self.z = z;
        self.lifted = 0.0;
        out.push_str(&format!(
            "G1 X{} Y{} Z{}",
            fmt_xyz(point.x),
            fmt_xyz(point.y),
            fmt_xyz(z)
        ));
        out.push_str(&self.e_field(de));
        out.push_str(&self.comment(comment));
        out.push('\n');
        out
    }

    fn e_field(&mut self, de: CoordF) -> String {
        if de == 0.0 || self.config.gcode_flavor == GCodeFlavor::NoExtrusion {
            return String::new();
        }
        match self.tool_mut() {
            Some(tool) => {
                tool.extrude(de);
                format!(" E{}", fmt_e(tool.e()))
            }
            None => String::new(),
        }
    }

    /// Ordinary retraction. With `before_wipe` only the share configured to
    /// happen before the wipe is retracted.
    pub fn retract(&mut self, before_wipe: bool) -> String {
        let Some(id) = self.tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let factor = if before_wipe { ext.retract_before_wipe / 100.0 } else { 1.0 };
        let (length, extra) = (ext.retract_length, ext.retract_restart_extra);
        self.retract_impl(factor * length, factor * extra, "retract")
    }

    pub fn retract_for_toolchange(&mut self, before_wipe: bool) -> String {
        let Some(id) = self.tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let factor = if before_wipe { ext.retract_before_wipe / 100.0 } else { 1.0 };
        let (length, extra) = (ext.retract_length_toolchange, ext.retract_restart_extra_toolchange);
        self.retract_impl(factor * length, factor * extra, "retract for toolchange")
    }

    fn retract_impl(&mut self, mut length: CoordF, restart_extra: CoordF, comment: &str) -> String {
        let firmware = self.config.use_firmware_retraction;
        if firmware {
            length = 1.0;
        }
        let Some(id) = self.tool_id() else {
            return String::new();
        };
        let speed = self.config.extruder(id as usize).retract_speed;
        let flavor = self.config.gcode_flavor;
        let Some(tool) = self.tool_mut() else {
            return String::new();
        };
        let de = tool.retract(length, restart_extra);
        let e = tool.e();
        if de == 0.0 || flavor == GCodeFlavor::NoExtrusion {
            return String::new();
        }
        if firmware {
            format!("G10{}\n", self.comment("retract"))
        } else {
            format!("G1 E{} F{}{}\n", fmt_e(e), fmt_f(speed * 60.0), self.comment(comment))
        }
    }

    pub fn unretract(&mut self) -> String {
        let Some(id) = self.tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let speed = if ext.deretract_speed > 0.0 { ext.deretract_speed } else { ext.retract_speed };
        let firmware = self.config.use_firmware_retraction;
        let flavor = self.config.gcode_flavor;
        let Some(tool) = self.tool_mut() else {
            return String::new();
        };
        let de = tool.unretract();
        let e = tool.e();
        if de == 0.0 || flavor == GCodeFlavor::NoExtrusion {
            return String::new();
        }
        if firmware {
            let mut out = format!("G11{}\n", self.comment("unretract"));
            out.push_str(&self.reset_e(false));
            out
        } else {
            format!("G1 E{} F{}{}\n", fmt_e(e), fmt_f(speed * 60.0), self.comment("unretract"))
        }
    }

    /// Raise the nozzle by the configured lift when the current Z falls inside
    /// the allowed band.
    pub fn lift(&mut self, layer_id: usize) -> String {
        let Some(id) = self.tool_id() else {
            return String::new();
        };
        let ext = self.config.extruder(id as usize);
        let target = ext.retract_lift;
        let first_layer = ext.retract_lift_first_layer && layer_id == 0;
        let in_band = self.z >= ext.retract_lift_above - EPSILON
            && (ext.retract_lift_below == 0.0 || self.z <= ext.retract_lift_below + EPSILON);
        if !(first_layer || in_band) || target <= 0.0 {
            return String::new();
        }
        if self.lifted.abs() < target - EPSILON {
            let z = self.z + target - self.lifted;
            let out = self.raw_travel_to_z(z, "lift Z");
            self.lifted = target;
            return out;
        }
        String::new()
    }

    pub fn unlift(&mut self) -> String {
        if self.lifted > 0.0 {
            let z = self.z - self.lifted;
            let out = self.raw_travel_to_z(z, "restore layer Z");
            self.lifted = 0.0;
            return out;
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtruderConfig;

    fn writer() -> GCodeWriter {
        let mut w = GCodeWriter::new(&PrintConfig::default());
        w.set_extruders(vec![0]);
        w.toolchange(0);
        w
    }

    #[test]
    fn test_format_number_trims() {
        assert_eq!(format_number(10.0, 3), "10");
        assert_eq!(format_number(10.5, 3), "10.5");
        assert_eq!(format_number(0.12345678, 5), "0.12346");
        assert_eq!(format_number(-0.0001, 3), "0");
        assert_eq!(fmt_f(1799.6), "1800");
    }

    #[test]
    fn test_preamble_relative() {
        let mut w = writer();
        let out = w.preamble();
        assert!(out.contains("G21"));
        assert!(out.contains("G90"));
        assert!(out.contains("M83"));
        assert!(!out.contains("G92"));
    }

    #[test]
    fn test_preamble_absolute_resets_e() {
        let config = PrintConfig::default().use_relative_e_distances(false);
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        let out = w.preamble();
        assert!(out.contains("M82"));
        assert!(out.contains("G92 E0"));
    }

    #[test]
    fn test_single_extruder_toolchange_is_silent() {
        let mut w = GCodeWriter::new(&PrintConfig::default());
        w.set_extruders(vec![0]);
        assert_eq!(w.toolchange(0), "");
        assert_eq!(w.tool_id(), Some(0));
        assert!(!w.need_toolchange(0));
    }

    #[test]
    fn test_multi_extruder_toolchange() {
        let config = PrintConfig::default()
            .extruders(vec![ExtruderConfig::default(), ExtruderConfig::default()]);
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0, 1]);
        assert_eq!(w.toolchange(1), "T1\n");
        assert!(w.need_toolchange(0));
    }

    #[test]
    fn test_fan_only_on_change() {
        let mut w = writer();
        assert_eq!(w.set_fan(100), "M106 S255\n");
        assert_eq!(w.set_fan(100), "");
        assert_eq!(w.set_fan(0), "M107\n");
        assert_eq!(w.set_fan(50), "M106 S128\n");
    }

    #[test]
    fn test_temperature_commands() {
        let mut w = writer();
        assert_eq!(w.set_temperature(210, false, Some(0)), "M104 S210\n");
        assert_eq!(w.set_temperature(210, false, Some(0)), "");
        assert_eq!(w.set_temperature(210, true, Some(0)), "M109 S210\n");
        assert_eq!(w.set_bed_temperature(60, true), "M190 S60\n");
        assert_eq!(w.set_bed_temperature(60, true), "");
        assert_eq!(w.set_bed_temperature(60, false), "");
    }

    #[test]
    fn test_acceleration_written_once() {
        let mut w = writer();
        w.set_acceleration(1000.0);
        let first = w.travel_to_xy(PointF::new(1.0, 1.0), "");
        assert!(first.starts_with("M204 S1000\n"));
        let second = w.travel_to_xy(PointF::new(2.0, 1.0), "");
        assert!(!second.contains("M204"));
        w.set_acceleration(0.0);
        assert!((w.acceleration() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_travel_and_extrude() {
        let mut w = writer();
        assert_eq!(w.travel_to_xy(PointF::new(10.0, 20.0), ""), "G1 X10 Y20 F7800\n");
        assert_eq!(w.extrude_to_xy(PointF::new(20.0, 20.0), 0.5, ""), "G1 X20 Y20 E0.5\n");
        assert_eq!(w.extrude_to_xy(PointF::new(30.0, 20.0), 0.0, ""), "G1 X30 Y20\n");
        assert!((w.position().x - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_absolute_e_accumulates() {
        let config = PrintConfig::default().use_relative_e_distances(false);
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        w.extrude_to_xy(PointF::new(1.0, 0.0), 0.5, "");
        let out = w.extrude_to_xy(PointF::new(2.0, 0.0), 0.25, "");
        assert_eq!(out, "G1 X2 Y0 E0.75\n");
    }

    #[test]
    fn test_retract_unretract() {
        let mut w = writer();
        assert_eq!(w.retract(false), "G1 E-2 F2400\n");
        // Already retracted
        assert_eq!(w.retract(false), "");
        assert!((w.tool().unwrap().retracted() - 2.0).abs() < 1e-9);
        assert_eq!(w.unretract(), "G1 E2 F2400\n");
        assert_eq!(w.unretract(), "");
    }

    #[test]
    fn test_retract_before_wipe_fraction() {
        let mut config = PrintConfig::default();
        config.extruders[0].retract_before_wipe = 25.0;
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        assert_eq!(w.retract(true), "G1 E-0.5 F2400\n");
        assert_eq!(w.retract(false), "G1 E-1.5 F2400\n");
    }

    #[test]
    fn test_firmware_retraction() {
        let mut config = PrintConfig::default();
        config.use_firmware_retraction = true;
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        assert_eq!(w.retract(false), "G10\n");
        assert_eq!(w.unretract(), "G11\n");
    }

    #[test]
    fn test_lift_and_unlift() {
        let mut config = PrintConfig::default();
        config.extruders[0].retract_lift = 0.4;
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        w.travel_to_z(1.0, "");
        assert_eq!(w.lift(3), "G1 Z1.4 F7800\n");
        assert_eq!(w.lift(3), "");
        assert_eq!(w.unlift(), "G1 Z1 F7800\n");
        assert_eq!(w.unlift(), "");
    }

    #[test]
    fn test_lift_respects_below_limit() {
        let mut config = PrintConfig::default();
        config.extruders[0].retract_lift = 0.4;
        config.extruders[0].retract_lift_below = 0.5;
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        w.travel_to_z(1.0, "");
        assert_eq!(w.lift(3), "");
    }

    #[test]
    fn test_travel_to_z_inside_lift_band() {
        let mut config = PrintConfig::default();
        config.extruders[0].retract_lift = 0.4;
        let mut w = GCodeWriter::new(&config);
        w.set_extruders(vec![0]);
        w.toolchange(0);
        w.travel_to_z(1.0, "");
        w.lift(3);
        // Next layer at 1.2 sits inside the lifted band: no move, smaller lift.
        assert!(!w.will_move_z(1.2));
        assert_eq!(w.travel_to_z(1.2, ""), "");
        assert!((w.lifted() - 0.2).abs() < 1e-9);
        assert_eq!(w.unlift(), "G1 Z1.2 F7800\n");
    }

    #[test]
    fn test_extruder_bookkeeping() {
        let config = PrintConfig::default();
        let mut e = Extruder::new(0, &config);
        e.extrude(10.0);
        e.retract(2.0, 0.5);
        assert!((e.used_filament() - 10.0).abs() < 1e-9);
        let de = e.unretract();
        assert!((de - 2.5).abs() < 1e-9);
        assert!((e.used_filament() - 10.5).abs() < 1e-9);
        assert!(e.extruded_volume() > 0.0);
    }
}
