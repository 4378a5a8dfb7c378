//! Retraction wipe.
//!
//! The most recently extruded path is remembered so the next retraction can
//! move the nozzle back over printed material while pulling filament, instead
//! of oozing in place.

use super::writer::GCodeWriter;
use crate::geometry::{Point, PointF, Polyline};
use crate::{scaled, CoordF};

/// Stored wipe path plus the enable flag of the active tool.
#[derive(Debug, Clone, Default)]
pub struct Wipe {
    pub enabled: bool,
    path: Polyline,
}

impl Wipe {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            path: Polyline::new(),
        }
    }

    pub fn has_path(&self) -> bool {
        self.path.is_valid()
    }

    pub fn reset_path(&mut self) {
        self.path = Polyline::new();
    }

    /// Remember `path` as the route for the next wipe.
    pub fn set_path(&mut self, path: Polyline) {
        self.path = path;
    }

    pub fn path(&self) -> &Polyline {
        &self.path
    }

    /// Wipe along the stored path while retracting, then forget the path.
    ///
    /// Starts from `last_pos` (the path's own first point is replaced, since
    /// loop clipping can leave the nozzle elsewhere). `to_gcode` maps scaled
    /// points to machine coordinates. Returns the text and the position the
    /// nozzle ends at.
    pub fn wipe(
        &mut self,
        writer: &mut GCodeWriter,
        last_pos: Point,
        to_gcode: impl Fn(Point) -> PointF,
        toolchange: bool,
        cooling_markers: bool,
    ) -> (String, Point) {
        let mut out = String::new();
        let mut end = last_pos;
        let Some(id) = writer.tool_id() else {
            self.reset_path();
            return (out, end);
        };
        let config = writer.config();
        let ext = config.extruder(id as usize);
        let wipe_speed = if ext.wipe_speed > 0.0 {
            ext.wipe_speed
        } else {
            config.travel_speed * 0.8
        };
        let retract_length = if toolchange {
            ext.retract_length_toolchange
        } else {
            ext.retract_length
        };
        let length = retract_length * (1.0 - ext.retract_before_wipe / 100.0);
        let retract_speed = ext.retract_speed;

        if length > 0.0 && retract_speed > 0.0 {
            // Distance covered at wipe speed while retracting `length` at retract speed.
            let wipe_dist: CoordF = scaled(length / retract_speed * wipe_speed);

            let mut wipe_path = Polyline::from_points(vec![last_pos]);
            if self.path.len() > 1 {
                wipe_path.points.extend_from_slice(&self.path.points[1..]);
            }
            let excess = wipe_path.length() - wipe_dist;
            wipe_path.clip_end(excess);

            if wipe_path.is_valid() {
                out.push_str(";WIPE_START\n");
                let marker = if cooling_markers { ";_WIPE" } else { "" };
                for line in wipe_path.lines() {
                    let de = length * (line.length() / wipe_dist) * 0.95;
                    out.push_str(&writer.set_speed(wipe_speed * 60.0, "", marker));
                    out.push_str(&writer.extrude_to_xy(to_gcode(line.b), -de, "wipe and retract"));
                }
                out.push_str(";WIPE_END\n");
                end = wipe_path.last_point();
            }
        }
        self.reset_path();
        (out, end)
    }
}
