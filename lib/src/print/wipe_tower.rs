//! Pre-built wipe tower results.
//!
//! The tower generator works in its own coordinate frame (origin at the tower
//! corner, unrotated). The exporter rotates and translates its output into
//! bed coordinates when splicing it into the stream.

use crate::geometry::PointF;
use crate::CoordF;
use serde::{Deserialize, Serialize};

/// G-code fragment for one tool change (or priming / final purge).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolChangeResult {
    /// Printed before the first layer, already in bed coordinates.
    pub priming: bool,
    pub print_z: CoordF,
    pub layer_height: CoordF,
    /// Tower-local G-code. May contain the `[start_filament_gcode]`,
    /// `[end_filament_gcode]` and `[toolchange_gcode]` placeholders.
    pub gcode: String,
    pub start_pos: PointF,
    pub end_pos: PointF,
    /// 0-based tool active before the change, -1 if none.
    pub initial_tool: i32,
    /// 0-based tool active after the change, -1 for a plain layer finish.
    pub new_tool: i32,
    /// Path to wipe along after leaving the tower (tower-local).
    pub wipe_path: Vec<PointF>,
    pub elapsed_time: CoordF,
}

impl ToolChangeResult {
    pub fn is_tool_change(&self) -> bool {
        self.new_tool >= 0 && self.new_tool != self.initial_tool
    }
}

/// Everything the exporter needs to interleave a wipe tower.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipeTowerData {
    /// Bed position of the tower origin (mm).
    pub position: PointF,
    /// Tower rotation around its origin (degrees).
    pub rotation_deg: CoordF,
    pub priming: Vec<ToolChangeResult>,
    /// Tool changes grouped by wipe tower layer.
    pub tool_changes: Vec<Vec<ToolChangeResult>>,
    pub final_purge: Option<ToolChangeResult>,
    /// Per-extruder nozzle offsets (mm), indexed by 0-based extruder.
    pub extruder_offsets: Vec<PointF>,
    /// Footprint of the tower in tower-local coordinates (width, depth).
    pub width: CoordF,
    pub depth: CoordF,
}

impl WipeTowerData {
    pub fn rotation_rad(&self) -> CoordF {
        self.rotation_deg.to_radians()
    }

    /// Map a tower-local point to bed coordinates.
    pub fn to_bed(&self, p: PointF) -> PointF {
        let r = p.rotate(self.rotation_rad());
        PointF::new(r.x + self.position.x, r.y + self.position.y)
    }

    pub fn extruder_offset(&self, extruder: usize) -> PointF {
        self.extruder_offsets.get(extruder).copied().unwrap_or_default()
    }

    /// Bed-space corners of the tower footprint.
    pub fn footprint(&self) -> [PointF; 4] {
        [
            self.to_bed(PointF::new(0.0, 0.0)),
            self.to_bed(PointF::new(self.width, 0.0)),
            self.to_bed(PointF::new(self.width, self.depth)),
            self.to_bed(PointF::new(0.0, self.depth)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bed_rotates_then_translates() {
        let data = WipeTowerData {
            position: PointF::new(100.0, 50.0),
            rotation_deg: 90.0,
            ..Default::default()
        };
        let p = data.to_bed(PointF::new(10.0, 0.0));
        assert!((p.x - 100.0).abs() < 1e-9);
        assert!((p.y - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_is_tool_change() {
        let mut tcr = ToolChangeResult {
            initial_tool: 0,
            new_tool: 1,
            ..Default::default()
        };
        assert!(tcr.is_tool_change());
        tcr.new_tool = 0;
        assert!(!tcr.is_tool_change());
    }
}
