//! Wipe tower integration.
//!
//! The tower planner hands over finished G-code fragments in its own frame.
//! This module walks through them in print order and moves them into bed
//! coordinates. The emitter does the surrounding travel, retraction and
//! custom filament scripts (see `ToolpathEmitter::append_tool_change_result`).

use crate::geometry::PointF;
use crate::print::{ToolChangeResult, WipeTowerData};
use crate::{CoordF, Error, Result};

use super::writer::fmt_xyz;

/// Appended by the tower planner to a `G1` line that must keep its X and Y
/// even when unchanged.
pub const NEVER_SKIP_TAG: &str = ";_NEVER_SKIP";

pub const START_FILAMENT_PLACEHOLDER: &str = "[start_filament_gcode]";
pub const END_FILAMENT_PLACEHOLDER: &str = "[end_filament_gcode]";
pub const TOOLCHANGE_PLACEHOLDER: &str = "[toolchange_gcode]";

/// Cursor over the tool change results of a wipe tower.
#[derive(Debug)]
pub struct WipeTowerIntegration<'a> {
    data: &'a WipeTowerData,
    /// Tower layer being printed, `None` before the first one.
    layer_idx: Option<usize>,
    tool_change_idx: usize,
    brim_done: bool,
}

impl<'a> WipeTowerIntegration<'a> {
    pub fn new(data: &'a WipeTowerData) -> Self {
        Self {
            data,
            layer_idx: None,
            tool_change_idx: 0,
            brim_done: false,
        }
    }

    pub fn data(&self) -> &'a WipeTowerData {
        self.data
    }

    /// Results to print before the first layer.
    pub fn priming(&self) -> &'a [ToolChangeResult] {
        &self.data.priming
    }

    pub fn final_purge(&self) -> Option<&'a ToolChangeResult> {
        self.data.final_purge.as_ref()
    }

    /// Advance to the next tower layer.
    pub fn next_layer(&mut self) {
        self.layer_idx = Some(self.layer_idx.map_or(0, |i| i + 1));
        self.tool_change_idx = 0;
    }

    /// Next tool change of the current tower layer.
    ///
    /// A result is consumed when the tower brim is still to be printed, when
    /// the tool actually changes, or when the layer has to be finished. Past
    /// the last tower layer nothing is printed.
    pub fn next_tool_change(
        &mut self,
        need_toolchange: bool,
        finish_layer: bool,
    ) -> Result<Option<&'a ToolChangeResult>> {
        if self.brim_done && !need_toolchange && !finish_layer {
            return Ok(None);
        }
        let data = self.data;
        let mut result = None;
        if let Some(layer) = self.layer_idx.and_then(|i| data.tool_changes.get(i)) {
            let tcr = layer.get(self.tool_change_idx).ok_or_else(|| {
                Error::WipeTower("Wipe tower generation failed, possibly due to empty first layer.".into())
            })?;
            self.tool_change_idx += 1;
            result = Some(tcr);
        }
        self.brim_done = true;
        Ok(result)
    }
}

/// Fail when a tool change result switches to a tool other than `new_extruder`.
///
/// `new_extruder` is `None` for results that do not change the tool (final purge).
pub fn check_expected_tool(tcr: &ToolChangeResult, new_extruder: Option<u16>) -> Result<()> {
    match new_extruder {
        Some(e) if i32::from(e) != tcr.new_tool => Err(Error::WipeTower(format!(
            "Error: WipeTowerIntegration::append_tcr was asked to do a toolchange it didn't expect (expected T{}, got T{}).",
            e, tcr.new_tool
        ))),
        _ => Ok(()),
    }
}

fn offset_of(data: &WipeTowerData, tool: i32) -> PointF {
    if tool < 0 {
        PointF::default()
    } else {
        data.extruder_offset(tool as usize)
    }
}

/// Rotate and translate the `G1` moves of `tcr` into bed coordinates.
///
/// X and Y are re-emitted only when they changed since the previous move, at
/// three decimals, corrected by the nozzle offset of the active tool. After
/// the `[toolchange_gcode]` line the offset of the new tool applies; if it
/// differs, a move keeps the nozzle where it was.
pub fn post_process_moves(
    tcr: &ToolChangeResult,
    data: &WipeTowerData,
    translation: PointF,
    angle: CoordF,
) -> String {
    let mut offset = offset_of(data, tcr.initial_tool);
    let mut pos = tcr.start_pos;
    let mut transformed = pos;
    let mut last: Option<PointF> = None;
    let mut out = String::with_capacity(tcr.gcode.len() + 64);

    for raw in tcr.gcode.lines() {
        let mut line = raw.to_string();
        if line.starts_with("G1 ") {
            let never_skip = line.contains(NEVER_SKIP_TAG);
            if never_skip {
                line = line.replacen(NEVER_SKIP_TAG, "", 1);
            }
            let (code, comment) = match line.find(';') {
                Some(i) => (&line[..i], &line[i..]),
                None => (line.as_str(), ""),
            };
            let mut rest: Vec<&str> = Vec::new();
            for word in code.split_whitespace().skip(1) {
                let value = word.get(1..).and_then(|v| v.parse::<CoordF>().ok());
                match (word.as_bytes()[0], value) {
                    (b'X', Some(x)) => pos.x = x,
                    (b'Y', Some(y)) => pos.y = y,
                    _ => rest.push(word),
                }
            }
            let r = pos.rotate(angle);
            transformed = PointF::new(r.x + translation.x, r.y + translation.y);
            let mut rebuilt = String::from("G1");
            let x_changed = last.map_or(true, |l| l.x != transformed.x);
            let y_changed = last.map_or(true, |l| l.y != transformed.y);
            if x_changed || never_skip {
                rebuilt.push_str(&format!(" X{}", fmt_xyz(transformed.x - offset.x)));
            }
            if y_changed || never_skip {
                rebuilt.push_str(&format!(" Y{}", fmt_xyz(transformed.y - offset.y)));
            }
            last = Some(transformed);
            for word in rest {
                rebuilt.push(' ');
                rebuilt.push_str(word);
            }
            if !comment.is_empty() {
                rebuilt.push(' ');
                rebuilt.push_str(comment);
            }
            // A move that lost every axis is dropped.
            if rebuilt == "G1" {
                continue;
            }
            line = rebuilt;
        }
        out.push_str(&line);
        out.push('\n');

        if line.trim() == TOOLCHANGE_PLACEHOLDER {
            let new_offset = offset_of(data, tcr.new_tool);
            if new_offset != offset {
                out.push_str(&format!(
                    "G1 X{} Y{}\n",
                    fmt_xyz(transformed.x - new_offset.x),
                    fmt_xyz(transformed.y - new_offset.y)
                ));
            }
            offset = new_offset;
        }
    }
    out
}

fn with_eol(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

/// Replace the filament and tool change placeholders (each once) with the
/// rendered scripts. A placeholder with an empty script disappears.
pub fn splice_placeholders(gcode: &str, end_filament: &str, toolchange: &str, start_filament: &str) -> String {
    let mut out = gcode.to_string();
    for (placeholder, text) in [
        (END_FILAMENT_PLACEHOLDER, end_filament),
        (TOOLCHANGE_PLACEHOLDER, toolchange),
        (START_FILAMENT_PLACEHOLDER, start_filament),
    ] {
        let text = with_eol(text);
        let pattern = format!("{}\n", placeholder);
        if out.contains(&pattern) {
            out = out.replacen(&pattern, &text, 1);
        } else {
            out = out.replacen(placeholder, text.trim_end_matches('\n'), 1);
        }
    }
    out
}

/// Map a tower-local wipe path to bed coordinates.
pub fn transform_path(path: &[PointF], translation: PointF, angle: CoordF) -> Vec<PointF> {
    path.iter()
        .map(|p| {
            let r = p.rotate(angle);
            PointF::new(r.x + translation.x, r.y + translation.y)
        })
        .collect()
}
