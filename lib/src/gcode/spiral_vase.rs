//! Spiral vase post-processing.
//!
//! A whole layer of rendered G-code is rewritten so that Z rises continuously
//! along the extrusion moves, from the height of the previous layer to the
//! height of this one, instead of stepping up once at the layer change. The
//! first spiral layer also ramps the flow from 0 to 1, since it starts on top
//! of a flat layer.
//!
//! Every layer goes through the filter, spiral or not, so that the tracked
//! position stays in sync with the stream.

use super::fan_mover::{param, parse_line, replace_param};
use super::writer::{fmt_e, fmt_xyz};
use crate::CoordF;

#[derive(Debug, Clone, Default)]
pub struct SpiralVase {
    enabled: bool,
    transition_layer: bool,
    relative_e: bool,
    x: CoordF,
    y: CoordF,
    z: CoordF,
    /// Last E value of the input stream (absolute mode).
    e: CoordF,
    /// Filament withheld by the transition ramp, subtracted from absolute E
    /// values until the next `G92`.
    e_deficit: CoordF,
}

/// One parsed move.
struct Move {
    x: Option<CoordF>,
    y: Option<CoordF>,
    z: Option<CoordF>,
    e: Option<CoordF>,
}

fn parse_move(raw: &str) -> Option<Move> {
    let (cmd, params) = parse_line(raw)?;
    if cmd != "G1" && cmd != "G0" {
        return None;
    }
    Some(Move {
        x: param(&params, 'X'),
        y: param(&params, 'Y'),
        z: param(&params, 'Z'),
        e: param(&params, 'E'),
    })
}

/// Set parameter `letter`, appending it when the line does not have it.
fn set_param(raw: &str, letter: char, value: &str) -> String {
    let has = raw
        .split(';')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .skip(1)
        .any(|t| t.starts_with(letter));
    if has {
        return replace_param(raw, letter, value);
    }
    match raw.find(';') {
        Some(i) => format!("{} {}{} {}", raw[..i].trim_end(), letter, value, &raw[i..]),
        None => format!("{} {}{}", raw.trim_end(), letter, value),
    }
}

/// Drop parameter `letter` from the line.
fn remove_param(raw: &str, letter: char) -> String {
    let (code, comment) = match raw.find(';') {
        Some(i) => (&raw[..i], Some(&raw[i..])),
        None => (raw, None),
    };
    let mut line = code
        .split_whitespace()
        .enumerate()
        .filter(|(i, t)| *i == 0 || !t.starts_with(letter))
        .map(|(_, t)| t)
        .collect::<Vec<_>>()
        .join(" ");
    if let Some(comment) = comment {
        line.push(' ');
        line.push_str(comment);
    }
    line
}

impl SpiralVase {
    pub fn new(relative_e: bool) -> Self {
        Self {
            relative_e,
            ..Default::default()
        }
    }

    /// Turn spiralling on or off for the next layer. Switching it on marks
    /// that layer as the transition layer.
    pub fn enable(&mut self, enabled: bool) {
        self.transition_layer = enabled && !self.enabled;
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// E delta of a move given the current input E.
    fn e_delta(&self, e: Option<CoordF>) -> CoordF {
        match e {
            Some(e) if self.relative_e => e,
            Some(e) => e - self.e,
            None => 0.0,
        }
    }

    /// XY length extruded by the layer and the Z of its layer change move.
    fn measure(&self, gcode: &str) -> (CoordF, Option<CoordF>) {
        let (mut x, mut y, mut e) = (self.x, self.y, self.e);
        let mut total = 0.0;
        let mut layer_z = None;
        for raw in gcode.lines() {
            if let Some((cmd, params)) = parse_line(raw) {
                if cmd == "G92" {
                    if let Some(v) = param(&params, 'E') {
                        e = v;
                    }
                    continue;
                }
            }
            let Some(m) = parse_move(raw) else {
                continue;
            };
            if layer_z.is_none() {
                layer_z = m.z;
            }
            let (nx, ny) = (m.x.unwrap_or(x), m.y.unwrap_or(y));
            let de = match m.e {
                Some(v) if self.relative_e => v,
                Some(v) => v - e,
                None => 0.0,
            };
            if de > 0.0 {
                total += ((nx - x).powi(2) + (ny - y).powi(2)).sqrt();
            }
            if !self.relative_e {
                e = m.e.unwrap_or(e);
            }
            x = nx;
            y = ny;
        }
        (total, layer_z)
    }

    /// Rewrite one layer.
    pub fn process_layer(&mut self, gcode: &str) -> String {
        let (total_length, layer_z) = self.measure(gcode);
        let spiral = self.enabled && total_length > 0.0 && layer_z.is_some();
        let z_start = self.z;
        let layer_height = layer_z.map_or(0.0, |z| z - z_start);
        let transition = spiral && self.transition_layer;

        let mut out = String::with_capacity(gcode.len() + gcode.len() / 8);
        let mut length = 0.0;
        let mut z_set = false;
        for raw in gcode.lines() {
            if let Some((cmd, params)) = parse_line(raw) {
                if cmd == "G92" {
                    if let Some(v) = param(&params, 'E') {
                        self.e = v;
                        self.e_deficit = 0.0;
                    }
                }
            }
            let Some(m) = parse_move(raw) else {
                out.push_str(raw);
                out.push('\n');
                continue;
            };
            let (nx, ny) = (m.x.unwrap_or(self.x), m.y.unwrap_or(self.y));
            let de = self.e_delta(m.e);
            let dist = ((nx - self.x).powi(2) + (ny - self.y).powi(2)).sqrt();
            let mut line = raw.to_string();

            if spiral {
                if m.z.is_some() {
                    if !z_set {
                        // The layer change stays at the previous height.
                        line = set_param(&line, 'Z', &fmt_xyz(z_start));
                        z_set = true;
                    } else if m.x.is_none() && m.y.is_none() && m.e.is_none() {
                        // Lifts would break the spiral.
                        continue;
                    } else {
                        line = remove_param(&line, 'Z');
                    }
                } else if de > 0.0 && dist > 0.0 {
                    length += dist;
                    let factor = length / total_length;
                    line = set_param(&line, 'Z', &fmt_xyz(z_start + factor * layer_height));
                    if transition {
                        let scaled = de * factor;
                        if self.relative_e {
                            line = set_param(&line, 'E', &fmt_e(scaled));
                        } else {
                            self.e_deficit += de - scaled;
                        }
                    }
                }
            } else if let Some(z) = m.z {
                self.z = z;
            }

            if !self.relative_e {
                if let Some(e) = m.e {
                    if self.e_deficit != 0.0 {
                        line = set_param(&line, 'E', &fmt_e(e - self.e_deficit));
                    }
                    self.e = e;
                }
            }
            self.x = nx;
            self.y = ny;
            out.push_str(&line);
            out.push('\n');
        }
        if spiral {
            if let Some(z) = layer_z {
                self.z = z;
            }
            self.transition_layer = false;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(z: f64) -> String {
        format!(
            "G1 Z{} F600\nG1 X0 Y0\nG1 X10 Y0 E1\nG1 X10 Y10 E1\nG1 X0 Y10 E1\nG1 X0 Y0 E1\n",
            z
        )
    }

    fn z_values(gcode: &str) -> Vec<f64> {
        gcode
            .lines()
            .filter_map(|l| parse_move(l).and_then(|m| m.z))
            .collect()
    }

    #[test]
    fn test_disabled_passes_through() {
        let mut sv = SpiralVase::new(true);
        let input = layer(0.2);
        assert_eq!(sv.process_layer(&input), input);
    }

    #[test]
    fn test_z_rises_along_layer() {
        let mut sv = SpiralVase::new(true);
        sv.process_layer(&layer(0.2));
        sv.enable(true);
        sv.process_layer(&layer(0.4));
        let out = sv.process_layer(&layer(0.6));
        let z = z_values(&out);
        // Layer change stays at the previous height, then four rising moves.
        assert_eq!(z.len(), 5);
        assert!((z[0] - 0.4).abs() < 1e-9);
        assert!((z[1] - 0.45).abs() < 1e-9);
        assert!((z[4] - 0.6).abs() < 1e-9);
        assert!(z.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_transition_layer_ramps_flow() {
        let mut sv = SpiralVase::new(true);
        sv.process_layer(&layer(0.2));
        sv.enable(true);
        let out = sv.process_layer(&layer(0.4));
        let e: Vec<f64> = out
            .lines()
            .filter_map(|l| parse_move(l).and_then(|m| m.e))
            .collect();
        assert_eq!(e.len(), 4);
        assert!((e[0] - 0.25).abs() < 1e-9);
        assert!((e[3] - 1.0).abs() < 1e-9);

        // The following layer extrudes at full flow.
        let out = sv.process_layer(&layer(0.6));
        assert!(out.contains("G1 X10 Y0 E1 Z"));
    }

    #[test]
    fn test_lifts_are_dropped() {
        let mut sv = SpiralVase::new(true);
        sv.process_layer(&layer(0.2));
        sv.enable(true);
        let input = format!("{}G1 Z1.2 F600\n", layer(0.4));
        let out = sv.process_layer(&input);
        assert!(!out.contains("Z1.2"));
    }

    #[test]
    fn test_absolute_e_deficit() {
        let mut sv = SpiralVase::new(false);
        sv.process_layer("G92 E0\nG1 Z0.2\n");
        sv.enable(true);
        let out = sv.process_layer("G1 Z0.4\nG1 X10 Y0 E1\nG1 X20 Y0 E2\n");
        let e: Vec<f64> = out
            .lines()
            .filter_map(|l| parse_move(l).and_then(|m| m.e))
            .collect();
        // Half the first segment's filament is withheld.
        assert!((e[0] - 0.5).abs() < 1e-9);
        assert!((e[1] - 1.5).abs() < 1e-9);
    }
}
