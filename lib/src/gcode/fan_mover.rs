//! Fan command retiming.
//!
//! [`FanTimingBuffer`] is a sequential filter over rendered G-code. It keeps a
//! look-ahead window of lines whose estimated execution time adds up to the
//! configured delay, so a fan speed increase can be written that many seconds
//! before the moves that requested it. Decreases stay where they are.
//!
//! Only fan lines ever move, and only towards the start of the stream. When
//! splitting is enabled, the oldest buffered `G1` may be cut in two so the
//! advanced command lands at the exact instant.

use super::writer::{fmt_e, fmt_xyz};
use crate::config::PrintConfig;
use crate::CoordF;
use std::collections::VecDeque;

/// Feed rate assumed before the first `F` parameter (mm/s).
const DEFAULT_FEED_RATE: CoordF = 1000.0 / 60.0;

const X: usize = 0;
const Y: usize = 1;
const Z: usize = 2;
const E: usize = 3;
const AXES: [char; 4] = ['X', 'Y', 'Z', 'E'];

/// One line held back in the look-ahead window.
#[derive(Debug, Clone)]
struct BufferedLine {
    raw: String,
    /// Estimated execution time (s).
    time: CoordF,
    /// Fan value (0-255) for fan commands.
    fan: Option<u32>,
    /// Axis positions before the move.
    start: [CoordF; 4],
    /// Axis deltas of the move.
    delta: [CoordF; 4],
}

impl BufferedLine {
    fn passive(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            time: 0.0,
            fan: None,
            start: [0.0; 4],
            delta: [0.0; 4],
        }
    }

    fn fan(raw: String, value: u32) -> Self {
        Self {
            fan: Some(value),
            ..Self::passive(&raw)
        }
    }
}

/// Look-ahead filter advancing fan speed increases.
#[derive(Debug, Clone)]
pub struct FanTimingBuffer {
    delay: CoordF,
    split_moves: bool,
    kickstart: CoordF,
    relative_e: bool,
    relative_xyz: bool,
    /// Current feed rate (mm/s).
    feed_rate: CoordF,
    position: [CoordF; 4],
    buffer: VecDeque<BufferedLine>,
    buffer_time: CoordF,
    /// Last value requested upstream.
    expected_fan: u32,
    /// Last value written to the output.
    current_fan: Option<u32>,
}

impl FanTimingBuffer {
    /// Advance increases by `delay` seconds.
    pub fn new(delay: CoordF, relative_e: bool) -> Self {
        Self {
            delay: delay.max(0.0),
            split_moves: false,
            kickstart: 0.0,
            relative_e,
            relative_xyz: false,
            feed_rate: DEFAULT_FEED_RATE,
            position: [0.0; 4],
            buffer: VecDeque::new(),
            buffer_time: 0.0,
            expected_fan: 0,
            current_fan: None,
        }
    }

    pub fn from_config(config: &PrintConfig) -> Self {
        Self::new(config.fan_speedup_time, config.use_relative_e_distances)
            .split_moves(config.fan_speedup_split)
            .kickstart(config.fan_kickstart)
    }

    /// Builder method: cut the oldest buffered move so the command lands on time.
    pub fn split_moves(mut self, enabled: bool) -> Self {
        self.split_moves = enabled;
        self
    }

    /// Builder method: spin up from a stop at full power for `seconds` first.
    pub fn kickstart(mut self, seconds: CoordF) -> Self {
        self.kickstart = seconds.max(0.0);
        self
    }

    /// Total estimated time currently held back (s).
    pub fn buffered_time(&self) -> CoordF {
        self.buffer_time
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Without a delay or a kick-start there is nothing to retime.
    pub fn is_active(&self) -> bool {
        self.delay > 0.0 || self.kickstart > 0.0
    }

    /// Feed a block of lines and return whatever left the window. With
    /// `flush`, the window is drained in order.
    pub fn process(&mut self, gcode: &str, flush: bool) -> String {
        let mut out = String::with_capacity(gcode.len() + 64);
        if !self.is_active() {
            for line in gcode.lines() {
                out.push_str(line);
                out.push('\n');
            }
            return out;
        }
        for line in gcode.lines() {
            self.process_line(line, &mut out);
        }
        if flush {
            while let Some(line) = self.buffer.pop_front() {
                self.emit(line, &mut out);
            }
            self.buffer_time = 0.0;
        }
        out
    }

    fn emit(&mut self, line: BufferedLine, out: &mut String) {
        if let Some(fan) = line.fan {
            // Same speed as the machine already runs.
            if self.current_fan == Some(fan) {
                return;
            }
            self.current_fan = Some(fan);
        }
        out.push_str(&line.raw);
        out.push('\n');
    }

    fn process_line(&mut self, raw: &str, out: &mut String) {
        let Some((cmd, params)) = parse_line(raw) else {
            self.buffer.push_back(BufferedLine::passive(raw));
            return;
        };
        if let Some(f) = param(&params, 'F') {
            if f > 0.0 {
                self.feed_rate = f / 60.0;
            }
        }

        let mut line = BufferedLine::passive(raw);
        match cmd.as_str() {
            "G0" | "G1" => {
                line.start = self.position;
                for (axis, letter) in AXES.iter().enumerate() {
                    let Some(v) = param(&params, *letter) else {
                        continue;
                    };
                    let relative = if axis == E { self.relative_e } else { self.relative_xyz };
                    let target = if relative { self.position[axis] + v } else { v };
                    line.delta[axis] = target - self.position[axis];
                    self.position[axis] = target;
                }
                let dist = (line.delta[X].powi(2) + line.delta[Y].powi(2) + line.delta[Z].powi(2)).sqrt();
                if dist > 0.0 {
                    line.time = dist / self.feed_rate;
                }
            }
            "G92" => {
                for (axis, letter) in AXES.iter().enumerate() {
                    if let Some(v) = param(&params, *letter) {
                        self.position[axis] = v;
                    }
                }
            }
            "G90" => self.relative_xyz = false,
            "G91" => self.relative_xyz = true,
            "M82" => self.relative_e = false,
            "M83" => self.relative_e = true,
            "M106" => {
                let value = param(&params, 'S').map_or(255, |s| s.round().clamp(0.0, 255.0) as u32);
                self.on_fan(raw, value, out);
                return;
            }
            "M107" => {
                self.on_fan(raw, 0, out);
                return;
            }
            _ => {}
        }

        let time = line.time;
        self.buffer_time += time;
        self.buffer.push_back(line);
        if time > 0.0 {
            self.release(out);
        }
    }

    /// Emit the oldest lines while the rest still covers the delay.
    fn release(&mut self, out: &mut String) {
        while let Some(front) = self.buffer.front() {
            if self.buffer_time - front.time <= self.delay {
                break;
            }
            let Some(line) = self.buffer.pop_front() else {
                break;
            };
            self.buffer_time -= line.time;
            self.emit(line, out);
        }
    }

    fn on_fan(&mut self, raw: &str, value: u32, out: &mut String) {
        if value <= self.expected_fan {
            // Slowing down is never advanced.
            self.buffer.push_back(BufferedLine::fan(raw.to_string(), value));
            self.expected_fan = value;
            return;
        }

        // Pending slower commands take the new value instead of spinning up twice.
        let mut coalesced = 0;
        for line in self.buffer.iter_mut() {
            if let Some(fan) = line.fan {
                if fan < value {
                    line.fan = Some(value);
                    line.raw = format!("M106 S{}", value);
                    coalesced += 1;
                }
            }
        }

        if coalesced == 0 {
            if self.split_moves && self.buffer_time > self.delay * 1.1 {
                self.split_oldest_move(out);
            }
            let command = format!("M106 S{}", value);
            if self.kickstart > 0.0 && self.expected_fan == 0 && value < 255 {
                self.buffer.push_front(BufferedLine::fan("M106 S255".into(), 255));
                let mut elapsed = 0.0;
                let mut idx = 1;
                while idx < self.buffer.len() && elapsed < self.kickstart {
                    elapsed += self.buffer[idx].time;
                    idx += 1;
                }
                self.buffer.insert(idx, BufferedLine::fan(command, value));
            } else {
                self.buffer.push_front(BufferedLine::fan(command, value));
            }
        }
        self.expected_fan = value;
    }

    /// Write the part of the oldest move that runs before the delay window,
    /// keeping the remainder buffered.
    fn split_oldest_move(&mut self, out: &mut String) {
        let relative_e = self.relative_e;
        let relative_xyz = self.relative_xyz;
        let excess = self.buffer_time - self.delay;
        let Some(front) = self.buffer.front_mut() else {
            return;
        };
        if !front.raw.starts_with("G1 ") || front.time <= 0.0 {
            return;
        }
        let ratio = (excess / front.time).clamp(0.0, 1.0);
        if ratio <= 0.0 || ratio >= 1.0 {
            return;
        }

        let mut before = front.raw.clone();
        for axis in [X, Y, Z] {
            if front.delta[axis] == 0.0 {
                continue;
            }
            if relative_xyz {
                before = replace_param(&before, AXES[axis], &fmt_xyz(front.delta[axis] * ratio));
                front.raw = replace_param(
                    &front.raw,
                    AXES[axis],
                    &fmt_xyz(front.delta[axis] * (1.0 - ratio)),
                );
            } else {
                let v = front.start[axis] + front.delta[axis] * ratio;
                before = replace_param(&before, AXES[axis], &fmt_xyz(v));
            }
        }
        if front.delta[E] != 0.0 {
            if relative_e {
                before = replace_param(&before, 'E', &fmt_e(front.delta[E] * ratio));
                front.raw = replace_param(&front.raw, 'E', &fmt_e(front.delta[E] * (1.0 - ratio)));
            } else {
                before = replace_param(&before, 'E', &fmt_e(front.start[E] + front.delta[E] * ratio));
            }
        }
        for axis in 0..4 {
            front.start[axis] += front.delta[axis] * ratio;
            front.delta[axis] *= 1.0 - ratio;
        }
        let spent = front.time * ratio;
        front.time -= spent;
        self.buffer_time -= spent;
        out.push_str(&before);
        out.push('\n');
    }
}

/// Split a line into its upper-cased command and numeric parameters.
/// Blank and comment-only lines yield `None`.
pub(super) fn parse_line(raw: &str) -> Option<(String, Vec<(char, CoordF)>)> {
    let code = raw.split(';').next().unwrap_or("").trim();
    let mut tokens = code.split_whitespace();
    let cmd = tokens.next()?.to_ascii_uppercase();
    let params = tokens
        .filter_map(|t| {
            let mut chars = t.chars();
            let letter = chars.next()?.to_ascii_uppercase();
            let value = chars.as_str().parse::<CoordF>().ok()?;
            Some((letter, value))
        })
        .collect();
    Some((cmd, params))
}

pub(super) fn param(params: &[(char, CoordF)], letter: char) -> Option<CoordF> {
    params.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v)
}

/// Replace the value of parameter `letter`, keeping any trailing comment.
pub(super) fn replace_param(raw: &str, letter: char, value: &str) -> String {
    let (code, comment) = match raw.find(';') {
        Some(i) => (&raw[..i], Some(&raw[i..])),
        None => (raw, None),
    };
    let mut tokens: Vec<String> = code.split_whitespace().map(str::to_string).collect();
    for token in tokens.iter_mut().skip(1) {
        if token.chars().next().map(|c| c.to_ascii_uppercase()) == Some(letter) {
            *token = format!("{}{}", letter, value);
        }
    }
    let mut line = tokens.join(" ");
    if let Some(comment) = comment {
        line.push(' ');
        line.push_str(comment);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_fan(line: &str) -> bool {
        line.starts_with("M106") || line.starts_with("M107")
    }

    /// Moves of 10 mm at 600 mm/min, one second each.
    fn moves(from: usize, count: usize) -> Vec<String> {
        (from..from + count)
            .map(|i| format!("G1 X{} Y0 E0.5", (i + 1) * 10))
            .collect()
    }

    fn stream(lines: &[String]) -> String {
        let mut s = String::from("G1 F600\n");
        for l in lines {
            s.push_str(l);
            s.push('\n');
        }
        s
    }

    #[test]
    fn test_motion_only_round_trip() {
        let lines = moves(0, 10);
        let input: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        let mut buffer = FanTimingBuffer::new(3.0, true);
        assert_eq!(buffer.process(&input, true), input);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chunked_matches_single_pass() {
        let mut lines = moves(0, 6);
        lines.push("M106 S255".into());
        lines.extend(moves(6, 6));
        let input = stream(&lines);

        let mut single = FanTimingBuffer::new(2.5, true);
        let expected = single.process(&input, true);

        let mut chunked = FanTimingBuffer::new(2.5, true);
        let mut got = String::new();
        let all: Vec<&str> = input.lines().collect();
        for chunk in all.chunks(3) {
            let text: String = chunk.iter().map(|l| format!("{}\n", l)).collect();
            got.push_str(&chunked.process(&text, false));
        }
        got.push_str(&chunked.process("", true));
        assert_eq!(got, expected);
    }

    #[test]
    fn test_increase_moves_earlier() {
        let mut lines = moves(0, 8);
        lines.push("M106 S255".into());
        lines.extend(moves(8, 4));
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(3.0, true);
        let output = buffer.process(&input, true);

        let out_lines: Vec<&str> = output.lines().collect();
        let in_lines: Vec<&str> = input.lines().collect();
        let pos_in = in_lines.iter().position(|l| is_fan(l)).unwrap();
        let pos_out = out_lines.iter().position(|l| is_fan(l)).unwrap();
        // At least the delay, at most the delay plus the oldest move.
        let advanced = pos_in - pos_out;
        assert!((3..=4).contains(&advanced));

        let non_fan_in: Vec<&str> = in_lines.iter().copied().filter(|l| !is_fan(l)).collect();
        let non_fan_out: Vec<&str> = out_lines.iter().copied().filter(|l| !is_fan(l)).collect();
        assert_eq!(non_fan_in, non_fan_out);
    }

    #[test]
    fn test_decrease_stays_in_place() {
        let mut lines = vec!["M106 S255".to_string()];
        lines.extend(moves(0, 6));
        lines.push("M106 S100".into());
        lines.extend(moves(6, 4));
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(2.0, true);
        let output = buffer.process(&input, true);
        let out_lines: Vec<&str> = output.lines().collect();
        let in_lines: Vec<&str> = input.lines().collect();
        let idx_in = in_lines.iter().position(|l| *l == "M106 S100").unwrap();
        let idx_out = out_lines.iter().position(|l| *l == "M106 S100").unwrap();
        assert_eq!(idx_in, idx_out);
    }

    #[test]
    fn test_higher_request_coalesces_pending_one() {
        let mut lines = moves(0, 2);
        lines.push("M106 S50".into());
        lines.extend(moves(2, 1));
        lines.push("M106 S200".into());
        lines.extend(moves(3, 2));
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(10.0, true);
        let output = buffer.process(&input, true);

        let fans: Vec<&str> = output.lines().filter(|l| is_fan(l)).collect();
        assert_eq!(fans, vec!["M106 S200"]);
        // Lands where the first request was advanced to.
        let first_fan = output.lines().position(is_fan).unwrap();
        assert_eq!(first_fan, 0);
    }

    #[test]
    fn test_never_delayed_past_original_position() {
        let mut lines = vec!["M106 S80".to_string()];
        lines.extend(moves(0, 3));
        lines.push("M107".into());
        lines.extend(moves(3, 3));
        lines.push("M106 S255".into());
        lines.extend(moves(6, 3));
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(1.5, true);
        let output = buffer.process(&input, true);

        let count_moves_before = |text: &str, target: &str| {
            text.lines()
                .take_while(|l| *l != target)
                .filter(|l| l.starts_with("G1 X"))
                .count()
        };
        for fan in ["M106 S80", "M107", "M106 S255"] {
            assert!(count_moves_before(&output, fan) <= count_moves_before(&input, fan));
        }
    }

    #[test]
    fn test_split_oldest_move() {
        let mut lines = moves(0, 4);
        lines.push("M106 S255".into());
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(2.5, true).split_moves(true);
        let output = buffer.process(&input, true);
        let out_lines: Vec<&str> = output.lines().collect();
        // The 2nd move is cut in half: 0.5 s before the fan, 0.5 s after.
        assert!(out_lines.contains(&"G1 X15 Y0 E0.25"));
        let fan_idx = out_lines.iter().position(|l| is_fan(l)).unwrap();
        assert_eq!(out_lines[fan_idx - 1], "G1 X15 Y0 E0.25");
        assert_eq!(out_lines[fan_idx + 1], "G1 X20 Y0 E0.25");
    }

    #[test]
    fn test_zero_delay_leaves_stream_untouched() {
        let input = "G1 F600\nG1 X10 Y0 E0.5\nM106 S255\nG1 X20 Y0 E0.5\nM106 S255\n";
        let mut buffer = FanTimingBuffer::new(0.0, false);
        assert!(!buffer.is_active());
        assert_eq!(buffer.process(input, false), input);
        assert!(buffer.is_empty());
        assert!(FanTimingBuffer::new(0.0, false).kickstart(0.5).is_active());
    }

    #[test]
    fn test_split_relative_move() {
        let mut lines = vec!["G91".to_string()];
        lines.extend((0..4).map(|_| "G1 X10 Y0 E0.5".to_string()));
        lines.push("M106 S255".into());
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(2.5, true).split_moves(true);
        let output = buffer.process(&input, true);
        let out_lines: Vec<&str> = output.lines().collect();

        // Both halves of the cut move are relative offsets.
        let fan_idx = out_lines.iter().position(|l| is_fan(l)).unwrap();
        assert_eq!(out_lines[fan_idx - 1], "G1 X5 Y0 E0.25");
        assert_eq!(out_lines[fan_idx + 1], "G1 X5 Y0 E0.25");
        let travelled: f64 = out_lines
            .iter()
            .filter_map(|l| l.strip_prefix("G1 X"))
            .filter_map(|rest| rest.split_whitespace().next()?.parse::<f64>().ok())
            .sum();
        assert!((travelled - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_kickstart_precedes_target() {
        let mut lines = moves(0, 4);
        lines.push("M106 S128".into());
        lines.extend(moves(4, 4));
        let input = stream(&lines);
        let mut buffer = FanTimingBuffer::new(3.0, true).kickstart(1.0);
        let output = buffer.process(&input, true);
        let out_lines: Vec<&str> = output.lines().collect();
        let kick = out_lines.iter().position(|l| *l == "M106 S255").unwrap();
        let target = out_lines.iter().position(|l| *l == "M106 S128").unwrap();
        assert!(kick < target);
        let between = out_lines[kick..target].iter().filter(|l| l.starts_with("G1 X")).count();
        assert_eq!(between, 1);
    }

    #[test]
    fn test_replace_param_keeps_comment() {
        assert_eq!(replace_param("G1 X1 Y2 ; move", 'X', "5"), "G1 X5 Y2 ; move");
        assert_eq!(replace_param("G1 X1 E0.2", 'E', "0.1"), "G1 X1 E0.1");
    }
}
