//! Custom G-code templates.
//!
//! Start/end/layer/tool change scripts are user-provided text with named
//! placeholders. Rendering goes through the [`TemplateEngine`] trait so the
//! emitter never deals with template syntax itself. [`PlaceholderParser`] is
//! the stock engine and understands:
//!
//! - `[name]` and `[name_N]` (element `N` of a vector variable)
//! - `{name}` and `{name[index]}`, where `index` is a literal or a variable
//!
//! Unknown variables and unbalanced braces are reported as [`TemplateError`].

use crate::config::PrintConfig;
use crate::CoordF;
use std::collections::BTreeMap;
use std::fmt;

/// A failed template rendering.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Failed to process the custom G-code template {name}: {message}")]
pub struct TemplateError {
    /// Name of the template (e.g. `layer_gcode`).
    pub name: String,
    pub message: String,
}

impl TemplateError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Value bound to a template variable.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Int(i64),
    Float(CoordF),
    Bool(bool),
    Text(String),
    List(Vec<TemplateValue>),
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Int(v) => write!(f, "{}", v),
            TemplateValue::Float(v) => write!(f, "{}", super::writer::format_number(*v, 6)),
            TemplateValue::Bool(v) => write!(f, "{}", if *v { "true" } else { "false" }),
            TemplateValue::Text(v) => f.write_str(v),
            TemplateValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for TemplateValue {
            fn from(v: $t) -> Self {
                TemplateValue::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i32, i64, u16, u32, usize);

impl From<CoordF> for TemplateValue {
    fn from(v: CoordF) -> Self {
        TemplateValue::Float(v)
    }
}

impl From<bool> for TemplateValue {
    fn from(v: bool) -> Self {
        TemplateValue::Bool(v)
    }
}

impl From<&str> for TemplateValue {
    fn from(v: &str) -> Self {
        TemplateValue::Text(v.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(v: String) -> Self {
        TemplateValue::Text(v)
    }
}

impl<T: Into<TemplateValue>> From<Vec<T>> for TemplateValue {
    fn from(v: Vec<T>) -> Self {
        TemplateValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Variables available to one rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    vars: BTreeMap<String, TemplateValue>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: bind `name`.
    pub fn with(mut self, name: &str, value: impl Into<TemplateValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<TemplateValue>) {
        self.vars.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.vars.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Renders a named template against a set of variables.
pub trait TemplateEngine {
    fn render(&self, name: &str, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError>;
}

/// Placeholder substitution over the print configuration plus per-call variables.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderParser {
    globals: TemplateContext,
}

impl PlaceholderParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose the configuration values commonly used in custom scripts.
    pub fn from_config(config: &PrintConfig) -> Self {
        let ext = &config.extruders;
        let globals = TemplateContext::new()
            .with("temperature", ext.iter().map(|e| e.temperature).collect::<Vec<_>>())
            .with(
                "first_layer_temperature",
                ext.iter().map(|e| e.first_layer_temperature).collect::<Vec<_>>(),
            )
            .with("nozzle_diameter", ext.iter().map(|e| e.nozzle_diameter).collect::<Vec<_>>())
            .with("filament_diameter", ext.iter().map(|e| e.filament_diameter).collect::<Vec<_>>())
            .with("retract_length", ext.iter().map(|e| e.retract_length).collect::<Vec<_>>())
            .with(
                "retract_length_toolchange",
                ext.iter().map(|e| e.retract_length_toolchange).collect::<Vec<_>>(),
            )
            .with("bed_temperature", config.bed_temperature)
            .with("first_layer_bed_temperature", config.first_layer_bed_temperature)
            .with("travel_speed", config.travel_speed)
            .with("extruders_count", ext.len())
            .with("use_relative_e_distances", config.use_relative_e_distances)
            .with("spiral_vase", config.spiral_vase)
            .with("z_offset", config.z_offset);
        Self { globals }
    }

    /// Bind a variable visible to every rendering.
    pub fn set(&mut self, name: &str, value: impl Into<TemplateValue>) {
        self.globals.set(name, value);
    }

    fn lookup<'a>(&'a self, ctx: &'a TemplateContext, name: &str) -> Option<&'a TemplateValue> {
        ctx.get(name).or_else(|| self.globals.get(name))
    }

    fn resolve(&self, ctx: &TemplateContext, name: &str, expr: &str) -> Result<String, TemplateError> {
        let expr = expr.trim();
        let (var, index) = match expr.find('[') {
            Some(open) => {
                let Some(inner) = expr[open + 1..].strip_suffix(']') else {
                    return Err(TemplateError::new(name, format!("Malformed index in '{}'", expr)));
                };
                (expr[..open].trim(), Some(self.resolve_index(ctx, name, inner.trim())?))
            }
            None => (expr, None),
        };
        if !is_identifier(var) {
            return Err(TemplateError::new(name, format!("Invalid expression '{}'", expr)));
        }
        let value = self
            .lookup(ctx, var)
            .ok_or_else(|| TemplateError::new(name, format!("Variable does not exist: {}", var)))?;
        match (value, index) {
            (TemplateValue::List(items), Some(i)) => items
                .get(i)
                .map(ToString::to_string)
                .ok_or_else(|| TemplateError::new(name, format!("Index {} out of range for {}", i, var))),
            (_, Some(_)) => Err(TemplateError::new(name, format!("Variable {} is not a vector", var))),
            (value, None) => Ok(value.to_string()),
        }
    }

    fn resolve_index(&self, ctx: &TemplateContext, name: &str, index: &str) -> Result<usize, TemplateError> {
        if let Ok(i) = index.parse::<usize>() {
            return Ok(i);
        }
        match self.lookup(ctx, index) {
            Some(TemplateValue::Int(i)) if *i >= 0 => Ok(*i as usize),
            Some(_) => Err(TemplateError::new(name, format!("Index {} is not a non-negative integer", index))),
            None => Err(TemplateError::new(name, format!("Variable does not exist: {}", index))),
        }
    }

    /// Legacy `[name]` / `[name_N]` lookup. Returns `None` when the bracket
    /// does not hold a placeholder at all.
    fn resolve_legacy(&self, ctx: &TemplateContext, name: &str, inner: &str) -> Option<Result<String, TemplateError>> {
        if !is_identifier(inner) {
            return None;
        }
        if self.lookup(ctx, inner).is_some() {
            return Some(self.resolve(ctx, name, inner));
        }
        if let Some((base, idx)) = inner.rsplit_once('_') {
            if let Ok(i) = idx.parse::<usize>() {
                if let Some(TemplateValue::List(_)) = self.lookup(ctx, base) {
                    return Some(self.resolve(ctx, name, &format!("{}[{}]", base, i)));
                }
            }
        }
        Some(Err(TemplateError::new(name, format!("Variable does not exist: {}", inner))))
    }
}

impl TemplateEngine for PlaceholderParser {
    fn render(&self, name: &str, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find(['[', '{']) {
            out.push_str(&rest[..pos]);
            let open = rest.as_bytes()[pos] as char;
            let close = if open == '[' { ']' } else { '}' };
            let after = &rest[pos + 1..];
            let Some(end) = find_close(after, open, close) else {
                if open == '{' {
                    return Err(TemplateError::new(name, "Unclosed '{' in template"));
                }
                out.push_str(&rest[pos..]);
                return Ok(out);
            };
            let inner = &after[..end];
            if open == '{' {
                out.push_str(&self.resolve(ctx, name, inner)?);
            } else {
                match self.resolve_legacy(ctx, name, inner.trim()) {
                    Some(result) => out.push_str(&result?),
                    None => {
                        out.push('[');
                        out.push_str(inner);
                        out.push(']');
                    }
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Position of the bracket closing an already opened one, honoring nesting.
fn find_close(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_untouched() {
        let p = PlaceholderParser::new();
        let out = p.render("t", "G28 ; home\nG1 Z5", &TemplateContext::new()).unwrap();
        assert_eq!(out, "G28 ; home\nG1 Z5");
    }

    #[test]
    fn test_curly_and_legacy_variables() {
        let p = PlaceholderParser::new();
        let ctx = TemplateContext::new().with("layer_num", 3usize).with("layer_z", 0.6);
        let out = p.render("layer_gcode", "; layer {layer_num} at [layer_z]", &ctx).unwrap();
        assert_eq!(out, "; layer 3 at 0.6");
    }

    #[test]
    fn test_vector_indexing() {
        let p = PlaceholderParser::from_config(&PrintConfig::default());
        let ctx = TemplateContext::new().with("next_extruder", 0u16);
        let out = p
            .render("start", "M104 S{temperature[next_extruder]} M140 S[bed_temperature] [temperature_0]", &ctx)
            .unwrap();
        assert_eq!(out, "M104 S210 M140 S60 210");
    }

    #[test]
    fn test_context_overrides_globals() {
        let mut p = PlaceholderParser::new();
        p.set("layer_z", 1.0);
        let ctx = TemplateContext::new().with("layer_z", 2.5);
        assert_eq!(p.render("t", "{layer_z}", &ctx).unwrap(), "2.5");
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let p = PlaceholderParser::new();
        let err = p.render("end_gcode", "M104 S{nope}", &TemplateContext::new()).unwrap_err();
        assert_eq!(err.name, "end_gcode");
        assert!(err.message.contains("nope"));
        assert!(err.to_string().contains("end_gcode"));
    }

    #[test]
    fn test_unclosed_brace_is_error() {
        let p = PlaceholderParser::new();
        assert!(p.render("t", "G1 {layer_z", &TemplateContext::new()).is_err());
    }

    #[test]
    fn test_non_placeholder_brackets_kept() {
        let p = PlaceholderParser::new();
        let out = p.render("t", "; see [1 2] and [", &TemplateContext::new()).unwrap();
        assert_eq!(out, "; see [1 2] and [");
    }

    #[test]
    fn test_index_out_of_range() {
        let p = PlaceholderParser::from_config(&PrintConfig::default());
        assert!(p.render("t", "{temperature[4]}", &TemplateContext::new()).is_err());
    }
}
