//! # Toolpath
//!
//! Toolpath ordering and G-code emission for FFF slicing.
//!
//! This library takes the per-layer extrusion entities produced by a slicer's
//! perimeter/infill/support generators and turns them into a G-code stream:
//! - Bridge direction detection for unsupported regions
//! - Grouping of extrusions by extruder, object instance, island and region
//! - Travel planning with retraction, wipe and perimeter avoidance
//! - Role/volumetric/first-layer speed resolution and corner flow compensation
//! - Layer-by-layer export with skirt, brim, wipe tower and tool changes
//! - Fan command retiming as a post-processing pass
//!
//! ## Example
//!
//! ```rust,ignore
//! use toolpath::{export_gcode, Print, PrintConfig};
//!
//! let print: Print = serde_json::from_str(&std::fs::read_to_string("print.json")?)?;
//! let report = export_gcode(&print, &PrintConfig::default(), "out.gcode".as_ref(), None, None)?;
//! println!("{} layers", report.layer_count);
//! ```

// Core modules
pub mod bridge;
pub mod clipper;
pub mod config;
pub mod extrusion;
pub mod gcode;
pub mod geometry;
pub mod print;

// Re-export commonly used types
pub use config::{ExtruderConfig, LiftPolicy, PrintConfig, SeamPosition};
pub use extrusion::{
    ExtrusionEntity, ExtrusionEntityCollection, ExtrusionLoop, ExtrusionLoopRole,
    ExtrusionMultiPath, ExtrusionPath, ExtrusionRole,
};
pub use geometry::{BoundingBox, ExPolygon, Line, Point, PointF, Polygon, Polyline};
pub use print::{Layer, LayerRegion, LayerTools, Print, PrintInstance, PrintObject, SupportLayer};

// Re-export bridge detection
pub use bridge::{detect_object_bridges, BridgeDetector, BridgeDirection, BridgeRegion};

// Re-export clipper operations
pub use clipper::{
    diff_pl, difference, intersection, intersection_pl, offset_expolygons, offset_polygons,
    union, union_ex, OffsetJoinType,
};

// Re-export G-code generation
pub use gcode::{
    export_gcode, ExportReport, ExportWarning, FanTimingBuffer, GCodeWriter, LayerExportDriver,
    ObjectByExtruder, PlaceholderParser, TemplateEngine, TemplateError, ToolpathEmitter,
    WarningLevel,
};

/// Coordinate type used throughout the crate.
/// Using i64 for integer coordinates (scaled by SCALING_FACTOR) to avoid floating-point issues.
pub type Coord = i64;

/// Floating-point coordinate type for unscaled values.
pub type CoordF = f64;

/// Scaling factor: coordinates are stored as integers scaled by this factor.
/// 1 unit = 1 nanometer, so 1mm = 1_000_000 units.
pub const SCALING_FACTOR: f64 = 1_000_000.0;

/// Generic tolerance for comparisons of unscaled values (mm).
pub const EPSILON: f64 = 1e-4;

/// Tolerance for comparisons of scaled coordinates.
pub const SCALED_EPSILON: Coord = 100;

/// Scale a floating-point coordinate to integer.
#[inline]
pub fn scale(v: CoordF) -> Coord {
    (v * SCALING_FACTOR).round() as Coord
}

/// Unscale an integer coordinate to floating-point.
#[inline]
pub fn unscale(v: Coord) -> CoordF {
    v as CoordF / SCALING_FACTOR
}

/// Scale a length without rounding (for thresholds compared against float lengths).
#[inline]
pub fn scaled(v: CoordF) -> CoordF {
    v * SCALING_FACTOR
}

/// Unscale a float length expressed in internal units.
#[inline]
pub fn unscaled(v: CoordF) -> CoordF {
    v / SCALING_FACTOR
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for toolpath operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("G-code error: {0}")]
    GCode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid geometry: {0}")]
    Geometry(String),

    #[error("{0}")]
    Template(String),

    #[error("Wipe tower error: {0}")]
    WipeTower(String),

    #[error("There is an object with no extrusions on the first layer: {0}")]
    EmptyFirstLayer(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// True when the error is the cooperative cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling() {
        // 1mm should scale to 1_000_000
        assert_eq!(scale(1.0), 1_000_000);

        // And back
        assert!((unscale(1_000_000) - 1.0).abs() < 1e-10);

        // Sub-millimeter precision
        assert_eq!(scale(0.001), 1_000);
        assert!((scaled(0.5) - 500_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::GCode("x".into()).is_cancelled());
    }
}
