//! G-code generation module.
//!
//! This module turns the per-layer extrusions of a [`crate::print::Print`]
//! into a G-code stream: the machine state writer, extrusion grouping,
//! travel planning, the toolpath emitter, the whole-print export driver and
//! the fan retiming pass.

pub mod avoid_crossing;
pub mod emitter;
pub mod export;
pub mod fan_mover;
pub mod ordering;
pub mod retract_crossing;
pub mod seam;
pub mod spiral_vase;
pub mod template;
pub mod wipe;
pub mod wipe_tower;
pub mod writer;

pub use avoid_crossing::AvoidCrossingPerimeters;
pub use emitter::{
    corner_cut_coefficient, split_for_deceleration, LayerContext, SpeedRequest, ToolpathEmitter,
    CUT_CORNER_TABLE,
};
pub use export::{
    export_gcode, skirt_loops_per_extruder, DriverState, ExportReport, ExportSession, ExportWarning,
    LayerExportDriver, WarningLevel,
};
pub use fan_mover::FanTimingBuffer;
pub use ordering::{
    collect_layers_to_print, BucketEntry, InstanceToPrint, Island, LayerPlan, LayerToPrint,
    ObjectByExtruder, Region,
};
pub use retract_crossing::{RetractDecision, RetractWhenCrossingPerimeters};
pub use seam::{NearestSeamPlacer, SeamPlacer, SeamRequest};
pub use spiral_vase::SpiralVase;
pub use template::{PlaceholderParser, TemplateContext, TemplateEngine, TemplateError, TemplateValue};
pub use wipe::Wipe;
pub use wipe_tower::WipeTowerIntegration;
pub use writer::{format_number, Extruder, GCodeWriter};
