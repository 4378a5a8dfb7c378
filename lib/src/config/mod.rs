//! Print configuration.

mod print_config;

pub use print_config::{
    ExtruderConfig, FloatOrPercent, GCodeFlavor, LiftPolicy, PrintConfig, SeamPosition,
};
