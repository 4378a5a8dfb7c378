//! End-to-end export tests.
//!
//! These tests drive a whole print through the public API:
//! - export to disk with the tmp-file-then-rename protocol
//! - the JSON forms of the print and the configuration used by the CLI
//! - fan retiming over an exported stream

use std::fs;
use std::sync::atomic::AtomicBool;
use toolpath::extrusion::flow_mm3_per_mm;
use toolpath::{
    export_gcode, ExPolygon, ExtrusionEntityCollection, ExtrusionLoop, ExtrusionLoopRole,
    ExtrusionPath, ExtrusionRole, FanTimingBuffer, Layer, LayerRegion, Point, Polygon, Print,
    PrintConfig, PrintObject,
};

fn square(x: f64, size: f64) -> Polygon {
    Polygon::rectangle(Point::new_scale(x, 0.0), Point::new_scale(x + size, size))
}

fn loops(role: ExtrusionRole, polygons: &[Polygon]) -> ExtrusionEntityCollection {
    let template = ExtrusionPath::new(role, flow_mm3_per_mm(0.45, 0.2), 0.45, 0.2);
    let mut coll = ExtrusionEntityCollection::default();
    for polygon in polygons {
        coll.push(ExtrusionLoop::from_polygon(
            polygon,
            template.clone(),
            ExtrusionLoopRole::Default,
        ));
    }
    coll
}

/// A 10 mm hollow cube: two perimeters per layer.
fn cube(name: &str, x: f64, n_layers: usize) -> PrintObject {
    let mut object = PrintObject::new(name);
    for id in 0..n_layers {
        let mut region = LayerRegion::default();
        region.perimeters.push(loops(
            ExtrusionRole::ExternalPerimeter,
            &[square(x, 10.0)],
        ));
        region.perimeters.push(loops(
            ExtrusionRole::Perimeter,
            &[Polygon::rectangle(
                Point::new_scale(x + 0.45, 0.45),
                Point::new_scale(x + 9.55, 9.55),
            )],
        ));
        object.layers.push(Layer {
            id,
            print_z: 0.2 * (id + 1) as f64,
            height: 0.2,
            slices: vec![ExPolygon::new(square(x, 10.0))],
            regions: vec![region],
        });
    }
    object
}

fn is_fan(line: &str) -> bool {
    line.starts_with("M106") || line.starts_with("M107")
}

fn without_fan_lines(gcode: &str) -> Vec<&str> {
    gcode.lines().filter(|l| !is_fan(l)).collect()
}

#[test]
fn test_export_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cubes.gcode");
    let print = Print {
        objects: vec![cube("left", 0.0, 5), cube("right", 20.0, 5)],
        ..Default::default()
    };
    let report = export_gcode(&print, &PrintConfig::default(), &path, None, None).unwrap();

    let gcode = fs::read_to_string(&path).unwrap();
    assert_eq!(gcode.matches(";LAYER_CHANGE").count(), 5);
    assert_eq!(report.layer_count, 5);
    assert!(report.total_filament_mm() > 0.0);
    assert!(!report.has_critical_warnings());
    assert!(!dir.path().join("cubes.gcode.tmp").exists());

    // Both objects share every layer.
    let second_layer = gcode.find(";Z:0.4").unwrap();
    let first_layer = &gcode[..second_layer];
    assert!(first_layer.contains("G1 X20 "));
    assert!(first_layer.contains("G1 X30 "));
}

#[test]
fn test_cancelled_export_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancelled.gcode");
    let print = Print {
        objects: vec![cube("cube", 0.0, 3)],
        ..Default::default()
    };
    let cancel = AtomicBool::new(true);
    let err = export_gcode(&print, &PrintConfig::default(), &path, None, Some(&cancel)).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!path.exists());
    assert!(!dir.path().join("cancelled.gcode.tmp").exists());
}

#[test]
fn test_object_without_copies_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invalid.gcode");
    let mut object = cube("cube", 0.0, 2);
    object.instances.clear();
    let print = Print {
        objects: vec![object],
        ..Default::default()
    };
    let err = export_gcode(&print, &PrintConfig::default(), &path, None, None).unwrap_err();
    assert!(matches!(err, toolpath::Error::Geometry(_)));
    assert!(!path.exists());
}

#[test]
fn test_print_json_round_trip_exports_identically() {
    let print = Print {
        objects: vec![cube("cube", 0.0, 3)],
        ..Default::default()
    };
    let json = serde_json::to_string(&print).unwrap();
    let loaded: Print = serde_json::from_str(&json).unwrap();
    assert_eq!(loaded, print);

    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.gcode");
    let b = dir.path().join("b.gcode");
    let config = PrintConfig::default();
    export_gcode(&print, &config, &a, None, None).unwrap();
    export_gcode(&loaded, &config, &b, None, None).unwrap();
    assert_eq!(fs::read_to_string(a).unwrap(), fs::read_to_string(b).unwrap());
}

#[test]
fn test_partial_config_json_takes_defaults() {
    let config: PrintConfig = serde_json::from_str(r#"{ "travel_speed": 150.0 }"#).unwrap();
    let defaults = PrintConfig::default();
    assert_eq!(config.travel_speed, 150.0);
    assert_eq!(config.extruders, defaults.extruders);
    assert_eq!(config.start_gcode, defaults.start_gcode);
    assert!(config.validate().is_ok());
}

#[test]
fn test_fan_speedup_only_moves_fan_lines() {
    let print = Print {
        objects: vec![cube("cube", 0.0, 4)],
        ..Default::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let plain_path = dir.path().join("plain.gcode");
    let early_path = dir.path().join("early.gcode");

    export_gcode(&print, &PrintConfig::default(), &plain_path, None, None).unwrap();
    let config = PrintConfig::default().fan_speedup_time(1.0);
    export_gcode(&print, &config, &early_path, None, None).unwrap();

    let plain = fs::read_to_string(plain_path).unwrap();
    let early = fs::read_to_string(early_path).unwrap();
    assert_eq!(without_fan_lines(&plain), without_fan_lines(&early));

    // The first speed-up is written no later than without retiming.
    let first_on = |text: &str| text.lines().position(|l| l.starts_with("M106 S255"));
    assert!(first_on(&early).unwrap() <= first_on(&plain).unwrap());
}

#[test]
fn test_retiming_exported_stream_preserves_motion() {
    let print = Print {
        objects: vec![cube("cube", 0.0, 4)],
        ..Default::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.gcode");
    let config = PrintConfig::default();
    export_gcode(&print, &config, &path, None, None).unwrap();
    let exported = fs::read_to_string(&path).unwrap();

    // Fed in blocks, the way the CLI streams a file.
    let mut buffer = FanTimingBuffer::new(2.0, config.use_relative_e_distances);
    let mut retimed = String::new();
    let lines: Vec<&str> = exported.lines().collect();
    for block in lines.chunks(64) {
        let text: String = block.iter().map(|l| format!("{}\n", l)).collect();
        retimed.push_str(&buffer.process(&text, false));
    }
    retimed.push_str(&buffer.process("", true));

    assert_eq!(without_fan_lines(&exported), without_fan_lines(&retimed));
    assert!(buffer.is_empty());
}
