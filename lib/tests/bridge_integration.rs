//! Bridge direction integration tests.

use std::f64::consts::PI;
use toolpath::bridge::{detect_object_bridges, BridgeDetector};
use toolpath::clipper::total_area;
use toolpath::{ExPolygon, Layer, Point, PrintObject};

fn rect_mm(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygon {
    ExPolygon::rectangle(Point::new_scale(x0, y0), Point::new_scale(x1, y1))
}

/// A 5 x 20 mm gap with walls below and above it.
fn vertical_gap() -> (ExPolygon, Vec<ExPolygon>) {
    (
        rect_mm(0.0, 0.0, 5.0, 20.0),
        vec![rect_mm(0.0, -5.0, 5.0, 0.0), rect_mm(0.0, 20.0, 5.0, 25.0)],
    )
}

#[test]
fn test_bridge_runs_between_walls() {
    let (region, lower) = vertical_gap();
    let mut detector = BridgeDetector::new(region, &lower, 0.45);
    let direction = detector.detect_angle(None).expect("walls anchor the bridge");
    assert!((direction.angle - PI / 2.0).abs() < 3.0_f64.to_radians());
    assert!(direction.nb_lines_anchored > 0);
}

#[test]
fn test_same_input_same_angle() {
    let region = rect_mm(0.0, 0.0, 12.0, 8.0);
    // Support along the left and bottom edges only.
    let lower = vec![rect_mm(-4.0, -4.0, 0.0, 8.0), rect_mm(0.0, -4.0, 12.0, 0.0)];
    let angles: Vec<f64> = (0..3)
        .map(|_| {
            BridgeDetector::new(region.clone(), &lower, 0.45)
                .detect_angle(None)
                .map(|d| d.angle)
                .expect("two anchored edges")
        })
        .collect();
    assert!(angles.windows(2).all(|w| w[0] == w[1]));
    assert!((0.0..PI).contains(&angles[0]));
}

#[test]
fn test_floating_region_has_no_angle() {
    let (region, _) = vertical_gap();
    // Support exists but nowhere near the region.
    let far_away = vec![rect_mm(100.0, 100.0, 110.0, 110.0)];
    let mut detector = BridgeDetector::new(region, &far_away, 0.45);
    assert!(detector.detect_angle(None).is_none());
    assert!(detector.anchor_regions().is_empty());
}

#[test]
fn test_detected_angle_covers_region() {
    let (region, lower) = vertical_gap();
    let area = total_area(std::slice::from_ref(&region));
    let mut detector = BridgeDetector::new(region, &lower, 0.45);
    let angle = detector.detect_angle(None).unwrap().angle;
    let covered = detector.coverage(angle, false);
    assert!(total_area(&covered) >= 0.9 * area);
    assert_eq!(covered, detector.coverage(angle, false));
}

#[test]
fn test_object_bridges_in_layer_order() {
    let mut object = PrintObject::new("table");
    let legs = vec![rect_mm(0.0, 0.0, 3.0, 3.0), rect_mm(17.0, 0.0, 20.0, 3.0)];
    let top = vec![rect_mm(0.0, 0.0, 20.0, 3.0)];
    for id in 0..4 {
        object.layers.push(Layer {
            id,
            print_z: 0.2 * (id + 1) as f64,
            height: 0.2,
            slices: if id < 2 { legs.clone() } else { top.clone() },
            ..Default::default()
        });
    }

    let bridges = detect_object_bridges(&object, 0.45);
    // Only the first layer of the top overhangs.
    assert_eq!(bridges.len(), 1);
    assert_eq!(bridges[0].layer_id, 2);
    let direction = bridges[0].direction.as_ref().unwrap();
    assert!(direction.angle.min(PI - direction.angle) < 3.0_f64.to_radians());
}
