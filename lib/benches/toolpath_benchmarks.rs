//! Toolpath benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use toolpath::bridge::BridgeDetector;
use toolpath::{ExPolygon, FanTimingBuffer, Point};

fn rect_mm(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygon {
    ExPolygon::rectangle(Point::new_scale(x0, y0), Point::new_scale(x1, y1))
}

fn bench_bridge_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge_detect_angle");
    group.sample_size(10);

    for &span in &[10.0, 40.0] {
        let region = rect_mm(0.0, 0.0, span, 8.0);
        let lower = vec![
            rect_mm(-5.0, 0.0, 0.0, 8.0),
            rect_mm(span, 0.0, span + 5.0, 8.0),
        ];
        group.bench_with_input(
            BenchmarkId::new("two_pillars", span as u32),
            &(region, lower),
            |b, (region, lower)| {
                b.iter(|| {
                    let mut detector = BridgeDetector::new(region.clone(), lower, 0.45);
                    black_box(detector.detect_angle(None))
                })
            },
        );
    }
    group.finish();

    let detector = BridgeDetector::new(
        rect_mm(0.0, 0.0, 20.0, 8.0),
        &[rect_mm(-5.0, 0.0, 0.0, 8.0), rect_mm(20.0, 0.0, 25.0, 8.0)],
        0.45,
    );
    c.bench_function("bridge_coverage_precise", |b| {
        b.iter(|| black_box(detector.coverage(black_box(0.0), true)))
    });
}

/// Zig-zag infill with a fan change every 50 moves.
fn synthetic_gcode(moves: usize) -> String {
    let mut out = String::from("G1 F3000\n");
    for i in 0..moves {
        if i % 50 == 25 {
            out.push_str(if (i / 50) % 2 == 0 { "M106 S255\n" } else { "M106 S80\n" });
        }
        let x = if i % 2 == 0 { 10.0 } else { 60.0 };
        out.push_str(&format!("G1 X{} Y{:.3} E1.2\n", x, i as f64 * 0.45));
    }
    out
}

fn bench_fan_retiming(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_retiming");
    for &n in &[1_000usize, 10_000] {
        let gcode = synthetic_gcode(n);
        group.bench_with_input(BenchmarkId::new("moves", n), &gcode, |b, gcode| {
            b.iter(|| {
                let mut buffer = FanTimingBuffer::new(1.5, true).split_moves(true);
                black_box(buffer.process(black_box(gcode), true))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bridge_detection, bench_fan_retiming);
criterion_main!(benches);
