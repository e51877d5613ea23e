use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::{Vec2, Vec3, Vec4};
use kiln_core::GeometryProperties;
use kiln_render::{BatchKind, GeometryBatch};

fn bench_accumulate(c: &mut Criterion) {
    let quads: Vec<GeometryProperties> = (0..2_000)
        .map(|i| {
            let x = (i % 50) as f32;
            let y = (i / 50) as f32;
            GeometryProperties::rectangle(Vec3::new(x, y, 0.0), Vec2::splat(0.9))
                .with_color(Vec4::new(x / 50.0, y / 40.0, 0.5, 1.0))
        })
        .collect();
    let lines: Vec<GeometryProperties> = (0..2_000)
        .map(|i| {
            let t = i as f32;
            GeometryProperties::line(Vec3::new(t, 0.0, 0.0), Vec3::new(t, 1.0, 0.0))
        })
        .collect();

    let mut group = c.benchmark_group("Geometry batch");

    group.bench_function("2000 quads", |b| {
        let mut batch = GeometryBatch::new(BatchKind::Quads, 2_000);
        b.iter(|| {
            for quad in &quads {
                let _ = batch.emplace(black_box(quad));
            }
            black_box(batch.take_draw());
        });
    });

    group.bench_function("2000 lines", |b| {
        let mut batch = GeometryBatch::new(BatchKind::Lines, 2_000);
        b.iter(|| {
            for line in &lines {
                let _ = batch.emplace(black_box(line));
            }
            black_box(batch.take_draw());
        });
    });

    group.bench_function("quad index pattern", |b| {
        b.iter(|| black_box(BatchKind::Quads.generate_indices(black_box(2_000))));
    });

    group.finish();
}

criterion_group!(benches, bench_accumulate);
criterion_main!(benches);
