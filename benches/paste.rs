//! Benchmarks for the slice-insertion primitive.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::{Matrix4, Vector3};

use sonovol::recon::{paste_slice, AccumulationBuffer, PasteOptions, VoxelVolume};
use sonovol::schema::{ImageBuffer, InterpolationMode, OptimizationLevel, PixelData, ScalarType};

fn bench_paste_slice(c: &mut Criterion) {
    let mut group = c.benchmark_group("paste_slice");

    for size in [64usize, 128, 256] {
        let extent = [0, size as i32 - 1, 0, size as i32 - 1, 0, size as i32 - 1];
        let pixels: Vec<u8> = (0..size * size).map(|i| (i % 251) as u8).collect();
        let slice = ImageBuffer::from_data(size, size, 1, 1, PixelData::U8(pixels)).unwrap();
        let pose = Matrix4::new_translation(&Vector3::new(0.0, 0.0, size as f64 / 2.0));

        for (label, optimization) in [
            ("full", OptimizationLevel::Full),
            ("partial", OptimizationLevel::Partial),
            ("none", OptimizationLevel::None),
        ] {
            let options = PasteOptions {
                optimization,
                interpolation: InterpolationMode::Linear,
                ..Default::default()
            };
            let mut volume = VoxelVolume::allocate(
                extent,
                [1.0, 1.0, 1.0],
                [0.0, 0.0, 0.0],
                ScalarType::U8,
                2,
            )
            .unwrap();
            let mut accumulation = AccumulationBuffer::allocate(extent).unwrap();

            group.bench_with_input(
                BenchmarkId::new(label, format!("{size}^3")),
                &size,
                |b, _| {
                    b.iter(|| {
                        paste_slice(
                            black_box(&mut volume),
                            black_box(&mut accumulation),
                            black_box(&slice),
                            black_box(&pose),
                            &options,
                        )
                        .unwrap();
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_paste_slice);
criterion_main!(benches);
