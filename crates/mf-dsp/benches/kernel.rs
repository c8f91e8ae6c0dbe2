//! Kernel sampling throughput, the hottest loop in the engine.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use mf_dsp::kernel::{default_lanczos, sample_with_kernel_1ch};

fn bench_kernel_sampling(c: &mut Criterion) {
    let src: Vec<f32> = (0..1 << 16).map(|i| (i as f32 * 0.01).sin()).collect();
    let frames = src.len() as i64;
    let mut group = c.benchmark_group("sample_with_kernel");
    for radius in [4usize, 13, 32] {
        let kernel = default_lanczos(radius);
        group.bench_function(format!("radius_{radius}"), |b| {
            let mut position = 1000.0f64;
            b.iter(|| {
                position += 0.37;
                if position > 60000.0 {
                    position = 1000.0;
                }
                let frame = position.trunc() as i64;
                let fraction = (position - frame as f64) as f32;
                black_box(sample_with_kernel_1ch(
                    kernel,
                    black_box(&src),
                    1,
                    0,
                    frames,
                    false,
                    frame,
                    fraction,
                    1.0,
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_kernel_sampling);
criterion_main!(benches);
