#![recursion_limit = "256"]

use burn::prelude::*;
use burn_dav2::{
    InferenceBackend,
    model::{DepthModel, Encoder},
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use image::{Rgb, RgbImage};
use std::hint::black_box;

criterion_group! {
    name = dav2_benchmarks;
    config = Criterion::default().sample_size(10);
    targets = inference_benchmark,
}
criterion_main!(dav2_benchmarks);

fn inference_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();
    let bench_device = device.clone();

    let model = DepthModel::<InferenceBackend>::new(Encoder::Vits, &device);
    let network = model.network();
    let input = Tensor::<InferenceBackend, 4>::zeros([1, 3, 518, 518], &device);
    let image = RgbImage::from_fn(640, 480, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));

    let mut group = c.benchmark_group("dav2_inference");
    group.throughput(Throughput::Elements(1));
    group.bench_function("vits_forward_518", |b| {
        b.iter(|| {
            let output = network.forward(input.clone());
            InferenceBackend::sync(&bench_device);
            black_box(output);
        });
    });
    group.bench_function("vits_infer_640x480", |b| {
        b.iter(|| {
            let depth = model.infer(&image, 518);
            black_box(depth.map(|d| d.width()).unwrap_or_default());
        });
    });
    group.finish();
}
