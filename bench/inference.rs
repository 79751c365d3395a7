#![recursion_limit = "256"]

use burn::prelude::*;
use burn_refinenet::{
    InferenceBackend,
    model::refinenet::{
        BackboneDepth, RefineNet, RefineNetConfig, ScoreInterpolation,
        interpolate::resize_scores,
    },
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

criterion_group! {
    name = refinenet_benchmarks;
    config = Criterion::default().sample_size(10);
    targets = inference_benchmark, score_fusion_benchmark,
}
criterion_main!(refinenet_benchmarks);

const CLASSES: usize = 21;
const SIZE: usize = 256;

fn inference_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();
    let bench_device = device.clone();
    let input = Tensor::<InferenceBackend, 4>::zeros([1, 3, SIZE, SIZE], &device);

    let mut group = c.benchmark_group("refinenet_inference");
    group.throughput(Throughput::Elements(1));
    for depth in [BackboneDepth::ResNet18, BackboneDepth::ResNet50] {
        let model = RefineNet::<InferenceBackend>::new(
            &device,
            RefineNetConfig::new(depth, CLASSES).with_pretrained(false),
        );
        group.bench_function(format!("rf_lw{}_infer_{SIZE}", depth.layers()), |b| {
            b.iter(|| {
                let output = model.infer(input.clone());
                InferenceBackend::sync(&bench_device);
                black_box(output);
            });
        });
    }
    group.finish();
}

fn score_fusion_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();
    let bench_device = device.clone();

    // Coarsest auxiliary map back to input resolution.
    let scores = Tensor::<InferenceBackend, 4>::random(
        [1, CLASSES, SIZE / 32, SIZE / 32],
        burn::tensor::Distribution::Default,
        &device,
    );

    let mut group = c.benchmark_group("refinenet_score_resize");
    for (name, method) in [
        ("align_corners", ScoreInterpolation::AlignCorners),
        ("half_pixel", ScoreInterpolation::HalfPixel),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let output = resize_scores(scores.clone(), [SIZE, SIZE], method);
                InferenceBackend::sync(&bench_device);
                black_box(output);
            });
        });
    }
    group.finish();
}
