use burn::{module::Module, prelude::*};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::{
    Error, Result,
    inference::fit_to_patch_grid,
    model::{DepthModel, Encoder},
};

const IN_CHANNELS: u64 = 3;
const MLP_RATIO: u64 = 4;
const HEAD_HIDDEN_CHANNELS: u64 = 32;

/// Compute cost of one forward pass on a square synthetic input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EfficiencyReport {
    pub image_size: usize,
    pub flops: u64,
    pub params: usize,
    pub runs: usize,
    pub average_latency: Duration,
}

impl EfficiencyReport {
    pub fn gflops(&self) -> f64 {
        self.flops as f64 / 1e9
    }

    pub fn mparams(&self) -> f64 {
        self.params as f64 / 1e6
    }

    pub fn log(&self) {
        tracing::info!(
            image_size = self.image_size,
            runs = self.runs,
            "FLOPs (G) = {:.4}, Params (M) = {:.4}, Time (s) = {:.4}",
            self.gflops(),
            self.mparams(),
            self.average_latency.as_secs_f64()
        );
    }
}

/// Times `runs` forward passes of a zero `1x3xSxS` input after one warm-up pass.
pub fn benchmark<B: Backend>(
    model: &DepthModel<B>,
    image_size: usize,
    runs: usize,
) -> Result<EfficiencyReport> {
    if runs == 0 {
        return Err(Error::config("benchmark needs at least one run"));
    }
    let divisor = u32::try_from(runs)
        .map_err(|_| Error::config(format!("benchmark runs must fit in u32, got {runs}")))?;
    let network = model.network();
    let patch_size = network.patch_size();
    let (width, height) = fit_to_patch_grid(image_size, image_size, image_size, patch_size)?;
    let device = model.device();
    let input = Tensor::<B, 4>::zeros([1, 3, height, width], device);

    let warmup = network.forward(input.clone());
    B::sync(device);
    drop(warmup);

    let mut total = Duration::ZERO;
    for _ in 0..runs {
        let start = Instant::now();
        let output = network.forward(input.clone());
        B::sync(device);
        total += start.elapsed();
        drop(output);
    }

    Ok(EfficiencyReport {
        image_size: width,
        flops: estimate_flops(network.encoder(), width, patch_size),
        params: network.num_params(),
        runs,
        average_latency: total / divisor,
    })
}

fn conv_macs(out_h: u64, out_w: u64, c_in: u64, c_out: u64, kernel: u64) -> u64 {
    out_h * out_w * c_in * c_out * kernel * kernel
}

/// Multiply-accumulate count times two for a square input of side `size`
/// (already a multiple of `patch_size`). Biases, norms, and activations are
/// not counted.
pub fn estimate_flops(encoder: Encoder, size: usize, patch_size: usize) -> u64 {
    let grid = (size / patch_size) as u64;
    let patches = grid * grid;
    let tokens = patches + 1;
    let dim = encoder.embed_dim() as u64;
    let patch = patch_size as u64;

    let mut macs = patches * IN_CHANNELS * patch * patch * dim;

    // qkv, output projection, and the two MLP layers, then QK^T and AV.
    let per_block = tokens * dim * (3 * dim + dim + 2 * MLP_RATIO * dim) + 2 * tokens * tokens * dim;
    macs += per_block * encoder.depth() as u64;

    let features = encoder.features() as u64;
    let [c0, c1, c2, c3] = encoder.out_channels().map(|c| c as u64);
    for channels in [c0, c1, c2, c3] {
        macs += conv_macs(grid, grid, dim, channels, 1);
    }

    // Reassemble: 4x and 2x transposed convs, identity, stride-2 conv.
    let down = grid.div_ceil(2);
    macs += patches * c0 * c0 * 16;
    macs += patches * c1 * c1 * 4;
    macs += conv_macs(down, down, c3, c3, 3);

    let sizes = [grid * 4, grid * 2, grid, down];
    for (side, channels) in sizes.iter().zip([c0, c1, c2, c3]) {
        macs += conv_macs(*side, *side, channels, features, 3);
    }

    // Fusion: residual units run at the input side, out_conv at the output side.
    let residual = |side: u64| 2 * conv_macs(side, side, features, features, 3);
    let out_conv = |side: u64| conv_macs(side, side, features, features, 1);
    macs += residual(sizes[3]) + out_conv(sizes[2]);
    macs += 2 * residual(sizes[2]) + out_conv(sizes[1]);
    macs += 2 * residual(sizes[1]) + out_conv(sizes[0]);
    macs += 2 * residual(sizes[0]) + out_conv(sizes[0] * 2);

    let fused = sizes[0] * 2;
    let full = grid * patch;
    macs += conv_macs(fused, fused, features, features / 2, 3);
    macs += conv_macs(full, full, features / 2, HEAD_HIDDEN_CHANNELS, 3);
    macs += conv_macs(full, full, HEAD_HIDDEN_CHANNELS, 1, 1);

    2 * macs
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn benchmark_reports_positive_latency_and_exact_params() {
        let device = Default::default();
        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &device);
        let report = benchmark(&model, 28, 2).unwrap();

        assert!(report.average_latency > Duration::ZERO);
        assert_eq!(report.params, model.network().num_params());
        assert_eq!(report.runs, 2);
        assert_eq!(report.image_size, 28);
        assert!(report.flops > 0);
    }

    #[test]
    fn benchmark_rejects_zero_runs() {
        let device = Default::default();
        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &device);
        assert!(matches!(benchmark(&model, 28, 0), Err(Error::Config(_))));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn benchmark_rejects_runs_beyond_u32() {
        let device = Default::default();
        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &device);
        let runs = u32::MAX as usize + 1;
        assert!(matches!(benchmark(&model, 28, runs), Err(Error::Config(_))));
    }

    #[test]
    fn flops_for_a_single_patch_vits() {
        // One 14 px patch: grid 1, two tokens, fusion sides 4/2/1/1.
        let macs: u64 = [
            3 * 196 * 384,                      // patch embed
            12 * (2 * 384 * 12 * 384 + 2 * 4 * 384), // blocks
            384 * (48 + 96 + 192 + 384),        // projects
            48 * 48 * 16 + 96 * 96 * 4,         // transposed convs
            9 * 384 * 384,                      // stride-2 conv
            9 * 64 * (16 * 48 + 4 * 96 + 192 + 384), // layer_rn
            2 * 9 * 64 * 64 + 64 * 64,          // refinenet4
            4 * 9 * 64 * 64 + 4 * 64 * 64,      // refinenet3
            16 * 9 * 64 * 64 + 16 * 64 * 64,    // refinenet2
            64 * 9 * 64 * 64 + 64 * 64 * 64,    // refinenet1
            64 * 9 * 64 * 32,                   // output_conv1
            196 * 9 * 32 * 32 + 196 * 32,       // output_conv2
        ]
        .iter()
        .sum();
        assert_eq!(estimate_flops(Encoder::Vits, 14, 14), 2 * macs);
        assert_eq!(2 * macs, 103_826_688);
    }

    #[test]
    fn flops_grow_with_resolution_and_encoder() {
        let small = estimate_flops(Encoder::Vits, 518, 14);
        let larger_input = estimate_flops(Encoder::Vits, 798, 14);
        let larger_encoder = estimate_flops(Encoder::Vitl, 518, 14);
        assert!(larger_input > small);
        assert!(larger_encoder > small);
        let gflops = small as f64 / 1e9;
        assert!((115.0..116.0).contains(&gflops), "{gflops}");
    }
}
