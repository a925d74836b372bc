use burn::{
    nn::interpolate::{Interpolate2dConfig, InterpolateMode},
    prelude::*,
};

/// Bilinear resize of an `NCHW` tensor to `output_size` (`[height, width]`).
///
/// Sampling follows `align_corners = true`, which is what the fusion blocks
/// and the output projection were trained with.
pub fn resize_bilinear<B: Backend>(input: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, in_height, in_width] = input.shape().dims::<4>();
    if [in_height, in_width] == output_size {
        return input;
    }

    Interpolate2dConfig::new()
        .with_output_size(Some(output_size))
        .with_mode(InterpolateMode::Linear)
        .init()
        .forward(input)
}

/// Upsamples by an integer factor, used by the last fusion block.
pub fn upsample2x<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = input.shape().dims::<4>();
    resize_bilinear(input, [height * 2, width * 2])
}
