use burn::prelude::*;
use image::{
    RgbImage,
    imageops::{self, FilterType},
};

use crate::{Error, Result};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Network input size for a `width` x `height` image.
///
/// Keeps the aspect ratio while scaling so that both sides reach at least
/// `input_size`, then snaps each side to a multiple of `patch_size`: nearest
/// multiple first, rounding up instead when that falls below `input_size`.
pub fn fit_to_patch_grid(
    width: usize,
    height: usize,
    input_size: usize,
    patch_size: usize,
) -> Result<(usize, usize)> {
    if input_size == 0 {
        return Err(Error::config("input size must be non-zero"));
    }
    if patch_size == 0 {
        return Err(Error::config("patch size must be non-zero"));
    }
    if width == 0 || height == 0 {
        return Err(Error::config(format!(
            "cannot resize an empty {width}x{height} image"
        )));
    }

    let target = input_size as f64;
    let scale = (target / width as f64).max(target / height as f64);
    let snap = |value: f64| {
        let multiple = patch_size as f64;
        let nearest = (value / multiple).round_ties_even() * multiple;
        let snapped = if nearest < target {
            (value / multiple).ceil() * multiple
        } else {
            nearest
        };
        snapped as usize
    };

    Ok((snap(width as f64 * scale), snap(height as f64 * scale)))
}

/// Converts packed RGB bytes into an ImageNet-normalized `NCHW` tensor.
///
/// The input slice must contain `width * height * 3` bytes in row-major order.
pub fn rgb_to_input_tensor<B: Backend>(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or_else(|| Error::config("image dimensions overflowed while preparing input"))?;

    if rgb.len() != expected_len {
        return Err(Error::config(format!(
            "expected {expected_len} RGB bytes for {width}x{height}, got {}",
            rgb.len()
        )));
    }

    let hw = width * height;
    let mut data = vec![0.0f32; 3 * hw];

    for (idx, pixel) in rgb.chunks_exact(3).enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * hw + idx] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    Ok(
        Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([
            1,
            3,
            height as i32,
            width as i32,
        ]),
    )
}

/// Resizes `image` onto the patch grid and normalizes it for the network.
pub fn prepare_input<B: Backend>(
    image: &RgbImage,
    input_size: usize,
    patch_size: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let (width, height) = fit_to_patch_grid(
        image.width() as usize,
        image.height() as usize,
        input_size,
        patch_size,
    )?;

    let resized;
    let pixels = if (width, height) == (image.width() as usize, image.height() as usize) {
        image
    } else {
        resized = imageops::resize(image, width as u32, height as u32, FilterType::CatmullRom);
        &resized
    };

    rgb_to_input_tensor::<B>(pixels.as_raw(), width, height, device)
}
