pub mod depth_anything_v2;

use burn::{
    module::Module,
    prelude::*,
    record::{HalfPrecisionSettings, NamedMpkFileRecorder},
};
use burn_store::{ModuleSnapshot, PytorchStore};
use clap::ValueEnum;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

use crate::{Error, Result, inference};
use depth_anything_v2::{
    DepthAnythingV2, DepthAnythingV2Config, pytorch_key_remapper, resize_bilinear,
    with_model_load_stack,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    Vits,
    Vitb,
    Vitl,
    Vitg,
}

impl Encoder {
    pub const ALL: [Encoder; 4] = [Encoder::Vits, Encoder::Vitb, Encoder::Vitl, Encoder::Vitg];

    pub fn as_str(self) -> &'static str {
        match self {
            Encoder::Vits => "vits",
            Encoder::Vitb => "vitb",
            Encoder::Vitl => "vitl",
            Encoder::Vitg => "vitg",
        }
    }

    pub fn embed_dim(self) -> usize {
        match self {
            Encoder::Vits => 384,
            Encoder::Vitb => 768,
            Encoder::Vitl => 1024,
            Encoder::Vitg => 1536,
        }
    }

    pub fn depth(self) -> usize {
        match self {
            Encoder::Vits | Encoder::Vitb => 12,
            Encoder::Vitl => 24,
            Encoder::Vitg => 40,
        }
    }

    pub fn features(self) -> usize {
        match self {
            Encoder::Vits => 64,
            Encoder::Vitb => 128,
            Encoder::Vitl => 256,
            Encoder::Vitg => 384,
        }
    }

    pub fn out_channels(self) -> [usize; 4] {
        match self {
            Encoder::Vits => [48, 96, 192, 384],
            Encoder::Vitb => [96, 192, 384, 768],
            Encoder::Vitl => [256, 512, 1024, 1024],
            Encoder::Vitg => [1536, 1536, 1536, 1536],
        }
    }

    pub fn hooked_blocks(self) -> [usize; 4] {
        match self {
            Encoder::Vits | Encoder::Vitb => [2, 5, 8, 11],
            Encoder::Vitl => [4, 11, 17, 23],
            Encoder::Vitg => [9, 19, 29, 39],
        }
    }

    pub fn default_checkpoint(self) -> String {
        format!("assets/model/depth_anything_v2_{}.mpk", self.as_str())
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoder {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        Encoder::ALL
            .into_iter()
            .find(|encoder| encoder.as_str() == value)
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown encoder `{value}`, expected one of vits, vitb, vitl, vitg"
                ))
            })
    }
}

/// Single-channel relative depth with the spatial shape of its source image.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DepthStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub finite: usize,
}

impl DepthMap {
    pub fn new(width: usize, height: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != width * height {
            return Err(Error::Inference(format!(
                "depth map holds {} values for {width}x{height}",
                values.len()
            )));
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Min, max, and mean over finite values; `None` when nothing is finite.
    pub fn stats(&self) -> Option<DepthStats> {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut finite = 0usize;
        for &value in self.values.iter().filter(|v| v.is_finite()) {
            min = min.min(value);
            max = max.max(value);
            sum += value as f64;
            finite += 1;
        }
        (finite > 0).then(|| DepthStats {
            min,
            max,
            mean: (sum / finite as f64) as f32,
            finite,
        })
    }
}

/// Loaded network bound to its compute device.
#[derive(Debug)]
pub struct DepthModel<B: Backend> {
    network: DepthAnythingV2<B>,
    device: B::Device,
}

impl<B: Backend> DepthModel<B> {
    /// Randomly initialized network, mainly for benchmarking and tests.
    pub fn new(encoder: Encoder, device: &B::Device) -> Self {
        Self {
            network: DepthAnythingV2::new(device, DepthAnythingV2Config::from_encoder(encoder)),
            device: device.clone(),
        }
    }

    /// Loads a `.mpk` Burn record or a `.pth`/`.pt` PyTorch state dict.
    pub fn load(weights: &Path, encoder: Encoder, device: &B::Device) -> Result<Self> {
        if !weights.is_file() {
            return Err(Error::load(weights, "file not found"));
        }

        let extension = weights
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = DepthAnythingV2Config::from_encoder(encoder);

        let network = match extension.as_str() {
            "mpk" => {
                let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
                with_model_load_stack(|| {
                    DepthAnythingV2::<B>::new(device, config).load_file(weights, &recorder, device)
                })
                .map_err(|err| Error::load(weights, err))?
            }
            "pth" | "pt" if encoder == Encoder::Vitg => {
                // burn_dino's vitg uses a plain MLP; published vitg weights carry SwiGLU.
                return Err(Error::config(
                    "vitg cannot load PyTorch checkpoints: its SwiGLU feed-forward \
                     layers have no counterpart in this backbone",
                ));
            }
            "pth" | "pt" => {
                let mut store = PytorchStore::from_file(weights)
                    .remap(pytorch_key_remapper()?)
                    .allow_partial(false)
                    .validate(true);
                let mut network = DepthAnythingV2::<B>::new(device, config);
                let result = with_model_load_stack(|| network.load_from(&mut store))
                    .map_err(|err| Error::load(weights, err))?;
                tracing::debug!(
                    applied = result.applied.len(),
                    skipped = result.skipped.len(),
                    unused = result.unused.len(),
                    "applied pytorch state dict"
                );
                network
            }
            other => {
                return Err(Error::load(
                    weights,
                    format!("unsupported weights extension `{other}`, expected mpk, pth, or pt"),
                ));
            }
        };

        tracing::info!(
            encoder = %encoder,
            weights = %weights.display(),
            "loaded depth anything v2"
        );
        Ok(Self {
            network,
            device: device.clone(),
        })
    }

    /// Predicts relative depth for `image`, resized back to its own shape.
    pub fn infer(&self, image: &RgbImage, input_size: usize) -> Result<DepthMap> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let input = inference::prepare_input::<B>(
            image,
            input_size,
            self.network.patch_size(),
            &self.device,
        )?;

        let depth = self.network.forward(input).unsqueeze_dim::<4>(1);
        let depth = resize_bilinear(depth, [height, width]);
        let values = depth
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| Error::Inference(format!("failed to read depth tensor: {err:?}")))?;

        DepthMap::new(width, height, values)
    }

    pub fn encoder(&self) -> Encoder {
        self.network.encoder()
    }

    pub fn network(&self) -> &DepthAnythingV2<B> {
        &self.network
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}
