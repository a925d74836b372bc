use burn::{
    module::{Ignored, Module},
    prelude::*,
    tensor::activation::relu,
};
use burn_dino::model::dino::{DinoVisionTransformer, DinoVisionTransformerConfig};
use burn_store::KeyRemapper;

use crate::{Error, model::Encoder};

mod dpt;
mod interpolate;

pub use dpt::{DptHead, DptHeadConfig};
pub use interpolate::resize_bilinear;

mod stack_guard {
    #[cfg(not(target_arch = "wasm32"))]
    use stacker::maybe_grow;

    #[cfg(not(target_arch = "wasm32"))]
    pub fn with_model_load_stack<R>(f: impl FnOnce() -> R) -> R {
        // Record loading recurses once per module level; the vitg tree overflows
        // the 1MB default stack of Windows threads.
        const STACK_SIZE: usize = 32 * 1024 * 1024;
        const RED_ZONE: usize = 2 * 1024 * 1024;
        maybe_grow(STACK_SIZE, RED_ZONE, f)
    }

    #[cfg(target_arch = "wasm32")]
    pub fn with_model_load_stack<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}

pub use stack_guard::with_model_load_stack;

#[derive(Config, Debug)]
pub struct DepthAnythingV2Config {
    pub encoder: Encoder,
    pub head: DptHeadConfig,
    pub hook_block_ids: Vec<usize>,
    #[config(default = "518")]
    pub image_size: usize,
    #[config(default = "14")]
    pub patch_size: usize,
}

impl DepthAnythingV2Config {
    pub fn from_encoder(encoder: Encoder) -> Self {
        Self::new(
            encoder,
            DptHeadConfig::from_encoder(encoder),
            encoder.hooked_blocks().to_vec(),
        )
    }

    fn backbone(&self) -> DinoVisionTransformerConfig {
        let image_size = Some(self.image_size);
        let patch_size = Some(self.patch_size);
        let mut vit = match self.encoder {
            Encoder::Vits => DinoVisionTransformerConfig::vits(image_size, patch_size),
            Encoder::Vitb => DinoVisionTransformerConfig::vitb(image_size, patch_size),
            Encoder::Vitl => DinoVisionTransformerConfig::vitl(image_size, patch_size),
            Encoder::Vitg => DinoVisionTransformerConfig::vitg(image_size, patch_size),
        }
        .without_register_tokens();
        vit.block_config.attn.quiet_softmax = false;
        vit
    }
}

/// Depth Anything V2: DINOv2 backbone feeding a DPT head.
///
/// Field names follow the published state dict (`pretrained.*`, `depth_head.*`)
/// so PyTorch checkpoints apply with only the renames in [`pytorch_key_remapper`].
#[derive(Module, Debug)]
pub struct DepthAnythingV2<B: Backend> {
    pretrained: DinoVisionTransformer<B>,
    depth_head: DptHead<B>,
    encoder: Ignored<Encoder>,
    patch_size: Ignored<usize>,
    hook_block_ids: Ignored<Vec<usize>>,
}

impl<B: Backend> DepthAnythingV2<B> {
    pub fn new(device: &B::Device, config: DepthAnythingV2Config) -> Self {
        let head = DptHeadConfig {
            patch_size: config.patch_size,
            ..config.head.clone()
        };
        Self {
            pretrained: config.backbone().init(device),
            depth_head: DptHead::new(device, head),
            encoder: Ignored(config.encoder),
            patch_size: Ignored(config.patch_size),
            hook_block_ids: Ignored(config.hook_block_ids),
        }
    }

    /// Relative inverse depth for an `NCHW` batch whose sides are multiples
    /// of the patch size. Returns `[batch, height, width]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 3> {
        let [_, _, height, width] = input.shape().dims::<4>();
        let patch_size = self.patch_size.0;
        assert_eq!(
            height % patch_size,
            0,
            "Input height {height} must be divisible by patch size {patch_size}"
        );
        assert_eq!(
            width % patch_size,
            0,
            "Input width {width} must be divisible by patch size {patch_size}"
        );

        let (_, hooks) = self
            .pretrained
            .forward_with_intermediate_tokens(input, &self.hook_block_ids.0);
        let depth = self
            .depth_head
            .forward(&hooks, height / patch_size, width / patch_size);
        relu(depth).squeeze_dim::<3>(1)
    }

    pub fn encoder(&self) -> Encoder {
        self.encoder.0
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size.0
    }
}

/// Renames published PyTorch state dict keys onto this module tree.
pub fn pytorch_key_remapper() -> Result<KeyRemapper, Error> {
    const RULES: &[(&str, &str)] = &[
        (r"^(pretrained\..*\.norm\d*)\.weight$", "$1.gamma"),
        (r"^(pretrained\..*\.norm\d*)\.bias$", "$1.beta"),
        (r"^(pretrained\.norm)\.weight$", "$1.gamma"),
        (r"^(pretrained\.norm)\.bias$", "$1.beta"),
        (
            r"^(depth_head\.resize_layers\.(0|1))\.(weight|bias)$",
            "$1.conv_t.$3",
        ),
        (
            r"^(depth_head\.resize_layers\.3)\.(weight|bias)$",
            "$1.conv.$2",
        ),
        (
            r"^(depth_head\.scratch\.output_conv2)\.0\.(weight|bias)$",
            "$1.conv1.$2",
        ),
        (
            r"^(depth_head\.scratch\.output_conv2)\.2\.(weight|bias)$",
            "$1.conv2.$2",
        ),
        (
            r"^(depth_head\.scratch\.refinenet\d+)\.resConfUnit1\.",
            "$1.residual1.",
        ),
        (
            r"^(depth_head\.scratch\.refinenet\d+)\.resConfUnit2\.",
            "$1.residual2.",
        ),
    ];

    RULES
        .iter()
        .try_fold(KeyRemapper::new(), |remapper, (from, to)| {
            remapper
                .add_pattern(*from, *to)
                .map_err(|err| Error::config(format!("invalid key pattern `{from}`: {err}")))
        })
}
