use super::interpolate::{resize_bilinear, upsample2x};
use crate::model::Encoder;
use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

/// Channels of the intermediate projection in front of the final 1x1 conv.
const HEAD_HIDDEN_CHANNELS: usize = 32;

#[derive(Config, Debug)]
pub struct DptHeadConfig {
    pub dim_in: usize,
    pub features: usize,
    pub out_channels: [usize; 4],
    #[config(default = "14")]
    pub patch_size: usize,
}

impl DptHeadConfig {
    pub fn from_encoder(encoder: Encoder) -> Self {
        Self::new(
            encoder.embed_dim(),
            encoder.features(),
            encoder.out_channels(),
        )
    }
}

/// Dense prediction head: reassembles four hooked token grids into a
/// single-channel map at patch-grid resolution times the patch size.
#[derive(Module, Debug)]
pub struct DptHead<B: Backend> {
    projects: Vec<Conv2d<B>>,
    resize_layers: Vec<ResizeOp<B>>,
    scratch: Scratch<B>,
    dim_in: Ignored<usize>,
    patch_size: Ignored<usize>,
}

impl<B: Backend> DptHead<B> {
    pub fn new(device: &B::Device, config: DptHeadConfig) -> Self {
        let projects = config
            .out_channels
            .iter()
            .map(|&channels| {
                Conv2dConfig::new([config.dim_in, channels], [1, 1])
                    .with_bias(true)
                    .init(device)
            })
            .collect();

        let [c0, c1, _, c3] = config.out_channels;
        let resize_layers = vec![
            ResizeOp::conv_transpose(
                ConvTranspose2dConfig::new([c0, c0], [4, 4])
                    .with_stride([4, 4])
                    .with_bias(true)
                    .init(device),
            ),
            ResizeOp::conv_transpose(
                ConvTranspose2dConfig::new([c1, c1], [2, 2])
                    .with_stride([2, 2])
                    .with_bias(true)
                    .init(device),
            ),
            ResizeOp::identity(),
            ResizeOp::conv(
                Conv2dConfig::new([c3, c3], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_stride([2, 2])
                    .with_bias(true)
                    .init(device),
            ),
        ];

        Self {
            projects,
            resize_layers,
            scratch: Scratch::new(device, &config.out_channels, config.features),
            dim_in: Ignored(config.dim_in),
            patch_size: Ignored(config.patch_size),
        }
    }

    /// `hooks` are `[batch, ph * pw, dim_in]` patch tokens, shallowest first.
    pub fn forward(&self, hooks: &[Tensor<B, 3>], ph: usize, pw: usize) -> Tensor<B, 4> {
        assert!(
            hooks.len() >= 4,
            "DptHead expects 4 hook tensors, got {}",
            hooks.len()
        );

        let mut stages = Vec::with_capacity(4);
        for (stage, tokens) in hooks.iter().take(4).enumerate() {
            stages.push(self.reassemble(tokens.clone(), stage, ph, pw));
        }

        let fused = self.fuse(stages);
        let out = self.scratch.output_conv1.forward(fused);
        let out = resize_bilinear(out, [ph * self.patch_size.0, pw * self.patch_size.0]);
        relu(self.scratch.output_conv2.forward(out))
    }

    fn reassemble(&self, tokens: Tensor<B, 3>, stage: usize, ph: usize, pw: usize) -> Tensor<B, 4> {
        let [batch, token_count, channels] = tokens.shape().dims::<3>();
        assert_eq!(
            token_count,
            ph * pw,
            "hook {stage} carries {token_count} tokens for a {ph}x{pw} patch grid"
        );
        debug_assert_eq!(channels, self.dim_in.0);

        let grid = tokens
            .permute([0, 2, 1])
            .reshape([batch as i32, channels as i32, ph as i32, pw as i32]);
        let projected = self.projects[stage].forward(grid);
        self.resize_layers[stage].forward(projected)
    }

    fn fuse(&self, stages: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let [l1, l2, l3, l4]: [Tensor<B, 4>; 4] = match stages.try_into() {
            Ok(layers) => layers,
            Err(_) => unreachable!("reassemble yields exactly four stages"),
        };

        let l1 = self.scratch.layer1_rn.forward(l1);
        let l2 = self.scratch.layer2_rn.forward(l2);
        let l3 = self.scratch.layer3_rn.forward(l3);
        let l4 = self.scratch.layer4_rn.forward(l4);

        let path4 = self.scratch.refinenet4.forward(l4, None, Some(hw(&l3)));
        let path3 = self
            .scratch
            .refinenet3
            .forward(path4, Some(l3), Some(hw(&l2)));
        let path2 = self
            .scratch
            .refinenet2
            .forward(path3, Some(l2), Some(hw(&l1)));
        self.scratch.refinenet1.forward(path2, Some(l1), None)
    }
}

fn hw<B: Backend>(tensor: &Tensor<B, 4>) -> [usize; 2] {
    let [_, _, height, width] = tensor.shape().dims::<4>();
    [height, width]
}

#[derive(Module, Debug)]
struct ResizeOp<B: Backend> {
    conv_t: Option<ConvTranspose2d<B>>,
    conv: Option<Conv2d<B>>,
}

impl<B: Backend> ResizeOp<B> {
    fn identity() -> Self {
        Self {
            conv_t: None,
            conv: None,
        }
    }

    fn conv_transpose(layer: ConvTranspose2d<B>) -> Self {
        Self {
            conv_t: Some(layer),
            conv: None,
        }
    }

    fn conv(layer: Conv2d<B>) -> Self {
        Self {
            conv_t: None,
            conv: Some(layer),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.conv_t, &self.conv) {
            (Some(layer), _) => layer.forward(x),
            (None, Some(layer)) => layer.forward(x),
            (None, None) => x,
        }
    }
}

#[derive(Module, Debug)]
struct Scratch<B: Backend> {
    layer1_rn: Conv2d<B>,
    layer2_rn: Conv2d<B>,
    layer3_rn: Conv2d<B>,
    layer4_rn: Conv2d<B>,
    refinenet1: FeatureFusionBlock<B>,
    refinenet2: FeatureFusionBlock<B>,
    refinenet3: FeatureFusionBlock<B>,
    refinenet4: FeatureFusionBlock<B>,
    output_conv1: Conv2d<B>,
    output_conv2: ConvStack<B>,
}

impl<B: Backend> Scratch<B> {
    fn new(device: &B::Device, in_channels: &[usize; 4], features: usize) -> Self {
        Self {
            layer1_rn: conv3x3(device, in_channels[0], features),
            layer2_rn: conv3x3(device, in_channels[1], features),
            layer3_rn: conv3x3(device, in_channels[2], features),
            layer4_rn: conv3x3(device, in_channels[3], features),
            refinenet1: FeatureFusionBlock::new(device, features),
            refinenet2: FeatureFusionBlock::new(device, features),
            refinenet3: FeatureFusionBlock::new(device, features),
            refinenet4: FeatureFusionBlock::new(device, features),
            output_conv1: Conv2dConfig::new([features, features / 2], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device),
            output_conv2: ConvStack::new(device, features / 2, HEAD_HIDDEN_CHANNELS, 1),
        }
    }
}

// refinenet4 never sees a lateral input, but published checkpoints still
// carry its first residual unit, so every block owns one.
#[derive(Module, Debug)]
struct FeatureFusionBlock<B: Backend> {
    residual1: ResidualConvUnit<B>,
    residual2: ResidualConvUnit<B>,
    out_conv: Conv2d<B>,
}

impl<B: Backend> FeatureFusionBlock<B> {
    fn new(device: &B::Device, channels: usize) -> Self {
        Self {
            residual1: ResidualConvUnit::new(device, channels),
            residual2: ResidualConvUnit::new(device, channels),
            out_conv: Conv2dConfig::new([channels, channels], [1, 1])
                .with_bias(true)
                .init(device),
        }
    }

    fn forward(
        &self,
        top: Tensor<B, 4>,
        lateral: Option<Tensor<B, 4>>,
        size: Option<[usize; 2]>,
    ) -> Tensor<B, 4> {
        let mut y = top;
        if let Some(lateral) = lateral {
            y = y + self.residual1.forward(lateral);
        }

        y = self.residual2.forward(y);
        y = match size {
            Some(size) => resize_bilinear(y, size),
            None => upsample2x(y),
        };
        self.out_conv.forward(y)
    }
}

#[derive(Module, Debug)]
struct ResidualConvUnit<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> ResidualConvUnit<B> {
    fn new(device: &B::Device, channels: usize) -> Self {
        let conv = || {
            Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device)
        };

        Self {
            conv1: conv(),
            conv2: conv(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(relu(input.clone()));
        let x = self.conv2.forward(relu(x));
        x + input
    }
}

#[derive(Module, Debug)]
struct ConvStack<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> ConvStack<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
    ) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, mid_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(true)
            .init(device);
        let conv2 = Conv2dConfig::new([mid_channels, out_channels], [1, 1])
            .with_bias(true)
            .init(device);
        Self { conv1, conv2 }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(input));
        self.conv2.forward(x)
    }
}

fn conv3x3<B: Backend>(device: &B::Device, in_channels: usize, out_channels: usize) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}
