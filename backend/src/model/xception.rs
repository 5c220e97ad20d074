//! Xception backbone with a single sigmoid unit on top.
//!
//! Tensor names follow the block layout: `block1_conv1.{conv,bn}`,
//! `block2.{residual,sepconv1,sepconv2}`, `block5`..`block12` with
//! `sepconv{1,2,3}`, `block13`, `block14_sepconv{1,2}` and `predictions`.
//! Separable convolutions hold `depthwise`, `pointwise` and `bn` tensors.

use candle_core::{Module, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};

const BN_EPS: f64 = 1e-3;
const MIDDLE_FLOW_BLOCKS: std::ops::RangeInclusive<usize> = 5..=12;

struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride,
            padding: 0,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?,
            bn: candle_nn::batch_norm(out_channels, BN_EPS, vb.pp("bn"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

struct SeparableConv {
    depthwise: Conv2d,
    pointwise: Conv2d,
    bn: BatchNorm,
}

impl SeparableConv {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let depthwise_cfg = Conv2dConfig {
            padding: 1,
            groups: in_channels,
            ..Default::default()
        };
        Ok(Self {
            depthwise: candle_nn::conv2d_no_bias(
                in_channels,
                in_channels,
                3,
                depthwise_cfg,
                vb.pp("depthwise"),
            )?,
            pointwise: candle_nn::conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("pointwise"),
            )?,
            bn: candle_nn::batch_norm(out_channels, BN_EPS, vb.pp("bn"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.depthwise)?
            .apply(&self.pointwise)?
            .apply_t(&self.bn, false)
    }
}

/// 3x3 stride-2 max pooling with TensorFlow "same" padding.
fn max_pool_same(xs: &Tensor) -> Result<Tensor> {
    let mut xs = xs.clone();
    for dim in [2, 3] {
        let size = xs.dim(dim)?;
        let out = size.div_ceil(2);
        let total = ((out - 1) * 2 + 3).saturating_sub(size);
        let before = total / 2;
        xs = xs.pad_with_same(dim, before, total - before)?;
    }
    xs.max_pool2d_with_stride((3, 3), (2, 2))
}

/// Two separable convolutions, a strided pool and a 1x1 strided shortcut.
struct DownBlock {
    residual: ConvBn,
    sepconv1: SeparableConv,
    sepconv2: SeparableConv,
    relu_first: bool,
}

impl DownBlock {
    fn new(
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        relu_first: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            residual: ConvBn::new(in_channels, out_channels, 1, 2, vb.pp("residual"))?,
            sepconv1: SeparableConv::new(in_channels, mid_channels, vb.pp("sepconv1"))?,
            sepconv2: SeparableConv::new(mid_channels, out_channels, vb.pp("sepconv2"))?,
            relu_first,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = self.residual.forward(xs)?;
        let h = if self.relu_first { xs.relu()? } else { xs.clone() };
        let h = self.sepconv1.forward(&h)?.relu()?;
        let h = self.sepconv2.forward(&h)?;
        max_pool_same(&h)? + residual
    }
}

struct MiddleBlock {
    sepconvs: Vec<SeparableConv>,
}

impl MiddleBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let sepconvs = (1..=3)
            .map(|i| SeparableConv::new(channels, channels, vb.pp(format!("sepconv{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sepconvs })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for sepconv in &self.sepconvs {
            h = sepconv.forward(&h.relu()?)?;
        }
        h + xs
    }
}

pub struct Xception {
    block1_conv1: ConvBn,
    block1_conv2: ConvBn,
    entry: Vec<DownBlock>,
    middle: Vec<MiddleBlock>,
    block13: DownBlock,
    block14_sepconv1: SeparableConv,
    block14_sepconv2: SeparableConv,
    predictions: Linear,
}

impl Xception {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let entry = vec![
            DownBlock::new(64, 128, 128, false, vb.pp("block2"))?,
            DownBlock::new(128, 256, 256, true, vb.pp("block3"))?,
            DownBlock::new(256, 728, 728, true, vb.pp("block4"))?,
        ];
        let middle = MIDDLE_FLOW_BLOCKS
            .map(|i| MiddleBlock::new(728, vb.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            block1_conv1: ConvBn::new(3, 32, 3, 2, vb.pp("block1_conv1"))?,
            block1_conv2: ConvBn::new(32, 64, 3, 1, vb.pp("block1_conv2"))?,
            entry,
            middle,
            block13: DownBlock::new(728, 728, 1024, true, vb.pp("block13"))?,
            block14_sepconv1: SeparableConv::new(1024, 1536, vb.pp("block14_sepconv1"))?,
            block14_sepconv2: SeparableConv::new(1536, 2048, vb.pp("block14_sepconv2"))?,
            predictions: candle_nn::linear(2048, 1, vb.pp("predictions"))?,
        })
    }
}

impl Module for Xception {
    /// `(batch, 3, h, w)` normalised pixels in, `(batch, 1)` probabilities out.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.block1_conv1.forward(xs)?.relu()?;
        h = self.block1_conv2.forward(&h)?.relu()?;
        for block in &self.entry {
            h = block.forward(&h)?;
        }
        for block in &self.middle {
            h = block.forward(&h)?;
        }
        h = self.block13.forward(&h)?;
        h = self.block14_sepconv1.forward(&h)?.relu()?;
        h = self.block14_sepconv2.forward(&h)?.relu()?;
        let pooled = h.mean((2, 3))?;
        candle_nn::ops::sigmoid(&pooled.apply(&self.predictions)?)
    }
}
