//! 2D UNet Building Blocks
//!
use crate::error::{Error, Result};
use crate::models::attention::{AttentionBlock, AttentionBlockConfig};
use crate::models::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use tch::{nn, nn::Module, Tensor};

/// Halves the spatial resolution with a strided convolution.
#[derive(Debug)]
pub struct Downsample2D {
    conv: nn::Conv2D,
}

impl Downsample2D {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        let config = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", channels, channels, 3, config);
        Self { conv }
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

/// Doubles the spatial resolution with a strided transposed convolution.
#[derive(Debug)]
pub struct Upsample2D {
    conv: nn::ConvTranspose2D,
}

impl Upsample2D {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        let config = nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv_transpose2d(&vs / "conv", channels, channels, 4, config);
        Self { conv }
    }
}

impl Module for Upsample2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

/// The channel layout of a single UNet stage, before any weight gets allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePlan {
    Residual { in_channels: i64, out_channels: i64, attention: bool },
    Downsample { channels: i64 },
    Upsample { channels: i64 },
}

impl StagePlan {
    fn in_channels(&self) -> i64 {
        match *self {
            Self::Residual { in_channels, .. } => in_channels,
            Self::Downsample { channels } | Self::Upsample { channels } => channels,
        }
    }

    fn out_channels(&self) -> i64 {
        match *self {
            Self::Residual { out_channels, .. } => out_channels,
            Self::Downsample { channels } | Self::Upsample { channels } => channels,
        }
    }
}

/// A last-in first-out list of encoder outputs with a fixed capacity. The decoder pops
/// one entry for each of its residual stages.
#[derive(Debug)]
pub struct SkipStack<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> SkipStack<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() == self.capacity {
            return Err(Error::Shape(format!("skip stack overflow, capacity {}", self.capacity)));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<T> {
        self.items.pop().ok_or_else(|| Error::Shape("skip stack underflow".to_string()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Checks that a stage layout is consistent: each stage takes the channels produced by
/// the previous one, every decoder residual stage takes the concatenation of the previous
/// output and of a skip popped from the encoder, and all the pushed skips get popped.
///
/// Returns the number of skip connections.
pub fn validate_stages(
    stem_channels: i64,
    down: &[StagePlan],
    mid: &[StagePlan],
    up: &[StagePlan],
) -> Result<usize> {
    let mut skips = SkipStack::new(down.len() + 1);
    skips.push(stem_channels)?;
    let mut channels = stem_channels;
    let check_input = |stage: &StagePlan, expected: i64| {
        if stage.in_channels() != expected {
            return Err(Error::config(format!(
                "stage {stage:?} expects {} input channels, got {expected}",
                stage.in_channels()
            )));
        }
        Ok(())
    };
    for stage in down.iter() {
        check_input(stage, channels)?;
        channels = stage.out_channels();
        skips.push(channels)?;
    }
    let n_skips = skips.len();
    for stage in mid.iter() {
        check_input(stage, channels)?;
        channels = stage.out_channels();
    }
    for stage in up.iter() {
        let expected = match stage {
            StagePlan::Residual { .. } => {
                let skip = skips.pop().map_err(|_| {
                    Error::config(format!(
                        "the decoder consumes more than the {n_skips} skip connections produced by the encoder"
                    ))
                })?;
                channels + skip
            }
            StagePlan::Downsample { .. } | StagePlan::Upsample { .. } => channels,
        };
        check_input(stage, expected)?;
        channels = stage.out_channels();
    }
    if !skips.is_empty() {
        return Err(Error::config(format!(
            "{} of the {n_skips} skip connections are never consumed by the decoder",
            skips.len()
        )));
    }
    if channels != stem_channels {
        return Err(Error::config(format!(
            "the decoder ends with {channels} channels, expected {stem_channels}"
        )));
    }
    Ok(n_skips)
}

#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub temb_channels: i64,
    pub groups: i64,
    pub eps: f64,
    pub attn_num_head_channels: Option<i64>,
    pub dropout: f64,
}

/// A UNet stage, all the kinds share the same calling convention.
#[derive(Debug)]
pub enum Stage {
    Residual(ResnetBlock2D),
    ResidualAttention(ResnetBlock2D, AttentionBlock),
    Downsample(Downsample2D),
    Upsample(Upsample2D),
}

impl Stage {
    pub fn new(vs: nn::Path, plan: StagePlan, config: StageConfig) -> Result<Self> {
        let stage = match plan {
            StagePlan::Residual { in_channels, out_channels, attention } => {
                let resnet_cfg = ResnetBlock2DConfig {
                    out_channels: Some(out_channels),
                    temb_channels: Some(config.temb_channels),
                    groups: config.groups,
                    eps: config.eps,
                    dropout: config.dropout,
                    ..Default::default()
                };
                let resnet = ResnetBlock2D::new(&vs / "res", in_channels, resnet_cfg)?;
                if attention {
                    let attn_cfg = AttentionBlockConfig {
                        num_head_channels: config.attn_num_head_channels,
                        num_groups: config.groups,
                        eps: config.eps,
                    };
                    let attn = AttentionBlock::new(&vs / "attn", out_channels, attn_cfg)?;
                    Self::ResidualAttention(resnet, attn)
                } else {
                    Self::Residual(resnet)
                }
            }
            StagePlan::Downsample { channels } => {
                Self::Downsample(Downsample2D::new(&vs / "downsample", channels))
            }
            StagePlan::Upsample { channels } => {
                Self::Upsample(Upsample2D::new(&vs / "upsample", channels))
            }
        };
        Ok(stage)
    }

    /// Whether the decoder has to concatenate a skip connection before this stage.
    pub fn takes_skip(&self) -> bool {
        matches!(self, Self::Residual(_) | Self::ResidualAttention(..))
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor, train: bool) -> Tensor {
        match self {
            Self::Residual(resnet) => resnet.forward(xs, Some(temb), train),
            Self::ResidualAttention(resnet, attn) => {
                attn.forward(&resnet.forward(xs, Some(temb), train))
            }
            Self::Downsample(downsample) => xs.apply(downsample),
            Self::Upsample(upsample) => xs.apply(upsample),
        }
    }
}
