//! 2D UNet Noise Prediction Model
//!
//! The UNet takes as input a noisy sample and the current diffusion timestep and
//! returns an estimate of the noise that was added to the sample.
use crate::error::{Error, Result};
use crate::models::embeddings::TimestepEmbedding;
use crate::models::resnet::check_groups;
use crate::models::unet_2d_blocks::*;
use crate::schedulers::ddpm::NoisePredictor;
use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    /// Channel multiplier applied when entering this resolution, the multipliers are
    /// cumulative from one resolution to the next.
    pub channel_mult: i64,
    pub use_attn: bool,
}

#[derive(Debug, Clone)]
pub struct UNet2DModelConfig {
    pub image_channels: i64,
    pub base_channels: i64,
    /// One entry per resolution, from the highest resolution to the lowest one.
    pub blocks: Vec<BlockConfig>,
    /// Residual units per encoder resolution, the decoder uses one more.
    pub layers_per_block: i64,
    pub norm_num_groups: i64,
    pub out_norm_num_groups: i64,
    pub norm_eps: f64,
    pub attention_head_channels: Option<i64>,
    pub dropout: f64,
}

impl Default for UNet2DModelConfig {
    fn default() -> Self {
        let bc = |channel_mult, use_attn| BlockConfig { channel_mult, use_attn };
        Self {
            image_channels: 1,
            base_channels: 64,
            blocks: vec![bc(1, false), bc(2, false), bc(2, true), bc(4, true)],
            layers_per_block: 2,
            norm_num_groups: 32,
            out_norm_num_groups: 8,
            norm_eps: 1e-5,
            attention_head_channels: None,
            dropout: 0.1,
        }
    }
}

impl UNet2DModelConfig {
    pub fn time_embed_dim(&self) -> i64 {
        self.base_channels * 4
    }

    /// The stage layout of the encoder, the bottleneck and the decoder.
    pub fn stage_plans(&self) -> Result<(Vec<StagePlan>, Vec<StagePlan>, Vec<StagePlan>)> {
        if self.blocks.is_empty() {
            return Err(Error::config("a UNet needs at least one resolution"));
        }
        if self.layers_per_block < 1 {
            return Err(Error::config("a UNet needs at least one residual unit per resolution"));
        }
        if let Some(b) = self.blocks.iter().find(|b| b.channel_mult < 1) {
            return Err(Error::config(format!("invalid channel multiplier {}", b.channel_mult)));
        }
        let n_blocks = self.blocks.len();
        let mut down = vec![];
        let mut channels = self.base_channels;
        for (i, block) in self.blocks.iter().enumerate() {
            let out_channels = channels * block.channel_mult;
            for _ in 0..self.layers_per_block {
                down.push(StagePlan::Residual {
                    in_channels: channels,
                    out_channels,
                    attention: block.use_attn,
                });
                channels = out_channels;
            }
            if i < n_blocks - 1 {
                down.push(StagePlan::Downsample { channels })
            }
        }

        let mid = vec![
            StagePlan::Residual { in_channels: channels, out_channels: channels, attention: true },
            StagePlan::Residual { in_channels: channels, out_channels: channels, attention: false },
        ];

        let mut up = vec![];
        for (i, block) in self.blocks.iter().enumerate().rev() {
            for _ in 0..self.layers_per_block {
                up.push(StagePlan::Residual {
                    in_channels: 2 * channels,
                    out_channels: channels,
                    attention: block.use_attn,
                });
            }
            let out_channels = channels / block.channel_mult;
            up.push(StagePlan::Residual {
                in_channels: channels + out_channels,
                out_channels,
                attention: block.use_attn,
            });
            channels = out_channels;
            if i > 0 {
                up.push(StagePlan::Upsample { channels })
            }
        }
        Ok((down, mid, up))
    }
}

#[derive(Debug)]
pub struct UNet2DModel {
    conv_in: nn::Conv2D,
    time_embedding: TimestepEmbedding,
    down_stages: Vec<Stage>,
    mid_stages: Vec<Stage>,
    up_stages: Vec<Stage>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    n_skips: usize,
    config: UNet2DModelConfig,
}

impl UNet2DModel {
    pub fn new(vs: nn::Path, config: UNet2DModelConfig) -> Result<Self> {
        let b_channels = config.base_channels;
        let time_embed_dim = config.time_embed_dim();
        let (down, mid, up) = config.stage_plans()?;
        let n_skips = validate_stages(b_channels, &down, &mid, &up)?;
        check_groups(b_channels, config.out_norm_num_groups)?;

        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", config.image_channels, b_channels, 3, conv_cfg);
        let time_embedding = TimestepEmbedding::new(&vs / "time_embedding", time_embed_dim)?;

        let stage_cfg = StageConfig {
            temb_channels: time_embed_dim,
            groups: config.norm_num_groups,
            eps: config.norm_eps,
            attn_num_head_channels: config.attention_head_channels,
            dropout: config.dropout,
        };
        let build = |vs: nn::Path, plans: &[StagePlan]| -> Result<Vec<Stage>> {
            plans.iter().enumerate().map(|(i, &plan)| Stage::new(&vs / i, plan, stage_cfg)).collect()
        };
        let down_stages = build(&vs / "down_blocks", &down)?;
        let mid_stages = build(&vs / "mid_block", &mid)?;
        let up_stages = build(&vs / "up_blocks", &up)?;

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.out_norm_num_groups, b_channels, group_cfg);
        let conv_out =
            nn::conv2d(&vs / "conv_out", b_channels, config.image_channels, 3, conv_cfg);
        Ok(Self {
            conv_in,
            time_embedding,
            down_stages,
            mid_stages,
            up_stages,
            conv_norm_out,
            conv_out,
            n_skips,
            config,
        })
    }

    pub fn config(&self) -> &UNet2DModelConfig {
        &self.config
    }

    /// Predicts the noise in `xs`, `timesteps` holds either a single value for the whole
    /// batch or one value per sample. `train` enables dropout.
    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor, train: bool) -> Result<Tensor> {
        let (bsize, channels, height, width) = xs.size4()?;
        if channels != self.config.image_channels {
            return Err(Error::Shape(format!(
                "expected {} input channels, got {channels}",
                self.config.image_channels
            )));
        }
        let factor = 1 << (self.config.blocks.len() - 1);
        if height % factor != 0 || width % factor != 0 {
            return Err(Error::Shape(format!(
                "the input resolution {height}x{width} is not divisible by {factor}"
            )));
        }
        let timesteps = match timesteps.size().as_slice() {
            [] | [1] => timesteps.reshape([1]).expand([bsize], false),
            [n] if *n == bsize => timesteps.shallow_clone(),
            size => {
                return Err(Error::Shape(format!(
                    "expected {bsize} timesteps, got a tensor of shape {size:?}"
                )))
            }
        };
        // 1. time
        let emb = timesteps.to_device(xs.device()).apply(&self.time_embedding);
        // 2. pre-process
        let xs = xs.apply(&self.conv_in);
        // 3. down
        let mut skips = SkipStack::new(self.n_skips);
        skips.push(xs.shallow_clone())?;
        let mut xs = xs;
        for stage in self.down_stages.iter() {
            xs = stage.forward(&xs, &emb, train);
            skips.push(xs.shallow_clone())?;
        }
        // 4. mid
        for stage in self.mid_stages.iter() {
            xs = stage.forward(&xs, &emb, train);
        }
        // 5. up
        for stage in self.up_stages.iter() {
            xs = if stage.takes_skip() {
                let skip = skips.pop()?;
                stage.forward(&Tensor::cat(&[&xs, &skip], 1), &emb, train)
            } else {
                stage.forward(&xs, &emb, train)
            };
        }
        // 6. post-process
        Ok(xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out))
    }
}

impl NoisePredictor for UNet2DModel {
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| self.forward(xs, timesteps, false))
    }
}
