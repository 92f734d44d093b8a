//! Spatial self-attention
use crate::error::{Error, Result};
use crate::models::resnet::check_groups;
use tch::{nn, Kind, Tensor};

/// Configuration for an attention block.
#[derive(Debug, Clone, Copy)]
pub struct AttentionBlockConfig {
    /// Channels per head, a single head spanning all the channels when not set.
    pub num_head_channels: Option<i64>,
    pub num_groups: i64,
    pub eps: f64,
}

impl Default for AttentionBlockConfig {
    fn default() -> Self {
        Self { num_head_channels: None, num_groups: 32, eps: 1e-5 }
    }
}

/// Every spatial position attends to every other one, there is no masking.
#[derive(Debug)]
pub struct AttentionBlock {
    group_norm: nn::GroupNorm,
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    proj_attn: nn::Linear,
    channels: i64,
    num_heads: i64,
}

impl AttentionBlock {
    pub fn new(vs: nn::Path, channels: i64, config: AttentionBlockConfig) -> Result<Self> {
        let num_head_channels = config.num_head_channels.unwrap_or(channels);
        if num_head_channels <= 0 || channels % num_head_channels != 0 {
            return Err(Error::config(format!(
                "cannot split {channels} channels into heads of {num_head_channels}"
            )));
        }
        check_groups(channels, config.num_groups)?;
        let num_heads = channels / num_head_channels;
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let group_norm = nn::group_norm(&vs / "group_norm", config.num_groups, channels, group_cfg);
        let query = nn::linear(&vs / "query", channels, channels, Default::default());
        let key = nn::linear(&vs / "key", channels, channels, Default::default());
        let value = nn::linear(&vs / "value", channels, channels, Default::default());
        let proj_attn = nn::linear(&vs / "proj_attn", channels, channels, Default::default());
        Ok(Self { group_norm, query, key, value, proj_attn, channels, num_heads })
    }

    fn transpose_for_scores(&self, xs: Tensor) -> Tensor {
        let (batch, t, _h_times_d) = xs.size3().unwrap();
        xs.view((batch, t, self.num_heads, -1)).permute([0, 2, 1, 3])
    }

    /// Returns the attention probabilities `[batch, heads, seq, seq]` and the value states
    /// `[batch, heads, seq, head_dim]` for a `[batch, channels, height, width]` input.
    pub(crate) fn probs_and_values(&self, xs: &Tensor) -> (Tensor, Tensor) {
        let (batch, channel, height, width) = xs.size4().unwrap();
        let xs = xs.apply(&self.group_norm).view((batch, channel, height * width)).transpose(1, 2);

        let query_states = self.transpose_for_scores(xs.apply(&self.query));
        let key_states = self.transpose_for_scores(xs.apply(&self.key));
        let value_states = self.transpose_for_scores(xs.apply(&self.value));

        let scale = f64::powf((self.channels as f64) / (self.num_heads as f64), -0.25);
        let attention_scores =
            (query_states * scale).matmul(&(key_states.transpose(-1, -2) * scale));
        (attention_scores.softmax(-1, Kind::Float), value_states)
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let residual = xs;
        let (batch, channel, height, width) = xs.size4().unwrap();
        let (attention_probs, value_states) = self.probs_and_values(xs);

        let xs = attention_probs.matmul(&value_states);
        let xs = xs.permute([0, 2, 1, 3]).contiguous();
        xs.view((batch, height * width, self.channels))
            .apply(&self.proj_attn)
            .transpose(-1, -2)
            .contiguous()
            .view((batch, channel, height, width))
            + residual
    }
}
