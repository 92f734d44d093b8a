use crate::error::{Error, Result};
use tch::{nn, Tensor};

/// Checks that a group-norm over `channels` can be split in `groups` groups.
pub(crate) fn check_groups(channels: i64, groups: i64) -> Result<()> {
    if groups <= 0 || channels % groups != 0 {
        return Err(Error::config(format!(
            "cannot split {channels} channels into {groups} normalization groups"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct ResnetBlock2DConfig {
    pub out_channels: Option<i64>,
    pub temb_channels: Option<i64>,
    pub groups: i64,
    pub eps: f64,
    pub use_in_shortcut: Option<bool>,
    // non_linearity: silu
    /// Dropout probability between the two convolutions, only active when training.
    pub dropout: f64,
}

impl Default for ResnetBlock2DConfig {
    fn default() -> Self {
        Self {
            out_channels: None,
            temb_channels: Some(256),
            groups: 32,
            eps: 1e-5,
            use_in_shortcut: None,
            dropout: 0.1,
        }
    }
}

/// A residual unit conditioned on the timestep embedding, the embedding gets projected
/// and added per channel after the first convolution.
#[derive(Debug)]
pub struct ResnetBlock2D {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    time_emb_proj: Option<nn::Linear>,
    conv_shortcut: Option<nn::Conv2D>,
    config: ResnetBlock2DConfig,
}

impl ResnetBlock2D {
    pub fn new(vs: nn::Path, in_channels: i64, config: ResnetBlock2DConfig) -> Result<Self> {
        let out_channels = config.out_channels.unwrap_or(in_channels);
        check_groups(in_channels, config.groups)?;
        check_groups(out_channels, config.groups)?;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", config.groups, in_channels, group_cfg);
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::group_norm(&vs / "norm2", config.groups, out_channels, group_cfg);
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let use_in_shortcut = config.use_in_shortcut.unwrap_or(in_channels != out_channels);
        let conv_shortcut = if use_in_shortcut {
            let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
            Some(nn::conv2d(&vs / "conv_shortcut", in_channels, out_channels, 1, conv_cfg))
        } else {
            None
        };
        let time_emb_proj = config.temb_channels.map(|temb_channels| {
            nn::linear(&vs / "time_emb_proj", temb_channels, out_channels, Default::default())
        });
        Ok(Self { norm1, conv1, norm2, conv2, time_emb_proj, conv_shortcut, config })
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>, train: bool) -> Tensor {
        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => xs.apply(conv_shortcut),
            None => xs.shallow_clone(),
        };
        let xs = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let xs = match (temb, &self.time_emb_proj) {
            (Some(temb), Some(time_emb_proj)) => {
                temb.silu().apply(time_emb_proj).unsqueeze(-1).unsqueeze(-1) + xs
            }
            _ => xs,
        };
        let xs =
            xs.apply(&self.norm2).silu().dropout(self.config.dropout, train).apply(&self.conv2);
        shortcut_xs + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn shapes_and_shortcut() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResnetBlock2DConfig {
            out_channels: Some(16),
            temb_channels: Some(32),
            groups: 4,
            ..Default::default()
        };
        let block = ResnetBlock2D::new(vs.root(), 8, cfg)?;
        assert!(block.conv_shortcut.is_some());
        let xs = Tensor::randn([2, 8, 6, 6], (Kind::Float, Device::Cpu));
        let temb = Tensor::randn([2, 32], (Kind::Float, Device::Cpu));
        let ys = block.forward(&xs, Some(&temb), false);
        assert_eq!(ys.size(), [2, 16, 6, 6]);
        // No dropout at inference.
        assert!(ys.equal(&block.forward(&xs, Some(&temb), false)));
        Ok(())
    }

    #[test]
    fn time_conditioning_changes_output() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResnetBlock2DConfig { temb_channels: Some(8), groups: 2, ..Default::default() };
        let block = ResnetBlock2D::new(vs.root(), 4, cfg)?;
        let xs = Tensor::randn([1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let t1 = Tensor::randn([1, 8], (Kind::Float, Device::Cpu));
        let t2 = &t1 + 1.;
        let ys1 = block.forward(&xs, Some(&t1), false);
        let ys2 = block.forward(&xs, Some(&t2), false);
        assert!(!ys1.allclose(&ys2, 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn invalid_groups() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = ResnetBlock2DConfig { groups: 32, ..Default::default() };
        let block = ResnetBlock2D::new(vs.root(), 48, cfg);
        assert!(matches!(block, Err(Error::Configuration(_))));
    }
}
