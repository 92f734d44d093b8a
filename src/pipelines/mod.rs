//! # Pipelines

pub mod ood;

use crate::models::unet_2d;
use crate::schedulers::ddpm;
use crate::utils::{load_checkpoint, ExecutionContext};
use std::path::Path;
use tch::nn;

/// Builds the noise prediction UNet, loading its weights when a checkpoint is given. The
/// weights are frozen either way.
pub fn build_unet<P: AsRef<Path>>(
    config: unet_2d::UNet2DModelConfig,
    unet_weights: Option<P>,
    ctx: &ExecutionContext,
) -> anyhow::Result<unet_2d::UNet2DModel> {
    let mut vs_unet = nn::VarStore::new(ctx.device("unet"));
    let unet = unet_2d::UNet2DModel::new(vs_unet.root(), config)?;
    match unet_weights {
        Some(unet_weights) => load_checkpoint(&mut vs_unet, unet_weights)?,
        None => tracing::warn!("no unet checkpoint, using randomly initialized weights"),
    }
    vs_unet.freeze();
    Ok(unet)
}

/// Wraps a UNet in the diffusion process used for reconstruction and sampling.
pub fn build_process(
    unet: unet_2d::UNet2DModel,
    config: ddpm::DDPMConfig,
    ctx: &ExecutionContext,
) -> anyhow::Result<ddpm::DDPMProcess<unet_2d::UNet2DModel>> {
    Ok(ddpm::DDPMProcess::new(unet, config, ctx.device("unet"))?)
}
