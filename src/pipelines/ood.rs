//! Reconstruction based out-of-distribution scoring.
//!
//! Each image is noised to a few timesteps and reconstructed by the reverse process, the
//! reconstruction is compared to the original both in pixel space and in the feature
//! space of a frozen perceptual network. Out-of-distribution images are expected to get
//! reconstructed worse than in-distribution ones.
use crate::error::{Error, Result};
use crate::schedulers::ddpm::{DDPMProcess, NoisePredictor};
use crate::utils::ExecutionContext;
use std::sync::atomic::{AtomicBool, Ordering};
use tch::{Kind, Tensor};

/// Input resolution of the perceptual network.
pub const PERCEPTUAL_SIZE: i64 = 224;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A frozen network mapping a batch of preprocessed images `[batch, 3, 224, 224]` to one
/// feature vector per image.
pub trait PerceptualEncoder {
    fn features(&self, xs: &Tensor) -> Result<Tensor>;
}

/// Turns images with values in [-1, 1] into the perceptual network input: values in
/// [0, 1], grayscale replicated over three channels, resized to 224x224 and normalized
/// with the ImageNet statistics.
pub fn perceptual_preprocess(xs: &Tensor) -> Result<Tensor> {
    let (_bsize, channels, _height, _width) = xs.size4()?;
    let xs = ((xs + 1.) / 2.).clamp(0., 1.);
    let xs = match channels {
        1 => xs.repeat([1, 3, 1, 1]),
        3 => xs,
        _ => {
            let msg = format!("cannot build an rgb image from {channels} channels");
            return Err(Error::Shape(msg));
        }
    };
    let xs = xs.upsample_bilinear2d([PERCEPTUAL_SIZE, PERCEPTUAL_SIZE], false, None, None);
    let (kind, device) = (xs.kind(), xs.device());
    let stats = |v: &[f32; 3]| Tensor::from_slice(v).view([1, 3, 1, 1]).to_kind(kind).to(device);
    Ok((xs - stats(&IMAGENET_MEAN)) / stats(&IMAGENET_STD))
}

/// The reconstruction errors of one image at one timestep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructionScore {
    pub timestep: usize,
    /// Mean squared error between the image and its reconstruction.
    pub pixel_error: f64,
    /// Euclidean distance between the perceptual features of both images.
    pub perceptual_error: f64,
    pub combined: f64,
}

#[derive(Debug, Clone)]
pub struct OodScorerConfig {
    /// The timesteps each image gets noised to.
    pub timesteps: Vec<usize>,
    /// Weight of the perceptual error in the combined score.
    pub perceptual_weight: f64,
}

impl Default for OodScorerConfig {
    fn default() -> Self {
        Self { timesteps: vec![100, 200, 300, 400, 500], perceptual_weight: 1. }
    }
}

pub struct OodScorer<'a, P, E> {
    process: &'a DDPMProcess<P>,
    encoder: &'a E,
    ctx: ExecutionContext,
    pub config: OodScorerConfig,
}

fn row_norms(xs: &Tensor) -> Vec<f64> {
    let bsize = xs.size().first().copied().unwrap_or(0);
    (0..bsize).map(|i| xs.get(i).square().sum(Kind::Double).sqrt().double_value(&[])).collect()
}

impl<'a, P: NoisePredictor, E: PerceptualEncoder> OodScorer<'a, P, E> {
    pub fn new(
        process: &'a DDPMProcess<P>,
        encoder: &'a E,
        ctx: ExecutionContext,
        config: OodScorerConfig,
    ) -> Self {
        Self { process, encoder, ctx, config }
    }

    /// Runs the encoder on the perceptual device, the features come back on the device
    /// of `xs`.
    fn features(&self, xs: &Tensor) -> Result<Tensor> {
        let input = perceptual_preprocess(xs)?.to_device(self.ctx.device("perceptual"));
        let features = self.encoder.features(&input)?;
        Ok(features.flatten(1, -1).to_device(xs.device()))
    }

    /// Scores a batch of images, returning one list of scores per image with one entry
    /// per configured timestep.
    pub fn score(&self, xs: &Tensor) -> Result<Vec<Vec<ReconstructionScore>>> {
        let (bsize, _, _, _) = xs.size4()?;
        if bsize == 0 {
            return Ok(vec![]);
        }
        let xs = xs.to_device(self.process.device());
        let features = tch::no_grad(|| self.features(&xs))?;
        let mut scores = vec![Vec::with_capacity(self.config.timesteps.len()); bsize as usize];
        for &t in self.config.timesteps.iter() {
            let (noised, _noise) = self.process.corrupt(&xs, t)?;
            let reconstruction = self.process.denoise(&noised, t)?;
            let recon_features = tch::no_grad(|| self.features(&reconstruction))?;
            let pixel_errors = (&reconstruction - &xs).square().flatten(1, -1).mean_dim(
                [1i64].as_slice(),
                false,
                Kind::Double,
            );
            let perceptual_errors = row_norms(&(recon_features - &features));
            for (i, sample_scores) in scores.iter_mut().enumerate() {
                let pixel_error = pixel_errors.double_value(&[i as i64]);
                let perceptual_error = perceptual_errors[i];
                sample_scores.push(ReconstructionScore {
                    timestep: t,
                    pixel_error,
                    perceptual_error,
                    combined: pixel_error + self.config.perceptual_weight * perceptual_error,
                })
            }
        }
        Ok(scores)
    }

    /// Scores images one at a time. `cancel` is checked before each image, setting it
    /// stops the loop and returns the scores of the images processed so far.
    pub fn score_all<I>(
        &self,
        images: I,
        cancel: &AtomicBool,
    ) -> Result<Vec<Vec<ReconstructionScore>>>
    where
        I: IntoIterator<Item = Tensor>,
    {
        let mut all_scores = vec![];
        for (idx, xs) in images.into_iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(n_scored = idx, "scoring cancelled");
                break;
            }
            let xs = if xs.dim() == 3 { xs.unsqueeze(0) } else { xs };
            self.ctx.manual_seed(idx as i64);
            let scores = self.score(&xs)?;
            if let Some(last) = scores.first().and_then(|s| s.last()) {
                tracing::info!(
                    sample = idx,
                    timestep = last.timestep,
                    pixel_error = last.pixel_error,
                    perceptual_error = last.perceptual_error,
                    "scored sample"
                );
            }
            all_scores.extend(scores);
        }
        Ok(all_scores)
    }
}

/// Area under the ROC curve when using a score to tell out-of-distribution samples
/// (expected to have higher scores) from in-distribution ones. Ties count as half.
pub fn auroc(in_distribution: &[f64], out_of_distribution: &[f64]) -> Option<f64> {
    if in_distribution.is_empty() || out_of_distribution.is_empty() {
        return None;
    }
    let mut wins = 0.;
    for &o in out_of_distribution.iter() {
        for &i in in_distribution.iter() {
            if o > i {
                wins += 1.
            } else if o == i {
                wins += 0.5
            }
        }
    }
    Some(wins / (in_distribution.len() * out_of_distribution.len()) as f64)
}
