//! # Denoising Diffusion Probabilistic Models
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
//!
//! The forward process noises an image in a single closed form step. The reverse
//! process walks the timesteps down to zero, subtracting the noise predicted by a model
//! at each step. Only the posterior mean is used in the reverse update, no fresh noise
//! is injected between steps.
use super::{NoiseSchedule, Timestep};
use crate::error::{Error, Result};
use std::ops::ControlFlow;
use tch::{Device, Kind, Tensor};

/// A model estimating the noise contained in a batch of images at the given timesteps.
pub trait NoisePredictor {
    /// `xs` has shape `[batch, channels, height, width]` and `timesteps` is a float tensor
    /// of shape `[batch]`. The returned estimate has the same shape as `xs`.
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor>;
}

impl<P: NoisePredictor + ?Sized> NoisePredictor for &P {
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        (**self).predict(xs, timesteps)
    }
}

/// Additional configuration for the [`DDPMProcess`].
#[derive(Debug, Clone)]
pub struct DDPMConfig {
    /// Number of diffusion steps used when training the model.
    pub train_timesteps: usize,
    /// Offset of the cosine schedule.
    pub cosine_s: f64,
    /// Shape of the generated images.
    pub image_channels: i64,
    pub image_size: i64,
}

impl Default for DDPMConfig {
    fn default() -> Self {
        Self { train_timesteps: 1000, cosine_s: 0.008, image_channels: 1, image_size: 32 }
    }
}

pub struct DDPMProcess<P> {
    schedule: NoiseSchedule,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    // 1 / sqrt(alpha_t) and (1 - alpha_t) / sqrt(1 - alpha_bar_t), the two factors of the
    // reverse update.
    recip_sqrt_alphas: Vec<f64>,
    eps_coefs: Vec<f64>,
    predictor: P,
    device: Device,
    pub config: DDPMConfig,
}

impl<P: NoisePredictor> DDPMProcess<P> {
    pub fn new(predictor: P, config: DDPMConfig, device: Device) -> Result<Self> {
        let schedule = NoiseSchedule::cosine(config.train_timesteps, config.cosine_s)?;
        Ok(Self::with_schedule(schedule, predictor, config, device))
    }

    /// Uses an already built schedule, the number of steps in `config` is ignored.
    pub fn with_schedule(
        schedule: NoiseSchedule,
        predictor: P,
        config: DDPMConfig,
        device: Device,
    ) -> Self {
        let alphas = schedule.alphas();
        let alphas_cumprod = schedule.alphas_cumprod();
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        let recip_sqrt_alphas = alphas.iter().map(|a| 1. / a.sqrt()).collect();
        let eps_coefs = alphas
            .iter()
            .zip(sqrt_one_minus_alphas_cumprod.iter())
            .map(|(a, s)| (1. - a) / s)
            .collect();
        let config = DDPMConfig { train_timesteps: schedule.num_steps(), ..config };
        Self {
            schedule,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            recip_sqrt_alphas,
            eps_coefs,
            predictor,
            device,
            config,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn batch_size(xs: &Tensor) -> Result<usize> {
        match xs.size().as_slice() {
            [b, _, _, _] => Ok(*b as usize),
            size => Err(Error::Shape(format!("expected a batch of images, got {size:?}"))),
        }
    }

    /// Noises `xs` to timestep `t` directly from `t = 0`, returning the noised images and
    /// the standard normal noise that was used.
    pub fn corrupt(&self, xs: &Tensor, t: impl Into<Timestep>) -> Result<(Tensor, Tensor)> {
        let noise = xs.randn_like();
        let noised = self.corrupt_with_noise(xs, t, &noise)?;
        Ok((noised, noise))
    }

    /// Same as [`Self::corrupt`] with some caller provided noise.
    pub fn corrupt_with_noise(
        &self,
        xs: &Tensor,
        t: impl Into<Timestep>,
        noise: &Tensor,
    ) -> Result<Tensor> {
        let t = t.into();
        let bsize = Self::batch_size(xs)?;
        if noise.size() != xs.size() {
            return Err(Error::Shape(format!(
                "noise of shape {:?} for images of shape {:?}",
                noise.size(),
                xs.size()
            )));
        }
        let (kind, device) = (xs.kind(), xs.device());
        let signal = t.gather(&self.sqrt_alphas_cumprod, bsize, kind, device)?;
        let noise_level = t.gather(&self.sqrt_one_minus_alphas_cumprod, bsize, kind, device)?;
        Ok(signal * xs + noise_level * noise)
    }

    /// A single reverse step at timestep `t` given the noise predicted for `xs`.
    pub fn step(&self, xs: &Tensor, t: impl Into<Timestep>, noise_pred: &Tensor) -> Result<Tensor> {
        let t = t.into();
        let bsize = Self::batch_size(xs)?;
        let (kind, device) = (xs.kind(), xs.device());
        let recip_sqrt_alpha = t.gather(&self.recip_sqrt_alphas, bsize, kind, device)?;
        let eps_coef = t.gather(&self.eps_coefs, bsize, kind, device)?;
        Ok(recip_sqrt_alpha * (xs - eps_coef * noise_pred))
    }

    /// Runs the reverse process from `start_t` down to 0 included, the predictor gets
    /// called `start_t + 1` times. `f` is called after each step with the timestep that
    /// was just processed and the current estimate, breaking stops the loop and makes
    /// this return `None`.
    pub fn denoise_with_callback<F>(
        &self,
        xs: &Tensor,
        start_t: usize,
        mut f: F,
    ) -> Result<Option<Tensor>>
    where
        F: FnMut(usize, &Tensor) -> ControlFlow<()>,
    {
        let num_steps = self.schedule.num_steps();
        if start_t >= num_steps {
            return Err(Error::TimestepOutOfRange { timestep: start_t, num_steps });
        }
        let bsize = Self::batch_size(xs)?;
        let _span = tracing::debug_span!("denoise", start_t, bsize).entered();
        let mut xs = xs.shallow_clone();
        for t in (0..=start_t).rev() {
            let timesteps = Timestep::Shared(t).to_tensor(bsize, num_steps, xs.device())?;
            let noise_pred = tch::no_grad(|| self.predictor.predict(&xs, &timesteps))?;
            xs = self.step(&xs, t, &noise_pred)?;
            tracing::trace!(t, "reverse step");
            if f(t, &xs).is_break() {
                tracing::debug!(t, "reverse process interrupted");
                return Ok(None);
            }
        }
        Ok(Some(xs))
    }

    /// Reconstructs images noised to timestep `start_t`.
    pub fn denoise(&self, xs: &Tensor, start_t: usize) -> Result<Tensor> {
        let xs = self.denoise_with_callback(xs, start_t, |_, _| ControlFlow::Continue(()))?;
        xs.ok_or_else(|| Error::Shape("the reverse process did not complete".to_string()))
    }

    /// Samples new images by running the full reverse process from pure noise.
    pub fn generate(&self, n_samples: usize) -> Result<Tensor> {
        let DDPMConfig { image_channels, image_size, .. } = self.config;
        let xs = Tensor::randn(
            [n_samples as i64, image_channels, image_size, image_size],
            (Kind::Float, self.device),
        );
        self.denoise(&xs, self.schedule.num_steps() - 1)
    }
}
