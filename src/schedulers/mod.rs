//! # Noise schedules and diffusion processes
//!
//! The noise schedule sets how much of the signal is destroyed at each diffusion
//! timestep, the process uses it to noise images and to denoise them back.
use crate::error::{Error, Result};
use tch::{Device, Kind, Tensor};

pub mod ddpm;

/// Lower and upper bounds for beta, both 0 and 1 would make the reverse update divide
/// by zero.
pub const BETA_CLIP: (f64, f64) = (1e-4, 0.999);

/// The per-timestep coefficients of a diffusion process.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// The cosine schedule from "Improved Denoising Diffusion Probabilistic Models",
    /// Nichol & Dhariwal 2021, https://arxiv.org/abs/2102.09672
    ///
    /// `s` is a small offset keeping beta from being too small close to `t = 0`.
    pub fn cosine(num_steps: usize, s: f64) -> Result<Self> {
        if num_steps == 0 {
            return Err(Error::config("a noise schedule needs at least one step"));
        }
        let f = |t: usize| {
            let t = t as f64 / num_steps as f64;
            f64::cos((t + s) / (1. + s) * std::f64::consts::FRAC_PI_2).powi(2)
        };
        let f0 = f(0);
        let alpha_bar = |t: usize| f(t) / f0;
        let betas: Vec<f64> = (0..num_steps)
            .map(|t| (1. - alpha_bar(t + 1) / alpha_bar(t)).clamp(BETA_CLIP.0, BETA_CLIP.1))
            .collect();
        Ok(Self::from_betas(betas))
    }

    fn from_betas(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1. - b).collect();
        let alphas_cumprod = alphas
            .iter()
            .scan(1., |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        tracing::debug!(num_steps = betas.len(), "built noise schedule");
        Self { betas, alphas, alphas_cumprod }
    }

    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

/// The diffusion timestep(s) for a batch, either one value shared by all the samples
/// or one value per sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestep {
    Shared(usize),
    PerSample(Vec<usize>),
}

impl From<usize> for Timestep {
    fn from(t: usize) -> Self {
        Self::Shared(t)
    }
}

impl From<Vec<usize>> for Timestep {
    fn from(ts: Vec<usize>) -> Self {
        Self::PerSample(ts)
    }
}

impl From<&[usize]> for Timestep {
    fn from(ts: &[usize]) -> Self {
        Self::PerSample(ts.to_vec())
    }
}

impl Timestep {
    /// One timestep per batch element, checked against the schedule length.
    pub fn per_sample(&self, batch_size: usize, num_steps: usize) -> Result<Vec<usize>> {
        let ts = match self {
            Self::Shared(t) => vec![*t; batch_size],
            Self::PerSample(ts) => {
                if ts.len() != batch_size {
                    return Err(Error::BatchMismatch { expected: batch_size, got: ts.len() });
                }
                ts.clone()
            }
        };
        if let Some(&timestep) = ts.iter().find(|&&t| t >= num_steps) {
            return Err(Error::TimestepOutOfRange { timestep, num_steps });
        }
        Ok(ts)
    }

    /// Gathers `table[t]` for each sample, shaped `[batch, 1, 1, 1]` so that it
    /// broadcasts over images.
    pub(crate) fn gather(
        &self,
        table: &[f64],
        batch_size: usize,
        kind: Kind,
        device: Device,
    ) -> Result<Tensor> {
        let values: Vec<f64> =
            self.per_sample(batch_size, table.len())?.into_iter().map(|t| table[t]).collect();
        Ok(Tensor::from_slice(&values).view([batch_size as i64, 1, 1, 1]).to_kind(kind).to(device))
    }

    /// The timesteps as a float tensor of shape `[batch]`, as consumed by the models.
    pub(crate) fn to_tensor(
        &self,
        batch_size: usize,
        num_steps: usize,
        device: Device,
    ) -> Result<Tensor> {
        let ts: Vec<f32> =
            self.per_sample(batch_size, num_steps)?.into_iter().map(|t| t as f32).collect();
        Ok(Tensor::from_slice(&ts).to(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_schedule_is_monotonic() -> Result<()> {
        let schedule = NoiseSchedule::cosine(1000, 0.008)?;
        assert_eq!(schedule.num_steps(), 1000);
        for w in schedule.alphas_cumprod().windows(2) {
            assert!(w[0] > w[1], "{} <= {}", w[0], w[1]);
        }
        Ok(())
    }

    #[test]
    fn cosine_schedule_is_clipped() -> Result<()> {
        let schedule = NoiseSchedule::cosine(1000, 0.008)?;
        for &b in schedule.betas() {
            assert!((BETA_CLIP.0..=BETA_CLIP.1).contains(&b), "beta {b}");
        }
        // The first step would be below the lower bound without clipping and the last
        // one above the upper bound.
        assert_eq!(schedule.betas()[0], BETA_CLIP.0);
        assert_eq!(schedule.betas()[999], BETA_CLIP.1);
        Ok(())
    }

    #[test]
    fn cumulative_product() -> Result<()> {
        let schedule = NoiseSchedule::cosine(10, 0.008)?;
        let (alphas, alphas_cumprod) = (schedule.alphas(), schedule.alphas_cumprod());
        assert_eq!(alphas_cumprod[0], alphas[0]);
        let mut acc = 1.;
        for t in 0..10 {
            assert!((schedule.betas()[t] + alphas[t] - 1.).abs() < 1e-12);
            acc *= alphas[t];
            assert!((alphas_cumprod[t] - acc).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn empty_schedule() {
        assert!(matches!(NoiseSchedule::cosine(0, 0.008), Err(Error::Configuration(_))));
    }

    #[test]
    fn timestep_validation() {
        assert_eq!(Timestep::from(3usize).per_sample(2, 10).unwrap(), vec![3, 3]);
        assert_eq!(Timestep::from(vec![1usize, 9]).per_sample(2, 10).unwrap(), vec![1, 9]);
        assert!(matches!(
            Timestep::from(10usize).per_sample(2, 10),
            Err(Error::TimestepOutOfRange { timestep: 10, num_steps: 10 })
        ));
        assert!(matches!(
            Timestep::from(vec![1usize, 2, 3]).per_sample(2, 10),
            Err(Error::BatchMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn gather_broadcasts_per_sample() -> Result<()> {
        let table = [0.5, 0.25, 0.125];
        let coef = Timestep::from(vec![2usize, 0]).gather(&table, 2, Kind::Float, Device::Cpu)?;
        assert_eq!(coef.size(), [2, 1, 1, 1]);
        assert_eq!(coef.double_value(&[0, 0, 0, 0]), 0.125);
        assert_eq!(coef.double_value(&[1, 0, 0, 0]), 0.5);
        Ok(())
    }
}
