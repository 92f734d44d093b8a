use crate::error::{Error, Result};
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Fixed sinusoidal features of the timestep, `half_dim` sines followed by `half_dim`
/// cosines.
#[derive(Debug)]
pub struct Timesteps {
    half_dim: i64,
    device: Device,
}

impl Timesteps {
    /// Sinusoidal features for a final embedding of width `time_embed_dim`, these use an
    /// eighth of that width for the sines and another eighth for the cosines.
    pub fn new(time_embed_dim: i64, device: Device) -> Result<Self> {
        let half_dim = time_embed_dim / 8;
        if half_dim < 2 {
            return Err(Error::config(format!(
                "time embedding width {time_embed_dim} is too small, its sinusoidal half width is {half_dim}"
            )));
        }
        Ok(Self { half_dim, device })
    }

    pub fn out_dim(&self) -> i64 {
        2 * self.half_dim
    }
}

impl Module for Timesteps {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let exponent = Tensor::arange(self.half_dim, (Kind::Float, self.device)) * -f64::ln(10000.);
        let emb = (exponent / (self.half_dim as f64 - 1.)).exp();
        // emb = timesteps[:, None] * emb[None, :]
        let emb = xs.to_kind(Kind::Float).unsqueeze(-1) * emb.unsqueeze(0);
        Tensor::cat(&[emb.sin(), emb.cos()], -1)
    }
}

/// The sinusoidal features followed by a small learned projection.
#[derive(Debug)]
pub struct TimestepEmbedding {
    time_proj: Timesteps,
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    // act_fn: "silu"
    pub fn new(vs: nn::Path, time_embed_dim: i64) -> Result<Self> {
        let time_proj = Timesteps::new(time_embed_dim, vs.device())?;
        let linear_cfg = Default::default();
        let linear_1 =
            nn::linear(&vs / "linear_1", time_proj.out_dim(), time_embed_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / "linear_2", time_embed_dim, time_embed_dim, linear_cfg);
        Ok(Self { time_proj, linear_1, linear_2 })
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.time_proj).apply(&self.linear_1).silu().apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_features() -> Result<()> {
        let timesteps = Timesteps::new(32, Device::Cpu)?;
        let xs = Tensor::from_slice(&[0f32, 10.]).apply(&timesteps);
        assert_eq!(xs.size(), [2, 8]);
        // At t = 0 all the sines vanish and all the cosines are one.
        for i in 0..4 {
            assert_eq!(xs.double_value(&[0, i]), 0.);
            assert_eq!(xs.double_value(&[0, i + 4]), 1.);
        }
        // The first frequency is one and the last one is 1/10000.
        assert!((xs.double_value(&[1, 0]) - f64::sin(10.)).abs() < 1e-5);
        assert!((xs.double_value(&[1, 3]) - f64::sin(1e-3)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn degenerate_width() {
        assert!(matches!(Timesteps::new(15, Device::Cpu), Err(Error::Configuration(_))));
        assert!(Timesteps::new(16, Device::Cpu).is_ok());
    }

    #[test]
    fn embedding_is_deterministic() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedding = TimestepEmbedding::new(vs.root(), 64)?;
        let ts = Tensor::from_slice(&[0f32, 17., 999.]);
        let e1 = ts.apply(&embedding);
        let e2 = ts.apply(&embedding);
        assert_eq!(e1.size(), [3, 64]);
        assert!(e1.equal(&e2));
        Ok(())
    }
}
