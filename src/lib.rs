//! # Diffusion based out-of-distribution detection
//!
//! A Denoising Diffusion Probabilistic Model (DDPM) implemented on top of Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs), used as an out-of-distribution
//! detector: an image is noised to some timestep, reconstructed by reverse diffusion and
//! the reconstruction error is used as a score.
//!
//! This library includes:
//! - A time conditioned UNet with residual units and spatial self-attention, predicting
//!   the noise present in an image.
//! - A cosine noise schedule and the forward/reverse diffusion recurrences.
//! - The scoring glue comparing an image with its reconstruction, in pixel space and
//!   through an external perceptual network.
//!
//! Weights are expected to come from an already trained model, there is no training
//! loop here.

pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};
