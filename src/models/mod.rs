//! # Models
//!
//! The noise prediction network used in the diffusion loop.

pub mod attention;
pub mod embeddings;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;
