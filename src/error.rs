//! Errors returned by the diffusion core.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model, schedule or checkpoint cannot be set up as requested. These are only
    /// raised while building things, never while running a forward or reverse pass.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timestep {timestep} is out of range, expected a value in [0, {num_steps})")]
    TimestepOutOfRange { timestep: usize, num_steps: usize },

    /// A per-sample timestep vector does not have one entry per batch element.
    #[error("got {got} timesteps for a batch of {expected} samples")]
    BatchMismatch { expected: usize, got: usize },

    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error("error opening {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
