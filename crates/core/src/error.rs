//! Error taxonomy for the translation core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown model identifier: {0}")]
    UnknownModel(String),

    #[error("failed to load model {model}: {reason}")]
    Load { model: String, reason: String },

    #[error("failed to decode input: {0}")]
    Decode(String),

    #[error("tensor shape error: {0}")]
    Shape(String),

    #[error("generator forward pass failed: {0}")]
    Forward(String),

    #[error("frame index {index} out of range for {len} sampled frames")]
    OutOfRange { index: usize, len: usize },

    #[error("video processing error: {0}")]
    Video(String),

    #[error("failed to encode output image: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an `anyhow` chain from the loading path, keeping every context layer.
    pub fn load(model: impl Into<String>, err: anyhow::Error) -> Self {
        Error::Load {
            model: model.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn forward(err: anyhow::Error) -> Self {
        Error::Forward(format!("{err:#}"))
    }

    pub fn video(err: anyhow::Error) -> Self {
        Error::Video(format!("{err:#}"))
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Decode(e.to_string())
    }
}
