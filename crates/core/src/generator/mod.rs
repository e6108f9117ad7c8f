//! U-Net generator: declarative topology, persisted weights, ONNX compilation
//! and ONNX Runtime execution.

pub mod backend;
pub mod onnx;
pub mod session;
pub mod topology;
pub mod weights;

use ndarray::Array4;

use crate::error::Result;

pub use backend::InferenceBackend;
pub use session::{OnnxGenerator, OnnxLoader};
pub use topology::Topology;
pub use weights::Weights;

/// A loaded image-to-image network. Instances are immutable after load and
/// shared across requests.
pub trait Generator: Send + Sync {
    /// `[N, 3, H, W]` in, `[N, 3, H, W]` out, inference only.
    fn forward(&self, input: Array4<f32>) -> Result<Array4<f32>>;
}
