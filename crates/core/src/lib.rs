//! Core crate for daybreak: night-to-day image translation with U-Net
//! generators served through ONNX Runtime.

pub mod codec;
pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod model_id;
pub mod model_inspect;
pub mod model_store;
pub mod runtime;
pub mod server;
pub mod tensor;
pub mod translate;
pub mod video;

pub use error::{Error, Result};
pub use model_id::ModelId;
