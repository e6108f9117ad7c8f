//! Inference backend configuration: CPU or CUDA execution provider.
//!
//! Provides [`InferenceBackend`] and [`build_session`] to create an
//! `ort::Session` from an in-memory ONNX model with the chosen providers.

use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// Default is `Cpu`. `Cuda` requires the CUDA build of ONNX Runtime; when the
/// provider cannot be registered ORT falls back to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Build an `ort::Session` from encoded ONNX bytes.
///
/// For `InferenceBackend::Cuda` the CUDA EP is registered; if it is not
/// available the session still builds and runs on CPU.
pub fn build_session(model_bytes: &[u8], backend: InferenceBackend) -> Result<Session> {
    let started = Instant::now();
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder
                .commit_from_memory(model_bytes)
                .context("Failed to build ONNX session")?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_memory(model_bytes)
                .context("Failed to build ONNX session")?
        }
    };

    info!(
        backend = %backend,
        model_bytes = model_bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ONNX session ready"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_default() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(InferenceBackend::Cpu.to_string(), "cpu");
        assert_eq!(InferenceBackend::Cuda.to_string(), "cuda");
    }

    #[test]
    fn test_backend_serde_lowercase() {
        let parsed: InferenceBackend = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(parsed, InferenceBackend::Cuda);
        assert_eq!(serde_json::to_string(&InferenceBackend::Cpu).unwrap(), "\"cpu\"");
    }
}
