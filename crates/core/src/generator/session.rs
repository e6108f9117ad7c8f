use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context};
use ndarray::{Array4, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::backend::{build_session, InferenceBackend};
use super::onnx::{self, INPUT_NAME, OUTPUT_NAME};
use super::topology::Topology;
use super::weights::Weights;
use super::Generator;
use crate::error::{Error, Result};
use crate::model_id::ModelId;
use crate::model_store::GeneratorLoader;

/// Generator backed by an ONNX Runtime session built from compiled weights.
pub struct OnnxGenerator {
    session: Mutex<Session>,
}

impl OnnxGenerator {
    pub fn from_weights(topology: &Topology, weights: Weights, backend: InferenceBackend) -> anyhow::Result<Self> {
        let model = onnx::compile(topology, weights)?;
        let bytes = onnx::encode(&model);
        drop(model);

        let session = build_session(&bytes, backend)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    fn run(&self, input: Array4<f32>) -> anyhow::Result<Array4<f32>> {
        debug!(shape = ?input.shape(), "generator forward");
        let input_tensor = Tensor::from_array(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("generator session mutex poisoned"))?;
        let outputs = session.run(ort::inputs![INPUT_NAME => &input_tensor])?;
        let output_view = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;
        let output = output_view.to_owned().into_dimensionality::<Ix4>()?;
        Ok(output)
    }
}

impl Generator for OnnxGenerator {
    fn forward(&self, input: Array4<f32>) -> Result<Array4<f32>> {
        self.run(input).map_err(Error::forward)
    }
}

/// Loads `<assets_dir>/<identifier>.safetensors` into an [`OnnxGenerator`].
pub struct OnnxLoader {
    assets_dir: PathBuf,
    backend: InferenceBackend,
    topology: Topology,
}

impl OnnxLoader {
    pub fn new(assets_dir: impl Into<PathBuf>, backend: InferenceBackend) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            backend,
            topology: Topology::unet(3),
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    pub fn weights_path(&self, model: ModelId) -> PathBuf {
        self.assets_dir.join(model.weights_file_name())
    }

    fn load_inner(&self, model: ModelId) -> anyhow::Result<OnnxGenerator> {
        let path = self.weights_path(model);
        if !path.is_file() {
            return Err(anyhow!("no weights file at {}", path.display()));
        }

        let started = Instant::now();
        let weights = Weights::read(&path)?;
        let params = weights.parameter_count();
        let generator = OnnxGenerator::from_weights(&self.topology, weights, self.backend)
            .with_context(|| format!("failed to build generator from {}", path.display()))?;

        info!(
            model = %model,
            path = %path.display(),
            params,
            backend = %self.backend,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded generator"
        );
        Ok(generator)
    }
}

impl GeneratorLoader for OnnxLoader {
    fn load(&self, model: ModelId) -> Result<Arc<dyn Generator>> {
        let generator = self
            .load_inner(model)
            .map_err(|e| Error::load(model.as_str(), e))?;
        Ok(Arc::new(generator))
    }

    fn is_available(&self, model: ModelId) -> bool {
        self.weights_path(model).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::weights::WeightTensor;

    #[test]
    fn weights_path_follows_naming_convention() {
        let loader = OnnxLoader::new("/srv/assets", InferenceBackend::Cpu);
        assert_eq!(
            loader.weights_path(ModelId::ToDayGan),
            PathBuf::from("/srv/assets/ToDayGAN.safetensors")
        );
    }

    #[test]
    fn missing_weights_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = OnnxLoader::new(dir.path(), InferenceBackend::Cpu);

        assert!(!loader.is_available(ModelId::CycleGan));
        let err = loader.load(ModelId::CycleGan).err().expect("load must fail");
        match err {
            Error::Load { model, reason } => {
                assert_eq!(model, "CycleGAN");
                assert!(reason.contains("CycleGAN.safetensors"), "got: {reason}");
            }
            other => panic!("expected load error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_weights_fail_before_session_build() {
        let dir = tempfile::tempdir().unwrap();
        let loader = OnnxLoader::new(dir.path(), InferenceBackend::Cpu);

        let mut weights = Weights::new();
        weights.insert("final.0.bias", WeightTensor::zeros(vec![3]));
        weights.write(&loader.weights_path(ModelId::DualGan)).unwrap();

        assert!(loader.is_available(ModelId::DualGan));
        let err = loader.load(ModelId::DualGan).err().expect("load must fail");
        let message = err.to_string();
        assert!(message.contains("missing tensors"), "got: {message}");
    }

    #[test]
    #[ignore = "requires ONNX Runtime shared library"]
    fn zero_weight_generator_emits_tanh_of_bias() {
        let topology = Topology::unet(3);
        let mut weights = Weights::zeros_for(&topology);
        weights.insert(
            "final.0.bias",
            WeightTensor::from_f32(vec![3], &[-0.5, 0.25, 1.0]).unwrap(),
        );

        let generator =
            OnnxGenerator::from_weights(&topology, weights, InferenceBackend::Cpu).unwrap();
        let output = generator
            .forward(Array4::from_elem((1, 3, 128, 128), 0.3))
            .unwrap();

        assert_eq!(output.shape(), &[1, 3, 128, 128]);
        for (c, b) in [-0.5f32, 0.25, 1.0].into_iter().enumerate() {
            let expected = b.tanh();
            assert!(
                output
                    .index_axis(ndarray::Axis(1), c)
                    .iter()
                    .all(|v| (v - expected).abs() < 1e-5),
                "channel {c} should be tanh({b})"
            );
        }
    }
}
