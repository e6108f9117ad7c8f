//! Persisted generator weights (`.safetensors`) and strict structural matching.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use thiserror::Error;

use super::topology::{ParamSpec, Topology};

/// One named tensor, kept as little-endian f32 bytes so it can be handed to
/// the ONNX initializer without re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    raw: Vec<u8>,
}

impl WeightTensor {
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            bail!(
                "tensor of shape {shape:?} needs {expected} values, got {}",
                values.len()
            );
        }
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(Self { shape, raw })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            shape,
            raw: vec![0u8; len * 4],
        }
    }

    pub fn element_count(&self) -> usize {
        self.raw.len() / 4
    }

    pub fn raw_le_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw_le_bytes(self) -> Vec<u8> {
        self.raw
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// Name → tensor mapping, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Weights {
    tensors: BTreeMap<String, WeightTensor>,
}

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    /// All-zero weights with exactly the parameters `topology` expects.
    pub fn zeros_for(topology: &Topology) -> Self {
        let tensors = topology
            .parameters()
            .into_iter()
            .map(|ParamSpec { name, shape }| (name, WeightTensor::zeros(shape)))
            .collect();
        Self { tensors }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) -> Option<WeightTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<WeightTensor> {
        self.tensors.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WeightTensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(WeightTensor::element_count).sum()
    }

    /// Parse a safetensors blob. Only `F32` tensors are accepted.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let parsed = SafeTensors::deserialize(bytes).context("invalid safetensors header")?;

        let mut tensors = BTreeMap::new();
        for (name, view) in parsed.tensors() {
            if view.dtype() != Dtype::F32 {
                bail!("tensor {name} has dtype {:?}, expected F32", view.dtype());
            }
            tensors.insert(
                name,
                WeightTensor {
                    shape: view.shape().to_vec(),
                    raw: view.data().to_vec(),
                },
            );
        }
        Ok(Self { tensors })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read weights file {}", path.display()))?;
        Self::from_safetensors(&bytes)
            .with_context(|| format!("failed to parse weights file {}", path.display()))
    }

    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let views = self
            .tensors
            .iter()
            .map(|(name, t)| {
                TensorView::new(Dtype::F32, t.shape.clone(), &t.raw)
                    .map(|view| (name.as_str(), view))
                    .with_context(|| format!("invalid tensor {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(safetensors::serialize(views, None)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_safetensors()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write weights file {}", path.display()))
    }

    /// Every expected parameter present with the exact shape, and nothing else.
    pub fn check_against(&self, topology: &Topology) -> std::result::Result<(), WeightMismatch> {
        let expected = topology.parameters();
        let mut mismatch = WeightMismatch::default();

        for spec in &expected {
            match self.tensors.get(&spec.name) {
                None => mismatch.missing.push(spec.name.clone()),
                Some(t) if t.shape != spec.shape => mismatch.wrong_shape.push(ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: t.shape.clone(),
                }),
                Some(_) => {}
            }
        }
        for name in self.tensors.keys() {
            if !expected.iter().any(|spec| &spec.name == name) {
                mismatch.unexpected.push(name.clone());
            }
        }

        if mismatch.is_empty() {
            Ok(())
        } else {
            Err(mismatch)
        }
    }

    pub(crate) fn into_tensors(self) -> BTreeMap<String, WeightTensor> {
        self.tensors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", self.summary())]
pub struct WeightMismatch {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub wrong_shape: Vec<ShapeMismatch>,
}

impl WeightMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.wrong_shape.is_empty()
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing tensors: {}", self.missing.join(", ")));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected tensors: {}", self.unexpected.join(", ")));
        }
        for shape in &self.wrong_shape {
            parts.push(shape.to_string());
        }
        format!("weights do not match generator topology ({})", parts.join("; "))
    }
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, expected {:?}",
            self.name, self.actual, self.expected
        )
    }
}
