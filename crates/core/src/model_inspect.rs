//! Offline inspection of generator weight files: tensor listing, content
//! digest, structural check against the topology, and a summary of the
//! compiled ONNX graph. Does not need ONNX Runtime or a GPU.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use prost::Message;
use safetensors::SafeTensors;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::generator::onnx::{self, proto};
use crate::generator::{Topology, Weights};

#[derive(Debug, Clone, Serialize)]
pub struct StoredTensor {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub elements: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologyCheck {
    pub matches: bool,
    pub expected_param_count: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub wrong_shape: Vec<String>,
    /// Set when the file could not be read as f32 weights at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub data_type: String,
    /// `-1` marks a symbolic dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub node_count: usize,
    pub op_counts: BTreeMap<String, usize>,
    pub initializer_count: usize,
    pub param_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightsInspection {
    pub sha256: String,
    pub size_bytes: usize,
    pub tensors: Vec<StoredTensor>,
    pub param_count: usize,
    pub topology: TopologyCheck,
    /// Present only when the weights match the topology.
    pub graph: Option<GraphSummary>,
}

pub fn inspect_weights(path: &Path, topology: &Topology) -> Result<WeightsInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read weights file: {}", path.display()))?;
    inspect_weights_bytes(&bytes, topology)
}

/// Fails only when the blob is not a safetensors file. Dtype or structure
/// problems are reported in [`WeightsInspection::topology`].
pub fn inspect_weights_bytes(bytes: &[u8], topology: &Topology) -> Result<WeightsInspection> {
    let parsed = SafeTensors::deserialize(bytes).context("invalid safetensors header")?;

    let mut tensors: Vec<StoredTensor> = parsed
        .tensors()
        .into_iter()
        .map(|(name, view)| StoredTensor {
            elements: view.shape().iter().product(),
            dtype: format!("{:?}", view.dtype()),
            shape: view.shape().to_vec(),
            name,
        })
        .collect();
    tensors.sort_by(|a, b| a.name.cmp(&b.name));
    let param_count = tensors.iter().map(|t| t.elements).sum();

    let mut check = TopologyCheck {
        expected_param_count: topology.parameter_count(),
        ..Default::default()
    };
    let mut graph = None;

    match Weights::from_safetensors(bytes) {
        Err(err) => check.error = Some(format!("{err:#}")),
        Ok(weights) => match weights.check_against(topology) {
            Err(mismatch) => {
                check.missing = mismatch.missing;
                check.unexpected = mismatch.unexpected;
                check.wrong_shape = mismatch.wrong_shape.iter().map(ToString::to_string).collect();
            }
            Ok(()) => {
                check.matches = true;
                let model = onnx::compile(topology, weights)?;
                graph = Some(summarize_graph(&model)?);
            }
        },
    }

    Ok(WeightsInspection {
        sha256: sha256_hex(bytes),
        size_bytes: bytes.len(),
        tensors,
        param_count,
        topology: check,
        graph,
    })
}

/// Compile a weights file into a standalone `.onnx` model.
pub fn export_onnx(weights_path: &Path, topology: &Topology, out_path: &Path) -> Result<usize> {
    let weights = Weights::read(weights_path)?;
    let model = onnx::compile(topology, weights)?;
    let bytes = onnx::encode(&model);
    std::fs::write(out_path, &bytes)
        .with_context(|| format!("failed to write ONNX file: {}", out_path.display()))?;
    Ok(bytes.len())
}

/// Summarize an encoded ONNX model, e.g. one written by [`export_onnx`].
pub fn inspect_onnx_bytes(bytes: &[u8]) -> Result<GraphSummary> {
    let model = proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;
    summarize_graph(&model)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn summarize_graph(model: &proto::ModelProto) -> Result<GraphSummary> {
    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    let mut op_counts = BTreeMap::new();
    for node in &graph.node {
        *op_counts.entry(node.op_type.clone()).or_insert(0) += 1;
    }

    Ok(GraphSummary {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name.clone(),
        inputs: graph.input.iter().map(value_info_to_tensor).collect(),
        outputs: graph.output.iter().map(value_info_to_tensor).collect(),
        node_count: graph.node.len(),
        op_counts,
        initializer_count: graph.initializer.len(),
        param_count: graph
            .initializer
            .iter()
            .map(|t| t.dims.iter().map(|&d| d.max(0) as u64).product::<u64>())
            .sum(),
    })
}

fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &proto::ValueInfoProto) -> TensorInfo {
    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|proto::type_proto::Value::TensorType(t)| {
            let dims = t
                .shape
                .as_ref()
                .map(|s| {
                    s.dim
                        .iter()
                        .map(|d| match &d.value {
                            Some(proto::tensor_shape_proto::dimension::Value::DimValue(v)) => *v,
                            _ => -1,
                        })
                        .collect()
                })
                .unwrap_or_default();
            (data_type_name(t.elem_type), dims)
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}
