//! Compile a [`Topology`] plus its [`Weights`] into an ONNX `ModelProto`.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use prost::Message;
use tracing::debug;

use super::topology::{
    BlockRole, Stage, StageKind, Topology, INSTANCE_NORM_EPSILON, KERNEL_SIZE, PADDING, STRIDE,
};
use super::weights::{WeightTensor, Weights};

/// Generated ONNX protobuf types from `proto/onnx.proto3`.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

use proto::attribute_proto::AttributeType;
use proto::tensor_proto::DataType;
use proto::tensor_shape_proto::{dimension, Dimension};
use proto::{
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
pub const IR_VERSION: i64 = 8;
pub const OPSET_VERSION: i64 = 17;
const PRODUCER_NAME: &str = "daybreak";
const GRAPH_NAME: &str = "unet_generator";

pub fn compile(topology: &Topology, weights: Weights) -> Result<ModelProto> {
    topology.validate().context("invalid generator topology")?;
    weights.check_against(topology)?;

    let mut graph = GraphBuilder::new(weights.into_tensors());
    let mut current = INPUT_NAME.to_string();
    let mut block_outputs: HashMap<&str, String> = HashMap::new();

    for block in &topology.blocks {
        for stage in &block.stages {
            if let Some(output) = graph.stage(stage, &current)? {
                current = output;
            }
        }

        if let BlockRole::Up { skip } = &block.role {
            let skip_value = block_outputs
                .get(skip.as_str())
                .cloned()
                .with_context(|| format!("skip source {skip} has not been emitted"))?;
            let name = format!("{}.cat", block.name);
            graph.push(
                "Concat",
                &name,
                vec![current, skip_value],
                vec![int_attr("axis", 1)],
            );
            current = name;
        }

        block_outputs.insert(block.name.as_str(), current.clone());
    }

    let last = graph
        .nodes
        .last_mut()
        .context("generator topology produced no nodes")?;
    last.output = vec![OUTPUT_NAME.to_string()];

    let channels = topology.image_channels as i64;
    let node_count = graph.nodes.len();
    let initializer_count = graph.initializers.len();

    let model = ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(GraphProto {
            name: GRAPH_NAME.to_string(),
            node: graph.nodes,
            initializer: graph.initializers,
            input: vec![image_value_info(INPUT_NAME, channels)],
            output: vec![image_value_info(OUTPUT_NAME, channels)],
            ..Default::default()
        }),
        ..Default::default()
    };

    debug!(
        nodes = node_count,
        initializers = initializer_count,
        "compiled generator graph"
    );
    Ok(model)
}

pub fn encode(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    pending: BTreeMap<String, WeightTensor>,
}

impl GraphBuilder {
    fn new(pending: BTreeMap<String, WeightTensor>) -> Self {
        Self {
            nodes: Vec::new(),
            initializers: Vec::new(),
            pending,
        }
    }

    fn push(&mut self, op_type: &str, name: &str, inputs: Vec<String>, attribute: Vec<AttributeProto>) {
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![name.to_string()],
            name: name.to_string(),
            op_type: op_type.to_string(),
            attribute,
            ..Default::default()
        });
    }

    /// Move a weight tensor into the graph as an initializer and return its name.
    fn initializer(&mut self, name: String) -> Result<String> {
        let tensor = self
            .pending
            .remove(&name)
            .with_context(|| format!("weight {name} is missing or already used"))?;
        self.initializers.push(TensorProto {
            dims: tensor.shape.iter().map(|&d| d as i64).collect(),
            data_type: DataType::Float as i32,
            name: name.clone(),
            raw_data: tensor.into_raw_le_bytes(),
            ..Default::default()
        });
        Ok(name)
    }

    /// Emit the node(s) for one stage, returning the new current value name.
    fn stage(&mut self, stage: &Stage, input: &str) -> Result<Option<String>> {
        let name = stage.name.as_str();
        let weight = || format!("{name}.weight");
        let bias = || format!("{name}.bias");

        match &stage.kind {
            StageKind::Conv { bias: has_bias, .. } | StageKind::ConvTranspose { bias: has_bias, .. } => {
                let op = if matches!(stage.kind, StageKind::Conv { .. }) {
                    "Conv"
                } else {
                    "ConvTranspose"
                };
                let mut inputs = vec![input.to_string(), self.initializer(weight())?];
                if *has_bias {
                    inputs.push(self.initializer(bias())?);
                }
                self.push(op, name, inputs, resampling_attrs());
            }
            StageKind::InstanceNorm { .. } => {
                let inputs = vec![
                    input.to_string(),
                    self.initializer(weight())?,
                    self.initializer(bias())?,
                ];
                self.push(
                    "InstanceNormalization",
                    name,
                    inputs,
                    vec![float_attr("epsilon", INSTANCE_NORM_EPSILON)],
                );
            }
            StageKind::LeakyRelu { slope } => {
                self.push(
                    "LeakyRelu",
                    name,
                    vec![input.to_string()],
                    vec![float_attr("alpha", *slope)],
                );
            }
            StageKind::Relu => self.push("Relu", name, vec![input.to_string()], Vec::new()),
            StageKind::Tanh => self.push("Tanh", name, vec![input.to_string()], Vec::new()),
            StageKind::Dropout { .. } => return Ok(None),
        }
        Ok(Some(name.to_string()))
    }
}

fn resampling_attrs() -> Vec<AttributeProto> {
    let k = KERNEL_SIZE as i64;
    let s = STRIDE as i64;
    let p = PADDING as i64;
    vec![
        ints_attr("kernel_shape", &[k, k]),
        ints_attr("strides", &[s, s]),
        ints_attr("pads", &[p, p, p, p]),
    ]
}

fn int_attr(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

fn ints_attr(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

fn float_attr(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        ..Default::default()
    }
}

/// `[batch, channels, height, width]` float tensor with symbolic batch and extent.
fn image_value_info(name: &str, channels: i64) -> ValueInfoProto {
    let param = |p: &str| Dimension {
        value: Some(dimension::Value::DimParam(p.to_string())),
    };
    let fixed = |v: i64| Dimension {
        value: Some(dimension::Value::DimValue(v)),
    };

    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: DataType::Float as i32,
                shape: Some(TensorShapeProto {
                    dim: vec![param("batch"), fixed(channels), param("height"), param("width")],
                }),
            })),
        }),
        ..Default::default()
    }
}
