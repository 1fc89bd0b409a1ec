//! Graph reconstruction
//!
//! Turns a parsed [`TFLiteModel`] into a format-neutral [`Graph`]: tensor
//! descriptors with dynamic dimensions resolved, typed operators, and the
//! ordered input and output endpoints of the entry subgraph.

use crate::parser::{BuiltinOptions, SubGraph, TFLiteModel, TFLiteOperator, TFLiteTensor};
use crate::schema::builtin_op;
use graft_core::{Dim, Graph, GraphTensor, Node, Op, TensorDescriptor, TopologyError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata keys attached to every reconstructed graph
pub mod metadata_keys {
    pub const SOURCE_FORMAT: &str = "source_format";
    pub const TFLITE_VERSION: &str = "tflite_version";
    pub const SOURCE_SHA256: &str = "source_sha256";
}

/// Builds a [`Graph`] from the entry subgraph of a TFLite model
pub struct GraphReconstructor;

impl GraphReconstructor {
    pub fn new() -> Self {
        Self
    }

    /// Reconstruct the computation graph of subgraph 0
    pub fn reconstruct(&self, model: &TFLiteModel) -> Result<Graph, TopologyError> {
        let subgraph = model.subgraphs.first().ok_or(TopologyError::NoSubgraphs)?;
        if model.subgraphs.len() > 1 {
            warn!(
                count = model.subgraphs.len(),
                "model has multiple subgraphs; converting only the first"
            );
        }

        if subgraph.inputs.is_empty() {
            return Err(TopologyError::NoInputs);
        }
        if subgraph.outputs.is_empty() {
            return Err(TopologyError::NoOutputs);
        }

        let count = subgraph.tensors.len();
        let inputs = endpoints(&subgraph.inputs, "input", count)?;
        let outputs = endpoints(&subgraph.outputs, "output", count)?;

        let tensors = subgraph
            .tensors
            .iter()
            .enumerate()
            .map(|(index, tensor)| graph_tensor(index, tensor))
            .collect();

        let nodes = subgraph
            .operators
            .iter()
            .enumerate()
            .map(|(index, op)| node(model, subgraph, index, op))
            .collect::<Result<Vec<_>, _>>()?;

        let mut metadata = BTreeMap::new();
        metadata.insert(metadata_keys::SOURCE_FORMAT.to_string(), "tflite".to_string());
        metadata.insert(
            metadata_keys::TFLITE_VERSION.to_string(),
            model.version.to_string(),
        );
        metadata.insert(metadata_keys::SOURCE_SHA256.to_string(), model.digest.clone());

        let graph = Graph {
            name: subgraph
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "main".to_string()),
            description: model.description.clone(),
            tensors,
            nodes,
            inputs,
            outputs,
            metadata,
        };

        debug!(
            name = %graph.name,
            nodes = graph.nodes.len(),
            inputs = graph.inputs.len(),
            outputs = graph.outputs.len(),
            "reconstructed graph"
        );

        Ok(graph)
    }
}

impl Default for GraphReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate an endpoint list: in range and free of repeats
fn endpoints(
    indices: &[i32],
    role: &'static str,
    count: usize,
) -> Result<Vec<usize>, TopologyError> {
    let mut seen = HashSet::new();
    indices
        .iter()
        .map(|&raw| {
            let index = tensor_index(raw, count, || format!("Graph {}", role))?;
            if !seen.insert(index) {
                return Err(TopologyError::DuplicateEndpoint { index, role });
            }
            Ok(index)
        })
        .collect()
}

fn tensor_index(
    raw: i32,
    count: usize,
    context: impl FnOnce() -> String,
) -> Result<usize, TopologyError> {
    usize::try_from(raw)
        .ok()
        .filter(|&i| i < count)
        .ok_or_else(|| TopologyError::TensorOutOfRange {
            context: context(),
            index: raw as i64,
            count,
        })
}

/// Shape with dynamic extents taken from the shape signature
fn dims(tensor: &TFLiteTensor) -> Vec<Dim> {
    let signature = tensor
        .shape_signature
        .as_ref()
        .filter(|s| s.len() == tensor.shape.len());

    tensor
        .shape
        .iter()
        .enumerate()
        .map(|(axis, &extent)| {
            let dynamic = signature.is_some_and(|s| s[axis] < 0);
            if dynamic || extent < 0 {
                Dim::Dynamic
            } else {
                Dim::Fixed(extent as i64)
            }
        })
        .collect()
}

fn graph_tensor(index: usize, tensor: &TFLiteTensor) -> GraphTensor {
    let descriptor = TensorDescriptor {
        index,
        name: tensor.name.clone(),
        shape: dims(tensor),
        dtype: tensor.dtype.into(),
    };

    // Buffer 0 is the empty sentinel; any other buffer backing a
    // zero-element tensor is a constant with nothing to store.
    let constant = !tensor.data.is_empty()
        || (tensor.buffer_index != 0 && descriptor.num_elements() == Some(0));

    GraphTensor {
        descriptor,
        data: constant.then(|| Arc::clone(&tensor.data)),
        quantization: tensor.quantization.clone(),
    }
}

fn node(
    model: &TFLiteModel,
    subgraph: &SubGraph,
    index: usize,
    op: &TFLiteOperator,
) -> Result<Node, TopologyError> {
    let count = subgraph.tensors.len();
    let context = || format!("Operator {}", index);

    let inputs = op
        .inputs
        .iter()
        .map(|&raw| match raw {
            -1 => Ok(None),
            _ => tensor_index(raw, count, context).map(Some),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let outputs = op
        .outputs
        .iter()
        .map(|&raw| tensor_index(raw, count, context))
        .collect::<Result<Vec<_>, _>>()?;

    // The parser rejects out-of-range opcode indices.
    let (code, name) = model
        .operator_codes
        .get(op.opcode_index as usize)
        .map(|c| (c.builtin_code, c.name()))
        .unwrap_or((builtin_op::CUSTOM, "CUSTOM".to_string()));

    Ok(Node {
        index,
        op: map_op(code, name, &op.options),
        inputs,
        outputs,
    })
}

fn map_op(code: i32, name: String, options: &BuiltinOptions) -> Op {
    use BuiltinOptions as O;

    match (code, options) {
        (builtin_op::ADD, O::Arithmetic(activation)) => Op::Add { activation: *activation },
        (builtin_op::SUB, O::Arithmetic(activation)) => Op::Sub { activation: *activation },
        (builtin_op::MUL, O::Arithmetic(activation)) => Op::Mul { activation: *activation },
        (builtin_op::DIV, O::Arithmetic(activation)) => Op::Div { activation: *activation },
        (builtin_op::RELU, _) => Op::Relu,
        (builtin_op::RELU6, _) => Op::Relu6,
        (builtin_op::RELU_N1_TO_1, _) => Op::ReluN1To1,
        (builtin_op::LOGISTIC, _) => Op::Logistic,
        (builtin_op::TANH, _) => Op::Tanh,
        (builtin_op::SOFTMAX, O::Softmax { beta }) => Op::Softmax { beta: *beta },
        (builtin_op::RESHAPE, O::Reshape { new_shape }) => Op::Reshape {
            new_shape: (!new_shape.is_empty()).then(|| new_shape.clone()),
        },
        (
            builtin_op::FULLY_CONNECTED,
            O::FullyConnected {
                activation,
                keep_num_dims,
                shuffled_weights: false,
            },
        ) => Op::FullyConnected {
            activation: *activation,
            keep_num_dims: *keep_num_dims,
        },
        (builtin_op::CONV_2D, O::Conv2d(params)) => Op::Conv2d(*params),
        (
            builtin_op::DEPTHWISE_CONV_2D,
            O::DepthwiseConv2d {
                params,
                depth_multiplier,
            },
        ) => Op::DepthwiseConv2d {
            params: *params,
            depth_multiplier: *depth_multiplier,
        },
        (builtin_op::AVERAGE_POOL_2D, O::Pool2d(params)) => Op::AveragePool2d(*params),
        (builtin_op::MAX_POOL_2D, O::Pool2d(params)) => Op::MaxPool2d(*params),
        (builtin_op::CONCATENATION, O::Concatenation { axis, activation }) => {
            Op::Concatenation {
                axis: *axis,
                activation: *activation,
            }
        }
        (builtin_op::MEAN, O::Reducer { keep_dims }) => Op::Mean {
            keep_dims: *keep_dims,
        },
        (builtin_op::DEQUANTIZE, _) => Op::Dequantize,
        // Shuffled fully-connected weights land here too
        _ => Op::Unsupported { code, name },
    }
}
