//! In-memory computation graph
//!
//! The graph is format-neutral in structure but keeps TFLite semantics for
//! its operators: activations are NHWC and filter layouts follow TFLite.
//! Inputs and outputs are explicit, ordered endpoint lists.

use crate::types::{QuantizationParams, TensorDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A reconstructed computation graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Graph name
    pub name: String,
    /// Free-form description carried from the source model
    pub description: Option<String>,
    /// All tensors, indexed by source tensor index
    pub tensors: Vec<GraphTensor>,
    /// Nodes in execution order
    pub nodes: Vec<Node>,
    /// Input endpoints (tensor indices), in declared order
    pub inputs: Vec<usize>,
    /// Output endpoints (tensor indices), in declared order
    pub outputs: Vec<usize>,
    /// String metadata propagated into the exported model
    pub metadata: BTreeMap<String, String>,
}

impl Graph {
    /// Descriptors of the input endpoints
    pub fn input_descriptors(&self) -> Vec<&TensorDescriptor> {
        self.inputs
            .iter()
            .filter_map(|&i| self.tensors.get(i))
            .map(|t| &t.descriptor)
            .collect()
    }

    /// Descriptors of the output endpoints
    pub fn output_descriptors(&self) -> Vec<&TensorDescriptor> {
        self.outputs
            .iter()
            .filter_map(|&i| self.tensors.get(i))
            .map(|t| &t.descriptor)
            .collect()
    }

    /// Number of tensors that carry constant data
    pub fn constant_count(&self) -> usize {
        self.tensors.iter().filter(|t| t.is_constant()).count()
    }

    /// Operator names with their occurrence counts, sorted by name
    pub fn op_histogram(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.op.name().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// A tensor in the graph
#[derive(Debug, Clone)]
pub struct GraphTensor {
    /// Name, shape and type
    pub descriptor: TensorDescriptor,
    /// Constant payload (little-endian), if the tensor is a constant.
    /// Zero-element constants carry an empty payload.
    pub data: Option<Arc<[u8]>>,
    /// Quantization parameters (if quantized)
    pub quantization: Option<QuantizationParams>,
}

impl GraphTensor {
    /// True if the tensor has a constant payload
    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    /// Constant payload decoded as little-endian i32 values
    pub fn i32_values(&self) -> Option<Vec<i32>> {
        let data = self.data.as_deref()?;
        if data.len() % 4 != 0 {
            return None;
        }
        Some(
            data.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// A node in the graph
#[derive(Debug, Clone)]
pub struct Node {
    /// Position in the source operator list
    pub index: usize,
    /// Operation
    pub op: Op,
    /// Operand tensor indices (None for omitted optional operands)
    pub inputs: Vec<Option<usize>>,
    /// Result tensor indices
    pub outputs: Vec<usize>,
}

impl Node {
    /// Operand tensor index at `position`, if present
    pub fn input(&self, position: usize) -> Option<usize> {
        self.inputs.get(position).copied().flatten()
    }
}

/// Activation fused into an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    ReluN1To1,
    Relu6,
    Tanh,
    SignBit,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::None => "NONE",
            Activation::Relu => "RELU",
            Activation::ReluN1To1 => "RELU_N1_TO_1",
            Activation::Relu6 => "RELU6",
            Activation::Tanh => "TANH",
            Activation::SignBit => "SIGN_BIT",
        }
    }
}

/// Spatial padding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// Output size is ceil(input / stride); extra padding goes at the end
    #[default]
    Same,
    /// No padding
    Valid,
}

/// Parameters shared by 2-D convolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub padding: Padding,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub activation: Activation,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            padding: Padding::Same,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            activation: Activation::None,
        }
    }
}

/// Parameters for 2-D pooling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    pub padding: Padding,
    pub stride_h: i32,
    pub stride_w: i32,
    pub filter_h: i32,
    pub filter_w: i32,
    pub activation: Activation,
}

/// Graph operations
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Add { activation: Activation },
    Sub { activation: Activation },
    Mul { activation: Activation },
    Div { activation: Activation },
    Relu,
    Relu6,
    ReluN1To1,
    Logistic,
    Tanh,
    Softmax { beta: f32 },
    Reshape { new_shape: Option<Vec<i32>> },
    FullyConnected { activation: Activation, keep_num_dims: bool },
    Conv2d(ConvParams),
    DepthwiseConv2d { params: ConvParams, depth_multiplier: i32 },
    AveragePool2d(PoolParams),
    MaxPool2d(PoolParams),
    Concatenation { axis: i32, activation: Activation },
    Mean { keep_dims: bool },
    Dequantize,
    /// An operator the converter has no lowering for
    Unsupported { code: i32, name: String },
}

impl Op {
    /// Upper-case operator name, as TFLite spells it
    pub fn name(&self) -> &str {
        match self {
            Op::Add { .. } => "ADD",
            Op::Sub { .. } => "SUB",
            Op::Mul { .. } => "MUL",
            Op::Div { .. } => "DIV",
            Op::Relu => "RELU",
            Op::Relu6 => "RELU6",
            Op::ReluN1To1 => "RELU_N1_TO_1",
            Op::Logistic => "LOGISTIC",
            Op::Tanh => "TANH",
            Op::Softmax { .. } => "SOFTMAX",
            Op::Reshape { .. } => "RESHAPE",
            Op::FullyConnected { .. } => "FULLY_CONNECTED",
            Op::Conv2d(_) => "CONV_2D",
            Op::DepthwiseConv2d { .. } => "DEPTHWISE_CONV_2D",
            Op::AveragePool2d(_) => "AVERAGE_POOL_2D",
            Op::MaxPool2d(_) => "MAX_POOL_2D",
            Op::Concatenation { .. } => "CONCATENATION",
            Op::Mean { .. } => "MEAN",
            Op::Dequantize => "DEQUANTIZE",
            Op::Unsupported { name, .. } => name,
        }
    }
}
