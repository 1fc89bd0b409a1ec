//! ONNX exporter
//!
//! Lowers a [`Graph`] to an ONNX `ModelProto`. Activations stay NHWC at the
//! graph boundary; convolutions and pools are wrapped in `Transpose` nodes
//! and their constant filters are permuted to OIHW at conversion time.

use crate::constraints::{self, OutputType};
use crate::layout;
use crate::proto::{
    tensor_shape_proto, type_proto, AttributeProto, GraphProto, ModelProto, NodeProto,
    ONNXDataType, OperatorSetIdProto, StringStringEntryProto, TensorProto, TensorShapeProto,
    TypeProto, ValueInfoProto,
};
use graft_core::{
    Activation, ConvParams, ConversionError, DataType, Dim, GraftError, Graph, GraphTensor, Node,
    Op, Padding, PoolParams, TensorDescriptor, DEFAULT_OPSET, MAX_OPSET, MIN_OPSET,
};
use prost::Message;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, ConversionError>;

/// Producer name written into exported models
pub const PRODUCER_NAME: &str = "graft";

/// Lowest IR version that can carry `opset`
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=14 => 7,
        _ => 8,
    }
}

/// Graph to ONNX converter
#[derive(Debug, Clone)]
pub struct OnnxExporter {
    opset: i64,
}

impl Default for OnnxExporter {
    fn default() -> Self {
        Self {
            opset: DEFAULT_OPSET,
        }
    }
}

impl OnnxExporter {
    /// Exporter targeting the default-domain operator set `opset`
    pub fn new(opset: i64) -> Result<Self> {
        if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
            return Err(ConversionError::UnsupportedOpset(opset));
        }
        Ok(Self { opset })
    }

    /// Lower `graph` to an ONNX model
    pub fn export(&self, graph: &Graph) -> Result<ModelProto> {
        let mut lowering = Lowering::new(graph, self.opset);
        for node in &graph.nodes {
            lowering.lower(node)?;
            debug!(node = node.index, op = node.op.name(), "lowered node");
        }
        let graph_proto = lowering.finish()?;

        debug!(
            nodes = graph_proto.node.len(),
            initializers = graph_proto.initializer.len(),
            "built ONNX graph"
        );

        Ok(ModelProto {
            ir_version: ir_version_for_opset(self.opset),
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph_proto),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset,
            }],
            metadata_props: graph
                .metadata
                .iter()
                .map(|(key, value)| StringStringEntryProto {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        })
    }

    /// Serialized model bytes
    pub fn to_bytes(model: &ModelProto) -> Vec<u8> {
        model.encode_to_vec()
    }

    /// Export `graph` and write it to `path` in a single write
    pub fn export_to_file(
        &self,
        graph: &Graph,
        path: &Path,
    ) -> std::result::Result<ModelProto, GraftError> {
        let model = self.export(graph)?;
        let bytes = Self::to_bytes(&model);
        fs::write(path, &bytes)?;
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            opset = self.opset,
            "wrote ONNX model"
        );
        Ok(model)
    }
}

/// Claim `base`, or the first free `base_N`
fn claim(taken: &mut HashSet<String>, base: String) -> String {
    if taken.insert(base.clone()) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn onnx_type(descriptor: &TensorDescriptor) -> Result<ONNXDataType> {
    ONNXDataType::from_data_type(descriptor.dtype).ok_or_else(|| {
        ConversionError::UnsupportedDataType {
            dtype: descriptor.dtype.to_string(),
            tensor: descriptor.name.clone(),
        }
    })
}

/// Integer values of a constant int32 or int64 tensor
fn constant_ints(tensor: &GraphTensor) -> Option<Vec<i64>> {
    match tensor.descriptor.dtype {
        DataType::Int32 => tensor
            .i32_values()
            .map(|v| v.into_iter().map(i64::from).collect()),
        DataType::Int64 => {
            let data = tensor.data.as_deref().filter(|d| d.len() % 8 == 0)?;
            Some(
                data.chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            )
        }
        _ => None,
    }
}

fn value_info(name: &str, descriptor: &TensorDescriptor) -> Result<ValueInfoProto> {
    let elem_type = onnx_type(descriptor)?;
    let dim = descriptor
        .shape
        .iter()
        .enumerate()
        .map(|(axis, d)| tensor_shape_proto::Dimension {
            value: Some(match d {
                Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(*v),
                Dim::Dynamic => {
                    tensor_shape_proto::dimension::Value::DimParam(format!("{}_dim{}", name, axis))
                }
            }),
            ..Default::default()
        })
        .collect();

    Ok(ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn perm_attribute(perm: &[usize]) -> AttributeProto {
    AttributeProto::ints("perm", perm.iter().map(|&p| p as i64).collect())
}

fn padding_attribute(padding: Padding) -> AttributeProto {
    // TFLite SAME puts the odd pixel at the end
    let mode = match padding {
        Padding::Same => "SAME_UPPER",
        Padding::Valid => "VALID",
    };
    AttributeProto::string("auto_pad", mode)
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Little-endian scalar of `dtype`; integer targets saturate
fn scalar_bytes(dtype: ONNXDataType, value: f64) -> Option<Vec<u8>> {
    let bytes = match dtype {
        ONNXDataType::Float => (value as f32).to_le_bytes().to_vec(),
        ONNXDataType::Double => value.to_le_bytes().to_vec(),
        ONNXDataType::Int8 => (value as i8).to_le_bytes().to_vec(),
        ONNXDataType::UInt8 => (value as u8).to_le_bytes().to_vec(),
        ONNXDataType::Int16 => (value as i16).to_le_bytes().to_vec(),
        ONNXDataType::UInt16 => (value as u16).to_le_bytes().to_vec(),
        ONNXDataType::Int32 => (value as i32).to_le_bytes().to_vec(),
        ONNXDataType::UInt32 => (value as u32).to_le_bytes().to_vec(),
        ONNXDataType::Int64 => (value as i64).to_le_bytes().to_vec(),
        ONNXDataType::UInt64 => (value as u64).to_le_bytes().to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Per-graph lowering state
struct Lowering<'g> {
    graph: &'g Graph,
    opset: i64,
    /// Unique ONNX value name per graph tensor
    names: Vec<String>,
    taken: HashSet<String>,
    /// Tensors some node writes
    produced: HashSet<usize>,
    /// Tensors readable at the current node: graph inputs, written
    /// initializers and outputs of nodes lowered so far
    available: HashSet<usize>,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl<'g> Lowering<'g> {
    fn new(graph: &'g Graph, opset: i64) -> Self {
        let mut taken = HashSet::new();
        let names = graph
            .tensors
            .iter()
            .enumerate()
            .map(|(index, tensor)| {
                let name = &tensor.descriptor.name;
                if name.is_empty() {
                    claim(&mut taken, format!("tensor_{}", index))
                } else if taken.contains(name) {
                    claim(&mut taken, format!("{}_{}", name, index))
                } else {
                    claim(&mut taken, name.clone())
                }
            })
            .collect();

        Self {
            graph,
            opset,
            names,
            taken,
            produced: graph
                .nodes
                .iter()
                .flat_map(|node| node.outputs.iter().copied())
                .collect(),
            available: graph.inputs.iter().copied().collect(),
            nodes: Vec::new(),
            initializers: Vec::new(),
        }
    }

    fn fresh(&mut self, hint: &str) -> String {
        claim(&mut self.taken, hint.to_string())
    }

    fn tensor(&self, node: &Node, index: usize) -> Result<&'g GraphTensor> {
        let graph: &'g Graph = self.graph;
        graph
            .tensors
            .get(index)
            .ok_or_else(|| ConversionError::ShapeMismatch {
                node: node.index,
                message: format!("tensor {} does not exist", index),
            })
    }

    /// Index of the required operand at `position`
    fn input(&self, node: &Node, position: usize, op: &'static str) -> Result<usize> {
        node.input(position)
            .ok_or(ConversionError::MissingOperand {
                op,
                position,
                node: node.index,
            })
    }

    fn output(&self, node: &Node, position: usize) -> Result<String> {
        node.outputs
            .get(position)
            .and_then(|&index| self.names.get(index))
            .cloned()
            .ok_or_else(|| ConversionError::ShapeMismatch {
                node: node.index,
                message: format!("missing output {}", position),
            })
    }

    fn output_descriptor(&self, node: &Node, position: usize) -> Result<&'g TensorDescriptor> {
        let index = node
            .outputs
            .get(position)
            .copied()
            .ok_or_else(|| ConversionError::ShapeMismatch {
                node: node.index,
                message: format!("missing output {}", position),
            })?;
        Ok(&self.tensor(node, index)?.descriptor)
    }

    fn require_rank(&self, node: &Node, descriptor: &TensorDescriptor, rank: usize) -> Result<()> {
        if descriptor.rank() != rank {
            return Err(ConversionError::ShapeMismatch {
                node: node.index,
                message: format!(
                    "tensor '{}' has rank {}, expected {}",
                    descriptor.name,
                    descriptor.rank(),
                    rank
                ),
            });
        }
        Ok(())
    }

    /// Value name for tensor `index`, writing its initializer on first use.
    /// Quantized tensors are rejected.
    fn value(&mut self, node: &Node, index: usize, op: &'static str) -> Result<String> {
        let tensor = self.tensor(node, index)?;
        if tensor.quantization.is_some() {
            return Err(ConversionError::QuantizedOperand {
                tensor: tensor.descriptor.name.clone(),
                op,
                node: node.index,
            });
        }
        self.raw_value(node, index)
    }

    fn raw_value(&mut self, node: &Node, index: usize) -> Result<String> {
        let tensor = self.tensor(node, index)?;
        self.ensure_available(index, tensor, || format!("node {}", node.index))?;
        Ok(self.names[index].clone())
    }

    /// Constants not written by any node become initializers on first use;
    /// anything else must already be available
    fn ensure_available(
        &mut self,
        index: usize,
        tensor: &GraphTensor,
        consumer: impl FnOnce() -> String,
    ) -> Result<()> {
        if self.available.contains(&index) {
            return Ok(());
        }
        if !self.is_initializer(index, tensor) {
            return Err(ConversionError::UndefinedValue {
                tensor: tensor.descriptor.name.clone(),
                consumer: consumer(),
            });
        }
        self.emit_constant(index, tensor)?;
        self.available.insert(index);
        Ok(())
    }

    fn is_initializer(&self, index: usize, tensor: &GraphTensor) -> bool {
        tensor.is_constant() && !self.produced.contains(&index)
    }

    /// Mark the outputs of a lowered node as readable
    fn define_outputs(&mut self, node: &Node) -> Result<()> {
        for &index in &node.outputs {
            if !self.available.insert(index) {
                let tensor = self.tensor(node, index)?;
                return Err(ConversionError::DuplicateProducer {
                    tensor: tensor.descriptor.name.clone(),
                    node: node.index,
                });
            }
        }
        Ok(())
    }

    fn emit_constant(&mut self, index: usize, tensor: &GraphTensor) -> Result<()> {
        let descriptor = &tensor.descriptor;
        let invalid = |message: String| ConversionError::InvalidConstant {
            tensor: descriptor.name.clone(),
            message,
        };

        let dtype = onnx_type(descriptor)?;
        let elem_size = dtype.element_size().ok_or_else(|| {
            ConversionError::UnsupportedDataType {
                dtype: descriptor.dtype.to_string(),
                tensor: descriptor.name.clone(),
            }
        })?;
        let dims = descriptor
            .fixed_shape()
            .ok_or_else(|| invalid("constant has a dynamic shape".to_string()))?;
        let data = tensor.data.as_deref().unwrap_or_default();
        let expected = descriptor
            .num_elements()
            .and_then(|n| n.checked_mul(elem_size));
        if expected != Some(data.len()) {
            return Err(invalid(format!(
                "payload is {} bytes, shape needs {}",
                data.len(),
                expected.unwrap_or(0)
            )));
        }

        self.initializers.push(TensorProto {
            name: self.names[index].clone(),
            dims,
            data_type: dtype as i32,
            raw_data: data.to_vec(),
            ..Default::default()
        });
        Ok(())
    }

    /// New initializer with a fresh name derived from `hint`
    fn initializer(
        &mut self,
        hint: &str,
        dims: Vec<i64>,
        dtype: ONNXDataType,
        raw_data: Vec<u8>,
    ) -> String {
        let name = self.fresh(hint);
        self.initializers.push(TensorProto {
            name: name.clone(),
            dims,
            data_type: dtype as i32,
            raw_data,
            ..Default::default()
        });
        name
    }

    fn int64_vector(&mut self, hint: &str, values: &[i64]) -> String {
        self.initializer(
            hint,
            vec![values.len() as i64],
            ONNXDataType::Int64,
            i64_bytes(values),
        )
    }

    /// Scalar initializer in the element type of `descriptor`
    fn scalar_like(
        &mut self,
        hint: &str,
        descriptor: &TensorDescriptor,
        value: f64,
    ) -> Result<String> {
        let dtype = onnx_type(descriptor)?;
        let bytes =
            scalar_bytes(dtype, value).ok_or_else(|| ConversionError::UnsupportedDataType {
                dtype: descriptor.dtype.to_string(),
                tensor: descriptor.name.clone(),
            })?;
        Ok(self.initializer(hint, Vec::new(), dtype, bytes))
    }

    /// Reject operands `op_type` cannot take at the target opset, operands
    /// that disagree on the shared element type, and a node output whose
    /// declared type differs from what `op_type` computes
    fn check_operands(&self, node: &Node, op_type: &'static str, operands: &[usize]) -> Result<()> {
        let Some(constraint) = constraints::constraint(op_type, self.opset) else {
            return Ok(());
        };

        let mut bound: Option<(ONNXDataType, DataType)> = None;
        for &index in operands {
            let descriptor = &self.tensor(node, index)?.descriptor;
            let dtype = onnx_type(descriptor)?;
            if !constraint.accepts(dtype) {
                return Err(ConversionError::OperandType {
                    op_type,
                    dtype: descriptor.dtype.to_string(),
                    tensor: descriptor.name.clone(),
                    opset: self.opset,
                    node: node.index,
                });
            }
            match bound {
                Some((first, first_dtype)) if first != dtype => {
                    return Err(ConversionError::MixedOperandTypes {
                        op_type,
                        first: first_dtype.to_string(),
                        second: descriptor.dtype.to_string(),
                        node: node.index,
                    })
                }
                Some(_) => {}
                None => bound = Some((dtype, descriptor.dtype)),
            }
        }

        let computed = match constraint.output {
            OutputType::Bound => bound.map(|(dtype, _)| dtype),
            OutputType::Fixed(dtype) => Some(dtype),
            OutputType::CastTarget => None,
        };
        if let Some(computed) = computed {
            self.check_output(node, op_type, computed)?;
        }
        Ok(())
    }

    fn check_output(&self, node: &Node, op_type: &'static str, computed: ONNXDataType) -> Result<()> {
        let output = self.output_descriptor(node, 0)?;
        if onnx_type(output)? != computed {
            return Err(ConversionError::OutputType {
                op_type,
                computed: computed.name().to_string(),
                declared: output.dtype.to_string(),
                tensor: output.name.clone(),
                node: node.index,
            });
        }
        Ok(())
    }

    /// Node inputs at `positions` that are present
    fn present(node: &Node, positions: &[usize]) -> Vec<usize> {
        positions.iter().filter_map(|&p| node.input(p)).collect()
    }

    fn emit(
        &mut self,
        op_type: &str,
        input: Vec<String>,
        output: Vec<String>,
        attribute: Vec<AttributeProto>,
    ) {
        let name = format!("{}_{}", op_type, self.nodes.len());
        self.nodes.push(NodeProto {
            input,
            output,
            name,
            op_type: op_type.to_string(),
            attribute,
            ..Default::default()
        });
    }

    /// Where the main op of `node` should write: `out` itself, or an
    /// intermediate when a fused activation follows
    fn activation_target(&mut self, node: &Node, activation: Activation, out: &str) -> Result<String> {
        let op_type = match activation {
            Activation::None => return Ok(out.to_string()),
            Activation::SignBit => {
                return Err(ConversionError::UnsupportedActivation {
                    activation: activation.name().to_string(),
                    node: node.index,
                })
            }
            Activation::Relu => "Relu",
            Activation::Relu6 | Activation::ReluN1To1 => "Clip",
            Activation::Tanh => "Tanh",
        };
        if let Some(&index) = node.outputs.first() {
            self.check_operands(node, op_type, &[index])?;
        }
        Ok(self.fresh(&format!("{}_pre_act", out)))
    }

    fn apply_activation(
        &mut self,
        node: &Node,
        activation: Activation,
        pre: String,
        out: String,
    ) -> Result<()> {
        match activation {
            Activation::None => {}
            Activation::Relu => self.emit("Relu", vec![pre], vec![out], vec![]),
            Activation::Relu6 => {
                let descriptor = self.output_descriptor(node, 0)?;
                self.clip(descriptor, pre, out, 0.0, 6.0)?
            }
            Activation::ReluN1To1 => {
                let descriptor = self.output_descriptor(node, 0)?;
                self.clip(descriptor, pre, out, -1.0, 1.0)?
            }
            Activation::Tanh => self.emit("Tanh", vec![pre], vec![out], vec![]),
            Activation::SignBit => {
                return Err(ConversionError::UnsupportedActivation {
                    activation: activation.name().to_string(),
                    node: node.index,
                })
            }
        }
        Ok(())
    }

    /// Clip with bounds in the element type of `descriptor`
    fn clip(
        &mut self,
        descriptor: &TensorDescriptor,
        input: String,
        output: String,
        min: f64,
        max: f64,
    ) -> Result<()> {
        let min = self.scalar_like("clip_min", descriptor, min)?;
        let max = self.scalar_like("clip_max", descriptor, max)?;
        self.emit("Clip", vec![input, min, max], vec![output], vec![]);
        Ok(())
    }

    fn lower(&mut self, node: &'g Node) -> Result<()> {
        // Every lowered operator writes exactly one tensor
        if node.outputs.len() != 1 && !matches!(node.op, Op::Unsupported { .. }) {
            return Err(ConversionError::ShapeMismatch {
                node: node.index,
                message: format!(
                    "{} has {} outputs, expected 1",
                    node.op.name(),
                    node.outputs.len()
                ),
            });
        }
        self.lower_op(node)?;
        self.define_outputs(node)
    }

    fn lower_op(&mut self, node: &'g Node) -> Result<()> {
        match &node.op {
            Op::Add { activation } => self.binary(node, "Add", "ADD", *activation),
            Op::Sub { activation } => self.binary(node, "Sub", "SUB", *activation),
            Op::Mul { activation } => self.binary(node, "Mul", "MUL", *activation),
            Op::Div { activation } => self.binary(node, "Div", "DIV", *activation),
            Op::Relu => self.unary(node, "Relu", "RELU"),
            Op::Logistic => self.unary(node, "Sigmoid", "LOGISTIC"),
            Op::Tanh => self.unary(node, "Tanh", "TANH"),
            Op::Relu6 => self.clamp(node, "RELU6", 0.0, 6.0),
            Op::ReluN1To1 => self.clamp(node, "RELU_N1_TO_1", -1.0, 1.0),
            Op::Softmax { beta } => self.softmax(node, *beta),
            Op::Reshape { new_shape } => self.reshape(node, new_shape.as_deref()),
            Op::FullyConnected { activation, .. } => self.fully_connected(node, *activation),
            Op::Conv2d(params) => self.conv(node, params),
            Op::DepthwiseConv2d {
                params,
                depth_multiplier,
            } => self.depthwise_conv(node, params, *depth_multiplier),
            Op::AveragePool2d(params) => self.pool(node, "AveragePool", "AVERAGE_POOL_2D", params),
            Op::MaxPool2d(params) => self.pool(node, "MaxPool", "MAX_POOL_2D", params),
            Op::Concatenation { axis, activation } => self.concat(node, *axis, *activation),
            Op::Mean { keep_dims } => self.mean(node, *keep_dims),
            Op::Dequantize => self.dequantize(node),
            Op::Unsupported { code, name } => Err(ConversionError::UnsupportedOperator {
                name: name.clone(),
                code: *code,
                node: node.index,
            }),
        }
    }

    fn unary(&mut self, node: &Node, op_type: &'static str, op: &'static str) -> Result<()> {
        let x_index = self.input(node, 0, op)?;
        let x = self.value(node, x_index, op)?;
        self.check_operands(node, op_type, &[x_index])?;
        let out = self.output(node, 0)?;
        self.emit(op_type, vec![x], vec![out], vec![]);
        Ok(())
    }

    fn clamp(&mut self, node: &Node, op: &'static str, min: f64, max: f64) -> Result<()> {
        let x_index = self.input(node, 0, op)?;
        let x = self.value(node, x_index, op)?;
        self.check_operands(node, "Clip", &[x_index])?;
        let descriptor = &self.tensor(node, x_index)?.descriptor;
        let out = self.output(node, 0)?;
        self.clip(descriptor, x, out, min, max)
    }

    fn binary(
        &mut self,
        node: &Node,
        op_type: &'static str,
        op: &'static str,
        activation: Activation,
    ) -> Result<()> {
        let a_index = self.input(node, 0, op)?;
        let b_index = self.input(node, 1, op)?;
        let a = self.value(node, a_index, op)?;
        let b = self.value(node, b_index, op)?;
        self.check_operands(node, op_type, &[a_index, b_index])?;
        let out = self.output(node, 0)?;
        let pre = self.activation_target(node, activation, &out)?;
        self.emit(op_type, vec![a, b], vec![pre.clone()], vec![]);
        self.apply_activation(node, activation, pre, out)
    }

    fn softmax(&mut self, node: &Node, beta: f32) -> Result<()> {
        const OP: &str = "SOFTMAX";
        let x_index = self.input(node, 0, OP)?;
        let x = self.value(node, x_index, OP)?;
        self.check_operands(node, "Softmax", &[x_index])?;
        let out = self.output(node, 0)?;

        let logits = if (beta - 1.0).abs() > f32::EPSILON {
            let descriptor = &self.tensor(node, x_index)?.descriptor;
            let beta = self.scalar_like(&format!("{}_beta", out), descriptor, f64::from(beta))?;
            let scaled = self.fresh(&format!("{}_scaled", x));
            self.emit("Mul", vec![x, beta], vec![scaled.clone()], vec![]);
            scaled
        } else {
            x
        };

        self.emit(
            "Softmax",
            vec![logits],
            vec![out],
            vec![AttributeProto::int("axis", -1)],
        );
        Ok(())
    }

    /// Reshape target from an output descriptor; one dynamic extent becomes -1
    fn inferred_shape(&self, node: &Node, descriptor: &TensorDescriptor) -> Result<Vec<i64>> {
        let dynamic = descriptor
            .shape
            .iter()
            .filter(|d| **d == Dim::Dynamic)
            .count();
        if dynamic > 1 {
            return Err(ConversionError::ShapeMismatch {
                node: node.index,
                message: format!(
                    "cannot infer a reshape target for '{}' with {} dynamic dimensions",
                    descriptor.name, dynamic
                ),
            });
        }
        Ok(descriptor
            .shape
            .iter()
            .map(|d| d.value().unwrap_or(-1))
            .collect())
    }

    fn reshape(&mut self, node: &Node, new_shape: Option<&[i32]>) -> Result<()> {
        const OP: &str = "RESHAPE";
        let x_index = self.input(node, 0, OP)?;
        let x = self.value(node, x_index, OP)?;
        self.check_operands(node, "Reshape", &[x_index])?;
        let out = self.output(node, 0)?;
        let hint = format!("{}_shape", out);

        let shape = match node.input(1) {
            Some(index) => {
                let tensor = self.tensor(node, index)?;
                if tensor.is_constant() {
                    let values = constant_ints(tensor).ok_or_else(|| {
                        ConversionError::ShapeMismatch {
                            node: node.index,
                            message: format!(
                                "shape tensor '{}' must be int32 or int64",
                                tensor.descriptor.name
                            ),
                        }
                    })?;
                    self.int64_vector(&hint, &values)
                } else {
                    let shape = self.value(node, index, OP)?;
                    let cast = self.fresh(&format!("{}_int64", shape));
                    self.emit(
                        "Cast",
                        vec![shape],
                        vec![cast.clone()],
                        vec![AttributeProto::int("to", ONNXDataType::Int64 as i64)],
                    );
                    cast
                }
            }
            None => {
                let values = match new_shape {
                    Some(dims) => dims.iter().map(|&d| i64::from(d)).collect(),
                    None => {
                        let descriptor = self.output_descriptor(node, 0)?;
                        self.inferred_shape(node, descriptor)?
                    }
                };
                self.int64_vector(&hint, &values)
            }
        };

        self.emit("Reshape", vec![x, shape], vec![out], vec![]);
        Ok(())
    }

    fn fully_connected(&mut self, node: &Node, activation: Activation) -> Result<()> {
        const OP: &str = "FULLY_CONNECTED";
        let x_index = self.input(node, 0, OP)?;
        let w_index = self.input(node, 1, OP)?;
        let x_desc = &self.tensor(node, x_index)?.descriptor;
        let w_desc = &self.tensor(node, w_index)?.descriptor;
        self.require_rank(node, w_desc, 2)?;

        let out = self.output(node, 0)?;
        let out_desc = self.output_descriptor(node, 0)?;
        let pre = self.activation_target(node, activation, &out)?;

        let mut x = self.value(node, x_index, OP)?;
        if x_desc.rank() != 2 {
            let k = w_desc.dim(1).ok_or_else(|| ConversionError::ShapeMismatch {
                node: node.index,
                message: format!("weights '{}' have a dynamic input dimension", w_desc.name),
            })?;
            let shape = self.int64_vector(&format!("{}_flat_shape", x), &[-1, k]);
            let flat = self.fresh(&format!("{}_flat", x));
            self.emit("Reshape", vec![x, shape], vec![flat.clone()], vec![]);
            x = flat;
        }

        let mut inputs = vec![x, self.value(node, w_index, OP)?];
        if let Some(bias) = node.input(2) {
            inputs.push(self.value(node, bias, OP)?);
        }
        // Only float fully-connected layers lower to Gemm
        if !x_desc.dtype.is_float() {
            return Err(ConversionError::OperandType {
                op_type: "Gemm",
                dtype: x_desc.dtype.to_string(),
                tensor: x_desc.name.clone(),
                opset: self.opset,
                node: node.index,
            });
        }
        self.check_operands(node, "Gemm", &Self::present(node, &[0, 1, 2]))?;
        let attrs = vec![AttributeProto::int("transB", 1)];

        if out_desc.rank() == 2 {
            self.emit("Gemm", inputs, vec![pre.clone()], attrs);
        } else {
            let product = self.fresh(&format!("{}_2d", out));
            self.emit("Gemm", inputs, vec![product.clone()], attrs);
            let dims = self.inferred_shape(node, out_desc)?;
            let shape = self.int64_vector(&format!("{}_shape", out), &dims);
            self.emit("Reshape", vec![product, shape], vec![pre.clone()], vec![]);
        }

        self.apply_activation(node, activation, pre, out)
    }

    /// Filter name in OIHW layout: constants are permuted here, other
    /// tensors get a Transpose node
    fn filter(
        &mut self,
        node: &Node,
        index: usize,
        perm: &[usize; 4],
        op: &'static str,
    ) -> Result<String> {
        let tensor = self.tensor(node, index)?;
        let descriptor = &tensor.descriptor;
        self.require_rank(node, descriptor, 4)?;

        if !self.is_initializer(index, tensor) {
            let x = self.value(node, index, op)?;
            let name = self.fresh(&format!("{}_oihw", x));
            self.emit("Transpose", vec![x], vec![name.clone()], vec![perm_attribute(perm)]);
            return Ok(name);
        }

        if tensor.quantization.is_some() {
            return Err(ConversionError::QuantizedOperand {
                tensor: descriptor.name.clone(),
                op,
                node: node.index,
            });
        }

        let dtype = onnx_type(descriptor)?;
        let invalid = |message: String| ConversionError::InvalidConstant {
            tensor: descriptor.name.clone(),
            message,
        };
        let dims = descriptor
            .fixed_shape()
            .ok_or_else(|| invalid("constant has a dynamic shape".to_string()))?;
        let elem_size = dtype
            .element_size()
            .ok_or_else(|| invalid(format!("cannot permute {} elements", dtype.name())))?;
        let extents: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
        let data = tensor.data.as_deref().unwrap_or_default();
        let permuted = layout::permute(data, &extents, perm, elem_size).ok_or_else(|| {
            invalid(format!(
                "payload of {} bytes does not match its shape",
                data.len()
            ))
        })?;

        let hint = format!("{}_oihw", self.names[index]);
        Ok(self.initializer(&hint, layout::permute_dims(&dims, perm), dtype, permuted))
    }

    /// Run `op_type` in NCHW between two Transposes, then the activation
    fn spatial(
        &mut self,
        node: &Node,
        op_type: &str,
        x: String,
        rest: Vec<String>,
        attrs: Vec<AttributeProto>,
        activation: Activation,
    ) -> Result<()> {
        let out = self.output(node, 0)?;
        let pre = self.activation_target(node, activation, &out)?;

        let x_nchw = self.fresh(&format!("{}_nchw", x));
        self.emit(
            "Transpose",
            vec![x],
            vec![x_nchw.clone()],
            vec![perm_attribute(&layout::NHWC_TO_NCHW)],
        );

        let y_nchw = self.fresh(&format!("{}_nchw", out));
        let mut inputs = vec![x_nchw];
        inputs.extend(rest);
        self.emit(op_type, inputs, vec![y_nchw.clone()], attrs);

        self.emit(
            "Transpose",
            vec![y_nchw],
            vec![pre.clone()],
            vec![perm_attribute(&layout::NCHW_TO_NHWC)],
        );
        self.apply_activation(node, activation, pre, out)
    }

    fn conv_attributes(params: &ConvParams, kernel: [Option<i64>; 2]) -> Vec<AttributeProto> {
        let mut attrs = vec![
            padding_attribute(params.padding),
            AttributeProto::ints(
                "strides",
                vec![i64::from(params.stride_h), i64::from(params.stride_w)],
            ),
            AttributeProto::ints(
                "dilations",
                vec![i64::from(params.dilation_h), i64::from(params.dilation_w)],
            ),
        ];
        if let [Some(h), Some(w)] = kernel {
            attrs.push(AttributeProto::ints("kernel_shape", vec![h, w]));
        }
        attrs
    }

    fn conv(&mut self, node: &Node, params: &ConvParams) -> Result<()> {
        const OP: &str = "CONV_2D";
        let x_index = self.input(node, 0, OP)?;
        let f_index = self.input(node, 1, OP)?;
        let x_desc = &self.tensor(node, x_index)?.descriptor;
        let f_desc = &self.tensor(node, f_index)?.descriptor;
        self.require_rank(node, x_desc, 4)?;

        let x = self.value(node, x_index, OP)?;
        let mut rest = vec![self.filter(node, f_index, &layout::OHWI_TO_OIHW, OP)?];
        if let Some(bias) = node.input(2) {
            rest.push(self.value(node, bias, OP)?);
        }
        self.check_operands(node, "Conv", &Self::present(node, &[0, 1, 2]))?;

        let mut attrs = Self::conv_attributes(params, [f_desc.dim(1), f_desc.dim(2)]);
        // Filters with fewer input channels than the activation are grouped
        if let (Some(channels), Some(per_group)) = (x_desc.dim(3), f_desc.dim(3)) {
            if per_group > 0 && channels != per_group {
                if channels % per_group != 0 {
                    return Err(ConversionError::ShapeMismatch {
                        node: node.index,
                        message: format!(
                            "{} input channels are not a multiple of the filter's {}",
                            channels, per_group
                        ),
                    });
                }
                attrs.push(AttributeProto::int("group", channels / per_group));
            }
        }

        self.spatial(node, "Conv", x, rest, attrs, params.activation)
    }

    fn depthwise_conv(
        &mut self,
        node: &Node,
        params: &ConvParams,
        depth_multiplier: i32,
    ) -> Result<()> {
        const OP: &str = "DEPTHWISE_CONV_2D";
        let x_index = self.input(node, 0, OP)?;
        let f_index = self.input(node, 1, OP)?;
        let x_desc = &self.tensor(node, x_index)?.descriptor;
        let f_desc = &self.tensor(node, f_index)?.descriptor;
        self.require_rank(node, x_desc, 4)?;

        let group = match (x_desc.dim(3), f_desc.dim(3)) {
            (Some(channels), _) => channels,
            (None, Some(out_channels)) if depth_multiplier > 0 => {
                out_channels / i64::from(depth_multiplier)
            }
            _ => {
                return Err(ConversionError::ShapeMismatch {
                    node: node.index,
                    message: "cannot infer the depthwise channel count".to_string(),
                })
            }
        };

        let x = self.value(node, x_index, OP)?;
        let mut rest = vec![self.filter(node, f_index, &layout::DEPTHWISE_TO_OIHW, OP)?];
        if let Some(bias) = node.input(2) {
            rest.push(self.value(node, bias, OP)?);
        }
        self.check_operands(node, "Conv", &Self::present(node, &[0, 1, 2]))?;

        let mut attrs = Self::conv_attributes(params, [f_desc.dim(1), f_desc.dim(2)]);
        attrs.push(AttributeProto::int("group", group));

        self.spatial(node, "Conv", x, rest, attrs, params.activation)
    }

    fn pool(
        &mut self,
        node: &Node,
        op_type: &'static str,
        op: &'static str,
        params: &PoolParams,
    ) -> Result<()> {
        let x_index = self.input(node, 0, op)?;
        let x_desc = &self.tensor(node, x_index)?.descriptor;
        self.require_rank(node, x_desc, 4)?;
        let x = self.value(node, x_index, op)?;
        self.check_operands(node, op_type, &[x_index])?;

        let attrs = vec![
            padding_attribute(params.padding),
            AttributeProto::ints(
                "kernel_shape",
                vec![i64::from(params.filter_h), i64::from(params.filter_w)],
            ),
            AttributeProto::ints(
                "strides",
                vec![i64::from(params.stride_h), i64::from(params.stride_w)],
            ),
        ];

        self.spatial(node, op_type, x, Vec::new(), attrs, params.activation)
    }

    fn concat(&mut self, node: &Node, axis: i32, activation: Activation) -> Result<()> {
        const OP: &str = "CONCATENATION";
        let inputs = node
            .inputs
            .iter()
            .flatten()
            .map(|&index| self.value(node, index, OP))
            .collect::<Result<Vec<_>>>()?;
        if inputs.is_empty() {
            return Err(ConversionError::MissingOperand {
                op: OP,
                position: 0,
                node: node.index,
            });
        }
        let operands: Vec<usize> = node.inputs.iter().flatten().copied().collect();
        self.check_operands(node, "Concat", &operands)?;

        let out = self.output(node, 0)?;
        let pre = self.activation_target(node, activation, &out)?;
        self.emit(
            "Concat",
            inputs,
            vec![pre.clone()],
            vec![AttributeProto::int("axis", i64::from(axis))],
        );
        self.apply_activation(node, activation, pre, out)
    }

    fn mean(&mut self, node: &Node, keep_dims: bool) -> Result<()> {
        const OP: &str = "MEAN";
        let x_index = self.input(node, 0, OP)?;
        let x = self.value(node, x_index, OP)?;
        self.check_operands(node, "ReduceMean", &[x_index])?;
        let axes_index = self.input(node, 1, OP)?;
        let axes_tensor = self.tensor(node, axes_index)?;
        if !axes_tensor.is_constant() {
            return Err(ConversionError::NonConstantOperand {
                op: OP,
                operand: "axes",
                node: node.index,
            });
        }
        let axes = constant_ints(axes_tensor).ok_or_else(|| ConversionError::ShapeMismatch {
            node: node.index,
            message: format!(
                "axes tensor '{}' must be int32 or int64",
                axes_tensor.descriptor.name
            ),
        })?;

        let out = self.output(node, 0)?;
        self.emit(
            "ReduceMean",
            vec![x],
            vec![out],
            vec![
                AttributeProto::ints("axes", axes),
                AttributeProto::int("keepdims", i64::from(keep_dims)),
            ],
        );
        Ok(())
    }

    fn dequantize(&mut self, node: &Node) -> Result<()> {
        const OP: &str = "DEQUANTIZE";
        let x_index = self.input(node, 0, OP)?;
        let tensor = self.tensor(node, x_index)?;
        let descriptor = &tensor.descriptor;
        let out = self.output(node, 0)?;

        let Some(q) = &tensor.quantization else {
            if descriptor.dtype != DataType::Float16 {
                return Err(ConversionError::UnsupportedDataType {
                    dtype: descriptor.dtype.to_string(),
                    tensor: descriptor.name.clone(),
                });
            }
            self.check_output(node, "Cast", ONNXDataType::Float)?;
            let x = self.raw_value(node, x_index)?;
            self.emit(
                "Cast",
                vec![x],
                vec![out],
                vec![AttributeProto::int("to", ONNXDataType::Float as i64)],
            );
            return Ok(());
        };

        let zero_type = match descriptor.dtype {
            DataType::Int8 => ONNXDataType::Int8,
            DataType::UInt8 => ONNXDataType::UInt8,
            DataType::Int32 => ONNXDataType::Int32,
            other => {
                return Err(ConversionError::UnsupportedDataType {
                    dtype: other.to_string(),
                    tensor: descriptor.name.clone(),
                })
            }
        };

        if q.scale.is_empty() {
            return Err(ConversionError::InvalidConstant {
                tensor: descriptor.name.clone(),
                message: "quantization has no scale".to_string(),
            });
        }

        self.check_operands(node, "DequantizeLinear", &[x_index])?;
        let x = self.raw_value(node, x_index)?;
        let per_channel = !q.is_per_tensor();
        let dims = if per_channel {
            vec![q.scale.len() as i64]
        } else {
            Vec::new()
        };

        let zero_points: Vec<i64> = (0..q.scale.len())
            .map(|i| q.zero_point.get(i).copied().unwrap_or(0))
            .collect();
        let zero_bytes: Vec<u8> = match zero_type {
            ONNXDataType::Int32 => zero_points
                .iter()
                .flat_map(|&z| (z as i32).to_le_bytes())
                .collect(),
            ONNXDataType::Int8 => zero_points.iter().map(|&z| z as i8 as u8).collect(),
            _ => zero_points.iter().map(|&z| z as u8).collect(),
        };

        let scale = self.initializer(
            &format!("{}_scale", x),
            dims.clone(),
            ONNXDataType::Float,
            f32_bytes(&q.scale),
        );
        let zero_point =
            self.initializer(&format!("{}_zero_point", x), dims, zero_type, zero_bytes);

        let attrs = if per_channel {
            vec![AttributeProto::int("axis", i64::from(q.quantized_dimension))]
        } else {
            Vec::new()
        };
        self.emit("DequantizeLinear", vec![x, scale, zero_point], vec![out], attrs);
        Ok(())
    }

    fn finish(mut self) -> Result<GraphProto> {
        let graph = self.graph;

        // Constant outputs that no node consumed still need their payload
        for &index in &graph.outputs {
            if let Some(tensor) = graph.tensors.get(index) {
                self.ensure_available(index, tensor, || "graph output".to_string())?;
            }
        }

        let endpoint = |index: usize| -> Result<ValueInfoProto> {
            let tensor = graph.tensors.get(index).ok_or_else(|| {
                ConversionError::InvalidConstant {
                    tensor: format!("#{}", index),
                    message: "endpoint does not exist".to_string(),
                }
            })?;
            value_info(&self.names[index], &tensor.descriptor)
        };
        let input = graph
            .inputs
            .iter()
            .map(|&i| endpoint(i))
            .collect::<Result<Vec<_>>>()?;
        let output = graph
            .outputs
            .iter()
            .map(|&i| endpoint(i))
            .collect::<Result<Vec<_>>>()?;

        // Types for intermediate values, where ONNX can express them
        let endpoints: HashSet<usize> = graph.inputs.iter().chain(&graph.outputs).copied().collect();
        let intermediates = graph
            .nodes
            .iter()
            .flat_map(|node| node.outputs.iter().copied())
            .filter(|index| !endpoints.contains(index))
            .filter_map(|index| {
                let tensor = graph.tensors.get(index)?;
                value_info(&self.names[index], &tensor.descriptor).ok()
            })
            .collect();

        Ok(GraphProto {
            node: self.nodes,
            name: graph.name.clone(),
            initializer: self.initializers,
            doc_string: graph.description.clone().unwrap_or_default(),
            input,
            output,
            value_info: intermediates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::QuantizationParams;
    use std::collections::BTreeMap;

    fn descriptor(index: usize, name: &str, shape: &[i64], dtype: DataType) -> TensorDescriptor {
        TensorDescriptor {
            index,
            name: name.to_string(),
            shape: shape.iter().map(|&d| Dim::Fixed(d)).collect(),
            dtype,
        }
    }

    fn activation(index: usize, name: &str, shape: &[i64]) -> GraphTensor {
        typed(index, name, shape, DataType::Float32)
    }

    fn typed(index: usize, name: &str, shape: &[i64], dtype: DataType) -> GraphTensor {
        GraphTensor {
            descriptor: descriptor(index, name, shape, dtype),
            data: None,
            quantization: None,
        }
    }

    fn constant_f32(index: usize, name: &str, shape: &[i64], values: &[f32]) -> GraphTensor {
        GraphTensor {
            descriptor: descriptor(index, name, shape, DataType::Float32),
            data: Some(f32_bytes(values).into()),
            quantization: None,
        }
    }

    fn node(index: usize, op: Op, inputs: &[usize], outputs: &[usize]) -> Node {
        Node {
            index,
            op,
            inputs: inputs.iter().map(|&i| Some(i)).collect(),
            outputs: outputs.to_vec(),
        }
    }

    fn graph(tensors: Vec<GraphTensor>, nodes: Vec<Node>, inputs: &[usize], outputs: &[usize]) -> Graph {
        Graph {
            name: "test".into(),
            description: Some("unit".into()),
            tensors,
            nodes,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            metadata: BTreeMap::from([("source_format".to_string(), "tflite".to_string())]),
        }
    }

    fn op_types(model: &ModelProto) -> Vec<String> {
        model
            .graph
            .as_ref()
            .unwrap()
            .node
            .iter()
            .map(|n| n.op_type.clone())
            .collect()
    }

    #[test]
    fn test_opset_range() {
        assert!(OnnxExporter::new(13).is_ok());
        assert!(OnnxExporter::new(17).is_ok());
        assert!(matches!(
            OnnxExporter::new(12),
            Err(ConversionError::UnsupportedOpset(12))
        ));
        assert_eq!(OnnxExporter::default().opset, 13);
    }

    #[test]
    fn test_ir_version_for_opset() {
        assert_eq!(ir_version_for_opset(13), 7);
        assert_eq!(ir_version_for_opset(14), 7);
        assert_eq!(ir_version_for_opset(15), 8);
        assert_eq!(ir_version_for_opset(17), 8);
    }

    #[test]
    fn test_model_header() {
        let g = graph(
            vec![activation(0, "x", &[1, 4]), activation(1, "y", &[1, 4])],
            vec![node(0, Op::Relu, &[0], &[1])],
            &[0],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(model.ir_version, 7);
        assert_eq!(model.producer_name, "graft");
        assert_eq!(model.opset_import[0].domain, "");
        assert_eq!(model.opset_import[0].version, 13);
        assert_eq!(model.metadata_props[0].key, "source_format");

        let graph = model.graph.unwrap();
        assert_eq!(graph.doc_string, "unit");
        assert_eq!(graph.input[0].name, "x");
        assert_eq!(graph.output[0].name, "y");
        assert_eq!(graph.node[0].op_type, "Relu");
    }

    #[test]
    fn test_fused_activation_adds_clip() {
        let g = graph(
            vec![
                activation(0, "a", &[1, 4]),
                activation(1, "b", &[1, 4]),
                activation(2, "c", &[1, 4]),
            ],
            vec![node(
                0,
                Op::Add {
                    activation: Activation::Relu6,
                },
                &[0, 1],
                &[2],
            )],
            &[0, 1],
            &[2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Add", "Clip"]);

        let graph = model.graph.unwrap();
        assert_eq!(graph.node[0].output, graph.node[1].input[..1]);
        assert_eq!(graph.node[1].output, ["c"]);
        // Clip bounds are scalar float initializers
        assert_eq!(graph.initializer.len(), 2);
        assert!(graph.initializer.iter().all(|t| t.dims.is_empty()));
    }

    #[test]
    fn test_sign_bit_activation_rejected() {
        let g = graph(
            vec![
                activation(0, "a", &[1, 4]),
                activation(1, "b", &[1, 4]),
                activation(2, "c", &[1, 4]),
            ],
            vec![node(
                0,
                Op::Mul {
                    activation: Activation::SignBit,
                },
                &[0, 1],
                &[2],
            )],
            &[0, 1],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(err, ConversionError::UnsupportedActivation { node: 0, .. }));
    }

    #[test]
    fn test_conv_is_wrapped_in_transposes() {
        let filter: Vec<f32> = (0..2 * 3 * 3 * 4).map(|v| v as f32).collect();
        let g = graph(
            vec![
                activation(0, "x", &[1, 8, 8, 4]),
                constant_f32(1, "w", &[2, 3, 3, 4], &filter),
                activation(2, "y", &[1, 8, 8, 2]),
            ],
            vec![node(0, Op::Conv2d(ConvParams::default()), &[0, 1], &[2])],
            &[0],
            &[2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Transpose", "Conv", "Transpose"]);

        let graph = model.graph.unwrap();
        let weights = &graph.initializer[0];
        assert_eq!(weights.name, "w_oihw");
        assert_eq!(weights.dims, vec![2, 4, 3, 3]);
        assert_eq!(weights.raw_data.len(), filter.len() * 4);

        let conv = &graph.node[1];
        let auto_pad = conv.attribute.iter().find(|a| a.name == "auto_pad").unwrap();
        assert_eq!(auto_pad.s, b"SAME_UPPER");
        let kernel = conv.attribute.iter().find(|a| a.name == "kernel_shape").unwrap();
        assert_eq!(kernel.ints, vec![3, 3]);
        assert!(conv.attribute.iter().all(|a| a.name != "group"));
    }

    #[test]
    fn test_depthwise_sets_group() {
        let filter = vec![0.5f32; 3 * 3 * 8];
        let g = graph(
            vec![
                activation(0, "x", &[1, 8, 8, 4]),
                constant_f32(1, "dw", &[1, 3, 3, 8], &filter),
                activation(2, "y", &[1, 8, 8, 8]),
            ],
            vec![node(
                0,
                Op::DepthwiseConv2d {
                    params: ConvParams::default(),
                    depth_multiplier: 2,
                },
                &[0, 1],
                &[2],
            )],
            &[0],
            &[2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer[0].dims, vec![8, 1, 3, 3]);
        let group = graph.node[1]
            .attribute
            .iter()
            .find(|a| a.name == "group")
            .unwrap();
        assert_eq!(group.i, 4);
    }

    #[test]
    fn test_quantized_operand_rejected() {
        let mut weights = constant_f32(1, "w", &[2, 4], &[0.0; 8]);
        weights.descriptor.dtype = DataType::Int8;
        weights.data = Some(vec![0u8; 8].into());
        weights.quantization = Some(QuantizationParams {
            scale: vec![0.1],
            zero_point: vec![0],
            quantized_dimension: 0,
        });
        let g = graph(
            vec![activation(0, "x", &[1, 4]), weights, activation(2, "y", &[1, 2])],
            vec![node(
                0,
                Op::FullyConnected {
                    activation: Activation::None,
                    keep_num_dims: false,
                },
                &[0, 1],
                &[2],
            )],
            &[0],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::QuantizedOperand { op: "FULLY_CONNECTED", .. }
        ));
    }

    #[test]
    fn test_dequantize_per_channel() {
        let weights = GraphTensor {
            descriptor: descriptor(0, "w_q", &[2, 4], DataType::Int8),
            data: Some(vec![1u8; 8].into()),
            quantization: Some(QuantizationParams {
                scale: vec![0.5, 0.25],
                zero_point: vec![0, 0],
                quantized_dimension: 0,
            }),
        };
        let g = graph(
            vec![weights, activation(1, "w", &[2, 4])],
            vec![node(0, Op::Dequantize, &[0], &[1])],
            &[],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        let graph = model.graph.unwrap();
        let dq = &graph.node[0];
        assert_eq!(dq.op_type, "DequantizeLinear");
        assert_eq!(dq.input.len(), 3);
        assert_eq!(dq.attribute[0].name, "axis");

        let scale = graph.initializer.iter().find(|t| t.name == "w_q_scale").unwrap();
        assert_eq!(scale.dims, vec![2]);
        let zero = graph
            .initializer
            .iter()
            .find(|t| t.name == "w_q_zero_point")
            .unwrap();
        assert_eq!(zero.data_type, ONNXDataType::Int8 as i32);
        assert_eq!(zero.raw_data, vec![0, 0]);
    }

    #[test]
    fn test_reshape_target_from_output_descriptor() {
        let mut out = activation(1, "y", &[4]);
        out.descriptor.shape = vec![Dim::Dynamic, Dim::Fixed(8)];
        let g = graph(
            vec![activation(0, "x", &[2, 2, 8]), out],
            vec![node(0, Op::Reshape { new_shape: None }, &[0], &[1])],
            &[0],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        let graph = model.graph.unwrap();
        let shape = graph.initializer.iter().find(|t| t.name == "y_shape").unwrap();
        assert_eq!(shape.raw_data, i64_bytes(&[-1, 8]));
        let output_dims = &graph.output[0].tensor_type().unwrap().shape.as_ref().unwrap().dim;
        assert_eq!(
            output_dims[0].value,
            Some(tensor_shape_proto::dimension::Value::DimParam("y_dim0".into()))
        );
    }

    #[test]
    fn test_reshape_with_two_dynamic_dims_fails() {
        let mut out = activation(1, "y", &[4]);
        out.descriptor.shape = vec![Dim::Dynamic, Dim::Dynamic];
        let g = graph(
            vec![activation(0, "x", &[2, 2, 8]), out],
            vec![node(0, Op::Reshape { new_shape: None }, &[0], &[1])],
            &[0],
            &[1],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(err, ConversionError::ShapeMismatch { node: 0, .. }));
    }

    #[test]
    fn test_mean_requires_constant_axes() {
        let mut axes = activation(1, "axes", &[2]);
        axes.descriptor.dtype = DataType::Int32;
        let g = graph(
            vec![activation(0, "x", &[1, 4, 4, 3]), axes, activation(2, "y", &[1, 3])],
            vec![node(0, Op::Mean { keep_dims: false }, &[0, 1], &[2])],
            &[0, 1],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::NonConstantOperand { operand: "axes", .. }
        ));
    }

    #[test]
    fn test_unsupported_operator() {
        let g = graph(
            vec![activation(0, "x", &[1, 4]), activation(1, "y", &[1, 4])],
            vec![node(
                0,
                Op::Unsupported {
                    code: 16,
                    name: "LSTM".into(),
                },
                &[0],
                &[1],
            )],
            &[0],
            &[1],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported operator LSTM (code 16) at node 0");
    }

    #[test]
    fn test_names_are_unique_and_non_empty() {
        let g = graph(
            vec![
                activation(0, "", &[1, 4]),
                activation(1, "dup", &[1, 4]),
                activation(2, "dup", &[1, 4]),
            ],
            vec![
                node(0, Op::Relu, &[0], &[1]),
                node(1, Op::Tanh, &[1], &[2]),
            ],
            &[0],
            &[2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.input[0].name, "tensor_0");
        assert_eq!(graph.node[0].output, ["dup"]);
        assert_eq!(graph.output[0].name, "dup_2");
    }

    #[test]
    fn test_softmax_beta_scales_logits() {
        let g = graph(
            vec![activation(0, "x", &[1, 10]), activation(1, "y", &[1, 10])],
            vec![node(0, Op::Softmax { beta: 0.5 }, &[0], &[1])],
            &[0],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Mul", "Softmax"]);
    }

    #[test]
    fn test_fully_connected_flattens_rank_4_input() {
        let g = graph(
            vec![
                activation(0, "x", &[1, 2, 2, 2]),
                constant_f32(1, "w", &[3, 8], &[0.1; 24]),
                activation(2, "y", &[1, 3]),
            ],
            vec![node(
                0,
                Op::FullyConnected {
                    activation: Activation::Relu,
                    keep_num_dims: false,
                },
                &[0, 1],
                &[2],
            )],
            &[0],
            &[2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Reshape", "Gemm", "Relu"]);
        let graph = model.graph.unwrap();
        let trans_b = &graph.node[1].attribute[0];
        assert_eq!((trans_b.name.as_str(), trans_b.i), ("transB", 1));
    }

    #[test]
    fn test_read_before_produce_is_rejected() {
        let g = graph(
            vec![
                activation(0, "x", &[1, 4]),
                activation(1, "h", &[1, 4]),
                activation(2, "y", &[1, 4]),
            ],
            vec![node(0, Op::Relu, &[1], &[2]), node(1, Op::Tanh, &[0], &[1])],
            &[0],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::UndefinedValue { ref tensor, ref consumer }
                if tensor == "h" && consumer == "node 0"
        ));
    }

    #[test]
    fn test_tensor_written_twice_is_rejected() {
        let g = graph(
            vec![activation(0, "x", &[1, 4]), activation(1, "y", &[1, 4])],
            vec![node(0, Op::Relu, &[0], &[1]), node(1, Op::Tanh, &[0], &[1])],
            &[0],
            &[1],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(err, ConversionError::DuplicateProducer { node: 1, .. }));
    }

    #[test]
    fn test_constant_graph_output_becomes_initializer() {
        let g = graph(
            vec![
                activation(0, "x", &[1, 2]),
                activation(1, "y", &[1, 2]),
                constant_f32(2, "table", &[2], &[1.0, 2.0]),
            ],
            vec![node(0, Op::Relu, &[0], &[1])],
            &[0],
            &[1, 2],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer.len(), 1);
        assert_eq!(graph.initializer[0].name, "table");
        assert_eq!(graph.output[1].name, "table");
    }

    #[test]
    fn test_integer_relu_needs_opset_14() {
        let g = graph(
            vec![
                typed(0, "x", &[1, 4], DataType::Int32),
                typed(1, "y", &[1, 4], DataType::Int32),
            ],
            vec![node(0, Op::Relu, &[0], &[1])],
            &[0],
            &[1],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::OperandType { op_type: "Relu", opset: 13, node: 0, ref tensor, .. }
                if tensor == "x"
        ));

        let model = OnnxExporter::new(14).unwrap().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Relu"]);
    }

    #[test]
    fn test_fused_relu_checks_output_type() {
        let g = graph(
            vec![
                typed(0, "a", &[1, 4], DataType::Int32),
                typed(1, "b", &[1, 4], DataType::Int32),
                typed(2, "c", &[1, 4], DataType::Int32),
            ],
            vec![node(
                0,
                Op::Add {
                    activation: Activation::Relu,
                },
                &[0, 1],
                &[2],
            )],
            &[0, 1],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(err, ConversionError::OperandType { op_type: "Relu", .. }));
    }

    #[test]
    fn test_integer_relu6_clips_with_integer_bounds() {
        let g = graph(
            vec![
                typed(0, "x", &[1, 4], DataType::Int32),
                typed(1, "y", &[1, 4], DataType::Int32),
            ],
            vec![node(0, Op::Relu6, &[0], &[1])],
            &[0],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Clip"]);

        let graph = model.graph.unwrap();
        let bounds: Vec<_> = graph
            .initializer
            .iter()
            .map(|t| (t.data_type, t.raw_data.clone()))
            .collect();
        assert_eq!(
            bounds,
            [
                (ONNXDataType::Int32 as i32, 0i32.to_le_bytes().to_vec()),
                (ONNXDataType::Int32 as i32, 6i32.to_le_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn test_scalar_bytes_saturate() {
        assert_eq!(scalar_bytes(ONNXDataType::UInt8, -1.0), Some(vec![0]));
        assert_eq!(scalar_bytes(ONNXDataType::Int8, 6.0), Some(vec![6]));
        assert_eq!(
            scalar_bytes(ONNXDataType::Double, 0.5),
            Some(0.5f64.to_le_bytes().to_vec())
        );
        assert_eq!(scalar_bytes(ONNXDataType::Float16, 1.0), None);
    }

    #[test]
    fn test_integer_fully_connected_rejected() {
        let mut weights = typed(1, "w", &[2, 4], DataType::Int8);
        weights.data = Some(vec![1u8; 8].into());
        let g = graph(
            vec![
                typed(0, "x", &[1, 4], DataType::Int8),
                weights,
                typed(2, "y", &[1, 2], DataType::Int8),
            ],
            vec![node(
                0,
                Op::FullyConnected {
                    activation: Activation::None,
                    keep_num_dims: false,
                },
                &[0, 1],
                &[2],
            )],
            &[0],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert!(matches!(err, ConversionError::OperandType { op_type: "Gemm", .. }));
    }

    #[test]
    fn test_mixed_operand_types_rejected() {
        let g = graph(
            vec![
                activation(0, "a", &[1, 4]),
                typed(1, "b", &[1, 4], DataType::Int32),
                activation(2, "c", &[1, 4]),
            ],
            vec![node(
                0,
                Op::Sub {
                    activation: Activation::None,
                },
                &[0, 1],
                &[2],
            )],
            &[0, 1],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operands of Sub at node 0 mix float32 and int32"
        );
    }

    #[test]
    fn test_integer_max_pool_accepted() {
        let g = graph(
            vec![
                typed(0, "x", &[1, 4, 4, 2], DataType::UInt8),
                typed(1, "y", &[1, 2, 2, 2], DataType::UInt8),
            ],
            vec![node(
                0,
                Op::MaxPool2d(PoolParams {
                    padding: Padding::Valid,
                    stride_h: 2,
                    stride_w: 2,
                    filter_h: 2,
                    filter_w: 2,
                    activation: Activation::None,
                }),
                &[0],
                &[1],
            )],
            &[0],
            &[1],
        );
        let model = OnnxExporter::default().export(&g).unwrap();
        assert_eq!(op_types(&model), ["Transpose", "MaxPool", "Transpose"]);
    }

    #[test]
    fn test_output_type_must_match_computed_type() {
        let g = graph(
            vec![
                activation(0, "a", &[1, 4]),
                activation(1, "b", &[1, 4]),
                typed(2, "c", &[1, 4], DataType::Int32),
            ],
            vec![node(
                0,
                Op::Add {
                    activation: Activation::None,
                },
                &[0, 1],
                &[2],
            )],
            &[0, 1],
            &[2],
        );
        let err = OnnxExporter::default().export(&g).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Add at node 0 computes float, but output 'c' is int32"
        );
    }
}
