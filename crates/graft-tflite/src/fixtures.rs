//! Synthetic TFLite models for tests and benchmarks
//!
//! [`ModelBuilder`] writes real TFLite FlatBuffers with the `flatbuffers`
//! builder API and hand-written table layouts. Tensors and operators are
//! collected first and serialized bottom-up in [`ModelBuilder::build`].

use crate::parser::TFLiteDataType;
use crate::schema::{builtin_op, field, options_type, voffset, FILE_IDENTIFIER};
use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};
use graft_core::QuantizationParams;

type TableOffset = WIPOffset<TableFinishedWIPOffset>;

/// Builtin options as written into the file (raw schema enums)
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureOptions {
    None,
    Conv2d {
        padding: u8,
        stride_w: i32,
        stride_h: i32,
        activation: u8,
    },
    DepthwiseConv2d {
        padding: u8,
        stride_w: i32,
        stride_h: i32,
        depth_multiplier: i32,
        activation: u8,
    },
    Pool2d {
        padding: u8,
        stride_w: i32,
        stride_h: i32,
        filter_w: i32,
        filter_h: i32,
        activation: u8,
    },
    FullyConnected {
        activation: u8,
        keep_num_dims: bool,
    },
    Softmax {
        beta: f32,
    },
    Concatenation {
        axis: i32,
        activation: u8,
    },
    /// AddOptions, SubOptions, MulOptions or DivOptions, by operator code
    Arithmetic {
        activation: u8,
    },
    Reshape {
        new_shape: Vec<i32>,
    },
    Reducer {
        keep_dims: bool,
    },
}

#[derive(Debug, Clone)]
struct TensorSpec {
    name: String,
    shape: Vec<i32>,
    signature: Option<Vec<i32>>,
    dtype: TFLiteDataType,
    buffer: u32,
    quantization: Option<QuantizationParams>,
}

#[derive(Debug, Clone)]
struct OperatorSpec {
    code: i32,
    opcode_index: u32,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    options: FixtureOptions,
}

/// Builder for small single-subgraph TFLite models
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    description: String,
    tensors: Vec<TensorSpec>,
    buffers: Vec<Vec<u8>>,
    opcodes: Vec<(i32, Option<String>)>,
    operators: Vec<OperatorSpec>,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    extra_subgraphs: Vec<String>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            description: "graft fixture".to_string(),
            tensors: Vec::new(),
            // Buffer 0 is the empty sentinel shared by non-constant tensors
            buffers: vec![Vec::new()],
            opcodes: Vec::new(),
            operators: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra_subgraphs: Vec::new(),
        }
    }

    pub fn description(&mut self, description: &str) -> &mut Self {
        self.description = description.to_string();
        self
    }

    fn push_tensor(&mut self, spec: TensorSpec) -> i32 {
        self.tensors.push(spec);
        (self.tensors.len() - 1) as i32
    }

    fn push_buffer(&mut self, data: Vec<u8>) -> u32 {
        self.buffers.push(data);
        (self.buffers.len() - 1) as u32
    }

    /// Non-constant tensor
    pub fn tensor(&mut self, name: &str, shape: &[i32], dtype: TFLiteDataType) -> i32 {
        self.push_tensor(TensorSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            signature: None,
            dtype,
            buffer: 0,
            quantization: None,
        })
    }

    /// Float32 tensor whose shape signature marks dynamic extents with -1
    pub fn dynamic_tensor(&mut self, name: &str, shape: &[i32], signature: &[i32]) -> i32 {
        let index = self.tensor(name, shape, TFLiteDataType::Float32);
        self.tensors[index as usize].signature = Some(signature.to_vec());
        index
    }

    /// Non-constant tensor with per-tensor quantization
    pub fn quantized_tensor(
        &mut self,
        name: &str,
        shape: &[i32],
        dtype: TFLiteDataType,
        scale: f32,
        zero_point: i64,
    ) -> i32 {
        let index = self.tensor(name, shape, dtype);
        self.tensors[index as usize].quantization = Some(QuantizationParams {
            scale: vec![scale],
            zero_point: vec![zero_point],
            quantized_dimension: 0,
        });
        index
    }

    /// Constant tensor with raw little-endian payload
    pub fn constant(
        &mut self,
        name: &str,
        shape: &[i32],
        dtype: TFLiteDataType,
        data: Vec<u8>,
    ) -> i32 {
        let buffer = self.push_buffer(data);
        self.push_tensor(TensorSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            signature: None,
            dtype,
            buffer,
            quantization: None,
        })
    }

    pub fn constant_f32(&mut self, name: &str, shape: &[i32], values: &[f32]) -> i32 {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.constant(name, shape, TFLiteDataType::Float32, data)
    }

    pub fn constant_i32(&mut self, name: &str, shape: &[i32], values: &[i32]) -> i32 {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.constant(name, shape, TFLiteDataType::Int32, data)
    }

    /// Constant tensor with affine quantization
    #[allow(clippy::too_many_arguments)]
    pub fn quantized_constant(
        &mut self,
        name: &str,
        shape: &[i32],
        dtype: TFLiteDataType,
        data: Vec<u8>,
        scale: Vec<f32>,
        zero_point: Vec<i64>,
        quantized_dimension: i32,
    ) -> i32 {
        let index = self.constant(name, shape, dtype, data);
        self.tensors[index as usize].quantization = Some(QuantizationParams {
            scale,
            zero_point,
            quantized_dimension,
        });
        index
    }

    fn opcode_index(&mut self, code: i32, custom: Option<&str>) -> u32 {
        let key = (code, custom.map(str::to_string));
        let index = match self.opcodes.iter().position(|c| *c == key) {
            Some(index) => index,
            None => {
                self.opcodes.push(key);
                self.opcodes.len() - 1
            }
        };
        index as u32
    }

    /// Builtin operator; -1 in `inputs` marks an omitted optional operand
    pub fn operator(
        &mut self,
        code: i32,
        inputs: &[i32],
        outputs: &[i32],
        options: FixtureOptions,
    ) -> &mut Self {
        let opcode_index = self.opcode_index(code, None);
        self.operators.push(OperatorSpec {
            code,
            opcode_index,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            options,
        });
        self
    }

    /// Custom operator identified by name
    pub fn custom_operator(&mut self, name: &str, inputs: &[i32], outputs: &[i32]) -> &mut Self {
        let opcode_index = self.opcode_index(builtin_op::CUSTOM, Some(name));
        self.operators.push(OperatorSpec {
            code: builtin_op::CUSTOM,
            opcode_index,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            options: FixtureOptions::None,
        });
        self
    }

    pub fn inputs(&mut self, inputs: &[i32]) -> &mut Self {
        self.inputs = inputs.to_vec();
        self
    }

    pub fn outputs(&mut self, outputs: &[i32]) -> &mut Self {
        self.outputs = outputs.to_vec();
        self
    }

    /// Append an empty, named subgraph after the main one
    pub fn extra_subgraph(&mut self, name: &str) -> &mut Self {
        self.extra_subgraphs.push(name.to_string());
        self
    }

    /// Serialize the model
    pub fn build(&self) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::with_capacity(4096);

        let buffers: Vec<TableOffset> = self
            .buffers
            .iter()
            .map(|data| write_buffer(&mut fbb, data))
            .collect();
        let buffers = fbb.create_vector(&buffers);

        let opcodes: Vec<TableOffset> = self
            .opcodes
            .iter()
            .map(|(code, custom)| write_operator_code(&mut fbb, *code, custom.as_deref()))
            .collect();
        let opcodes = fbb.create_vector(&opcodes);

        let main = self.write_main_subgraph(&mut fbb);
        let mut subgraphs = vec![main];
        for name in &self.extra_subgraphs {
            let name = fbb.create_string(name);
            let start = fbb.start_table();
            fbb.push_slot_always(voffset(field::sub_graph::NAME), name);
            subgraphs.push(fbb.end_table(start));
        }
        let subgraphs = fbb.create_vector(&subgraphs);

        let description = fbb.create_string(&self.description);

        let start = fbb.start_table();
        fbb.push_slot::<u32>(voffset(field::model::VERSION), 3, 0);
        fbb.push_slot_always(voffset(field::model::OPERATOR_CODES), opcodes);
        fbb.push_slot_always(voffset(field::model::SUBGRAPHS), subgraphs);
        fbb.push_slot_always(voffset(field::model::DESCRIPTION), description);
        fbb.push_slot_always(voffset(field::model::BUFFERS), buffers);
        let model = fbb.end_table(start);

        let identifier = std::str::from_utf8(FILE_IDENTIFIER).unwrap_or("TFL3");
        fbb.finish(model, Some(identifier));
        fbb.finished_data().to_vec()
    }

    fn write_main_subgraph(&self, fbb: &mut FlatBufferBuilder<'_>) -> TableOffset {
        let tensors: Vec<TableOffset> = self
            .tensors
            .iter()
            .map(|tensor| write_tensor(fbb, tensor))
            .collect();
        let tensors = fbb.create_vector(&tensors);

        let operators: Vec<TableOffset> = self
            .operators
            .iter()
            .map(|op| write_operator(fbb, op))
            .collect();
        let operators = fbb.create_vector(&operators);

        let inputs = fbb.create_vector(&self.inputs);
        let outputs = fbb.create_vector(&self.outputs);
        let name = fbb.create_string("main");

        let start = fbb.start_table();
        fbb.push_slot_always(voffset(field::sub_graph::TENSORS), tensors);
        fbb.push_slot_always(voffset(field::sub_graph::INPUTS), inputs);
        fbb.push_slot_always(voffset(field::sub_graph::OUTPUTS), outputs);
        fbb.push_slot_always(voffset(field::sub_graph::OPERATORS), operators);
        fbb.push_slot_always(voffset(field::sub_graph::NAME), name);
        fbb.end_table(start)
    }
}

fn write_buffer(fbb: &mut FlatBufferBuilder<'_>, data: &[u8]) -> TableOffset {
    if data.is_empty() {
        let start = fbb.start_table();
        return fbb.end_table(start);
    }
    let data = fbb.create_vector(data);
    let start = fbb.start_table();
    fbb.push_slot_always(voffset(field::buffer::DATA), data);
    fbb.end_table(start)
}

fn write_operator_code(
    fbb: &mut FlatBufferBuilder<'_>,
    code: i32,
    custom: Option<&str>,
) -> TableOffset {
    let custom = custom.map(|name| fbb.create_string(name));
    let start = fbb.start_table();
    // Codes up to 127 also go in the deprecated byte, as converters do
    fbb.push_slot::<i8>(
        voffset(field::operator_code::DEPRECATED_BUILTIN_CODE),
        code.min(127) as i8,
        0,
    );
    if let Some(custom) = custom {
        fbb.push_slot_always(voffset(field::operator_code::CUSTOM_CODE), custom);
    }
    fbb.push_slot::<i32>(voffset(field::operator_code::VERSION), 1, 1);
    fbb.push_slot::<i32>(voffset(field::operator_code::BUILTIN_CODE), code, 0);
    fbb.end_table(start)
}

fn write_tensor(fbb: &mut FlatBufferBuilder<'_>, tensor: &TensorSpec) -> TableOffset {
    let shape = fbb.create_vector(&tensor.shape);
    let signature = tensor.signature.as_ref().map(|s| fbb.create_vector(s));
    let name = fbb.create_string(&tensor.name);
    let quantization = tensor
        .quantization
        .as_ref()
        .map(|q| write_quantization(fbb, q));

    let start = fbb.start_table();
    fbb.push_slot_always(voffset(field::tensor::SHAPE), shape);
    fbb.push_slot::<u8>(voffset(field::tensor::TYPE), tensor.dtype as u8, 0);
    fbb.push_slot::<u32>(voffset(field::tensor::BUFFER), tensor.buffer, 0);
    fbb.push_slot_always(voffset(field::tensor::NAME), name);
    if let Some(quantization) = quantization {
        fbb.push_slot_always(voffset(field::tensor::QUANTIZATION), quantization);
    }
    if let Some(signature) = signature {
        fbb.push_slot_always(voffset(field::tensor::SHAPE_SIGNATURE), signature);
    }
    fbb.end_table(start)
}

fn write_quantization(fbb: &mut FlatBufferBuilder<'_>, q: &QuantizationParams) -> TableOffset {
    let scale = fbb.create_vector(&q.scale);
    let zero_point = fbb.create_vector(&q.zero_point);
    let start = fbb.start_table();
    fbb.push_slot_always(voffset(field::quantization::SCALE), scale);
    fbb.push_slot_always(voffset(field::quantization::ZERO_POINT), zero_point);
    fbb.push_slot::<i32>(
        voffset(field::quantization::QUANTIZED_DIMENSION),
        q.quantized_dimension,
        0,
    );
    fbb.end_table(start)
}

fn write_operator(fbb: &mut FlatBufferBuilder<'_>, op: &OperatorSpec) -> TableOffset {
    let inputs = fbb.create_vector(&op.inputs);
    let outputs = fbb.create_vector(&op.outputs);
    let options = write_options(fbb, op.code, &op.options);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(voffset(field::operator::OPCODE_INDEX), op.opcode_index, 0);
    fbb.push_slot_always(voffset(field::operator::INPUTS), inputs);
    fbb.push_slot_always(voffset(field::operator::OUTPUTS), outputs);
    if let Some((tag, table)) = options {
        fbb.push_slot::<u8>(voffset(field::operator::BUILTIN_OPTIONS_TYPE), tag, 0);
        fbb.push_slot_always(voffset(field::operator::BUILTIN_OPTIONS), table);
    }
    fbb.end_table(start)
}

/// Options table and its union tag
fn write_options(
    fbb: &mut FlatBufferBuilder<'_>,
    code: i32,
    options: &FixtureOptions,
) -> Option<(u8, TableOffset)> {
    if *options == FixtureOptions::None {
        return None;
    }

    // Vectors must exist before the table that references them
    let new_shape = match options {
        FixtureOptions::Reshape { new_shape } => Some(fbb.create_vector(new_shape)),
        _ => None,
    };

    let start = fbb.start_table();
    let tag = match options {
        FixtureOptions::None => options_type::NONE,
        FixtureOptions::Conv2d {
            padding,
            stride_w,
            stride_h,
            activation,
        } => {
            use field::conv_2d::*;
            fbb.push_slot::<u8>(voffset(PADDING), *padding, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_W), *stride_w, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_H), *stride_h, 0);
            fbb.push_slot::<u8>(voffset(FUSED_ACTIVATION), *activation, 0);
            options_type::CONV_2D
        }
        FixtureOptions::DepthwiseConv2d {
            padding,
            stride_w,
            stride_h,
            depth_multiplier,
            activation,
        } => {
            use field::depthwise_conv_2d::*;
            fbb.push_slot::<u8>(voffset(PADDING), *padding, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_W), *stride_w, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_H), *stride_h, 0);
            fbb.push_slot::<i32>(voffset(DEPTH_MULTIPLIER), *depth_multiplier, 0);
            fbb.push_slot::<u8>(voffset(FUSED_ACTIVATION), *activation, 0);
            options_type::DEPTHWISE_CONV_2D
        }
        FixtureOptions::Pool2d {
            padding,
            stride_w,
            stride_h,
            filter_w,
            filter_h,
            activation,
        } => {
            use field::pool_2d::*;
            fbb.push_slot::<u8>(voffset(PADDING), *padding, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_W), *stride_w, 0);
            fbb.push_slot::<i32>(voffset(STRIDE_H), *stride_h, 0);
            fbb.push_slot::<i32>(voffset(FILTER_W), *filter_w, 0);
            fbb.push_slot::<i32>(voffset(FILTER_H), *filter_h, 0);
            fbb.push_slot::<u8>(voffset(FUSED_ACTIVATION), *activation, 0);
            options_type::POOL_2D
        }
        FixtureOptions::FullyConnected {
            activation,
            keep_num_dims,
        } => {
            use field::fully_connected::*;
            fbb.push_slot::<u8>(voffset(FUSED_ACTIVATION), *activation, 0);
            fbb.push_slot::<bool>(voffset(KEEP_NUM_DIMS), *keep_num_dims, false);
            options_type::FULLY_CONNECTED
        }
        FixtureOptions::Softmax { beta } => {
            fbb.push_slot::<f32>(voffset(field::softmax::BETA), *beta, 0.0);
            options_type::SOFTMAX
        }
        FixtureOptions::Concatenation { axis, activation } => {
            use field::concatenation::*;
            fbb.push_slot::<i32>(voffset(AXIS), *axis, 0);
            fbb.push_slot::<u8>(voffset(FUSED_ACTIVATION), *activation, 0);
            options_type::CONCATENATION
        }
        FixtureOptions::Arithmetic { activation } => {
            fbb.push_slot::<u8>(
                voffset(field::arithmetic::FUSED_ACTIVATION),
                *activation,
                0,
            );
            match code {
                builtin_op::SUB => options_type::SUB,
                builtin_op::MUL => options_type::MUL,
                builtin_op::DIV => options_type::DIV,
                _ => options_type::ADD,
            }
        }
        FixtureOptions::Reshape { .. } => {
            if let Some(new_shape) = new_shape {
                fbb.push_slot_always(voffset(field::reshape::NEW_SHAPE), new_shape);
            }
            options_type::RESHAPE
        }
        FixtureOptions::Reducer { keep_dims } => {
            fbb.push_slot::<bool>(voffset(field::reducer::KEEP_DIMS), *keep_dims, false);
            options_type::REDUCER
        }
    };
    Some((tag, fbb.end_table(start)))
}

/// Deterministic small weights
fn ramp(count: usize, scale: f32) -> Vec<f32> {
    (0..count).map(|i| ((i % 17) as f32 - 8.0) * scale).collect()
}

/// Image classifier with one input and one output:
/// `input [1,224,224,3]` → CONV_2D (8 filters 3x3, stride 2, SAME, RELU6)
/// → MEAN over H,W → FULLY_CONNECTED (1000) → SOFTMAX → `output [1,1000]`
pub fn single_io_classifier() -> Vec<u8> {
    let mut b = ModelBuilder::new();
    b.description("graft fixture classifier");

    let input = b.tensor("input", &[1, 224, 224, 3], TFLiteDataType::Float32);
    let conv_w = b.constant_f32("conv/weights", &[8, 3, 3, 3], &ramp(8 * 3 * 3 * 3, 0.01));
    let conv_b = b.constant_f32("conv/bias", &[8], &ramp(8, 0.001));
    let conv_out = b.tensor("conv/output", &[1, 112, 112, 8], TFLiteDataType::Float32);
    let axes = b.constant_i32("mean/axes", &[2], &[1, 2]);
    let pooled = b.tensor("mean/output", &[1, 8], TFLiteDataType::Float32);
    let fc_w = b.constant_f32("fc/weights", &[1000, 8], &ramp(1000 * 8, 0.005));
    let fc_b = b.constant_f32("fc/bias", &[1000], &ramp(1000, 0.001));
    let logits = b.tensor("fc/output", &[1, 1000], TFLiteDataType::Float32);
    let output = b.tensor("output", &[1, 1000], TFLiteDataType::Float32);

    b.operator(
        builtin_op::CONV_2D,
        &[input, conv_w, conv_b],
        &[conv_out],
        FixtureOptions::Conv2d {
            padding: 0,
            stride_w: 2,
            stride_h: 2,
            activation: 3,
        },
    )
    .operator(
        builtin_op::MEAN,
        &[conv_out, axes],
        &[pooled],
        FixtureOptions::Reducer { keep_dims: false },
    )
    .operator(
        builtin_op::FULLY_CONNECTED,
        &[pooled, fc_w, fc_b],
        &[logits],
        FixtureOptions::FullyConnected {
            activation: 0,
            keep_num_dims: false,
        },
    )
    .operator(
        builtin_op::SOFTMAX,
        &[logits],
        &[output],
        FixtureOptions::Softmax { beta: 1.0 },
    )
    .inputs(&[input])
    .outputs(&[output]);

    b.build()
}

/// Two inputs and two outputs: `sum = relu(lhs + rhs)`, `product = lhs * rhs`
pub fn two_input_add() -> Vec<u8> {
    let mut b = ModelBuilder::new();
    b.description("graft fixture two-input add");

    let lhs = b.tensor("lhs", &[1, 4], TFLiteDataType::Float32);
    let rhs = b.tensor("rhs", &[1, 4], TFLiteDataType::Float32);
    let sum = b.tensor("sum", &[1, 4], TFLiteDataType::Float32);
    let product = b.tensor("product", &[1, 4], TFLiteDataType::Float32);

    b.operator(
        builtin_op::ADD,
        &[lhs, rhs],
        &[sum],
        FixtureOptions::Arithmetic { activation: 1 },
    )
    .operator(
        builtin_op::MUL,
        &[lhs, rhs],
        &[product],
        FixtureOptions::Arithmetic { activation: 0 },
    )
    .inputs(&[lhs, rhs])
    .outputs(&[sum, product]);

    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_has_identifier() {
        let data = single_io_classifier();
        assert_eq!(&data[4..8], FILE_IDENTIFIER);
    }

    #[test]
    fn test_operator_codes_are_deduplicated() {
        let mut b = ModelBuilder::new();
        let x = b.tensor("x", &[2], TFLiteDataType::Float32);
        let y = b.tensor("y", &[2], TFLiteDataType::Float32);
        let z = b.tensor("z", &[2], TFLiteDataType::Float32);
        b.operator(builtin_op::RELU, &[x], &[y], FixtureOptions::None)
            .operator(builtin_op::RELU, &[y], &[z], FixtureOptions::None);
        assert_eq!(b.opcodes.len(), 1);
        assert_eq!(b.operators[1].opcode_index, 0);
    }
}
