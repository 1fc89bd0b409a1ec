//! TFLite FlatBuffer parser
//!
//! Parses TensorFlow Lite model files (.tflite) into a [`TFLiteModel`]: the
//! operator codes, every subgraph with its tensors and operators, and the
//! tensor payloads resolved from the model's buffers.

use crate::flatbuffer::{slice, Table};
use crate::schema::{self, builtin_op, field, options_type};
use graft_core::{
    sha256_hex, Activation, ConvParams, DataType, LoadError, Padding, PoolParams,
    QuantizationParams,
};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Parsed TFLite model
#[derive(Debug, Clone)]
pub struct TFLiteModel {
    /// TFLite schema version
    pub version: u32,
    /// Model description
    pub description: Option<String>,
    /// Operator codes referenced by `TFLiteOperator::opcode_index`
    pub operator_codes: Vec<OperatorCode>,
    /// Subgraphs; index 0 is the entry point
    pub subgraphs: Vec<SubGraph>,
    /// Number of buffers in the model
    pub buffer_count: usize,
    /// Size of the source file in bytes
    pub size: usize,
    /// SHA-256 of the source bytes (hex)
    pub digest: String,
}

/// An entry of the model's operator code table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorCode {
    /// Resolved builtin operator code
    pub builtin_code: i32,
    /// Custom operator name, for CUSTOM operators
    pub custom_code: Option<String>,
    /// Operator version
    pub version: i32,
}

impl OperatorCode {
    /// Display name: the custom code for custom ops, the schema name otherwise
    pub fn name(&self) -> String {
        match (&self.custom_code, self.builtin_code) {
            (Some(custom), builtin_op::CUSTOM) => custom.clone(),
            _ => schema::builtin_name(self.builtin_code),
        }
    }
}

/// A subgraph in a TFLite model
#[derive(Debug, Clone, Default)]
pub struct SubGraph {
    /// Subgraph name
    pub name: Option<String>,
    /// Tensors
    pub tensors: Vec<TFLiteTensor>,
    /// Input tensor indices
    pub inputs: Vec<i32>,
    /// Output tensor indices
    pub outputs: Vec<i32>,
    /// Operators in execution order
    pub operators: Vec<TFLiteOperator>,
}

/// A tensor in a TFLite model
#[derive(Debug, Clone)]
pub struct TFLiteTensor {
    /// Tensor name
    pub name: String,
    /// Shape dimensions
    pub shape: Vec<i32>,
    /// Shape with -1 for dynamic dimensions, when the model records it
    pub shape_signature: Option<Vec<i32>>,
    /// Data type
    pub dtype: TFLiteDataType,
    /// Buffer index in the model
    pub buffer_index: u32,
    /// Payload of the referenced buffer, shared with every tensor that
    /// points at it (empty for non-constant tensors)
    pub data: Arc<[u8]>,
    /// Quantization parameters (if quantized)
    pub quantization: Option<QuantizationParams>,
}

/// An operator in a subgraph
#[derive(Debug, Clone)]
pub struct TFLiteOperator {
    /// Index into `TFLiteModel::operator_codes`
    pub opcode_index: u32,
    /// Input tensor indices (-1 for omitted optional inputs)
    pub inputs: Vec<i32>,
    /// Output tensor indices
    pub outputs: Vec<i32>,
    /// Decoded builtin options
    pub options: BuiltinOptions,
}

/// Decoded builtin options for the operators the converter understands
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinOptions {
    None,
    Conv2d(ConvParams),
    DepthwiseConv2d {
        params: ConvParams,
        depth_multiplier: i32,
    },
    Pool2d(PoolParams),
    FullyConnected {
        activation: Activation,
        keep_num_dims: bool,
        shuffled_weights: bool,
    },
    Softmax {
        beta: f32,
    },
    Concatenation {
        axis: i32,
        activation: Activation,
    },
    /// Add, Sub, Mul and Div only carry a fused activation
    Arithmetic(Activation),
    Reshape {
        new_shape: Vec<i32>,
    },
    Reducer {
        keep_dims: bool,
    },
}

/// TFLite data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TFLiteDataType {
    Float32 = 0,
    Float16 = 1,
    Int32 = 2,
    UInt8 = 3,
    Int64 = 4,
    String = 5,
    Bool = 6,
    Int16 = 7,
    Complex64 = 8,
    Int8 = 9,
    Float64 = 10,
    Complex128 = 11,
    UInt64 = 12,
    Resource = 13,
    Variant = 14,
    UInt32 = 15,
    UInt16 = 16,
    Int4 = 17,
}

impl TFLiteDataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Float32),
            1 => Some(Self::Float16),
            2 => Some(Self::Int32),
            3 => Some(Self::UInt8),
            4 => Some(Self::Int64),
            5 => Some(Self::String),
            6 => Some(Self::Bool),
            7 => Some(Self::Int16),
            8 => Some(Self::Complex64),
            9 => Some(Self::Int8),
            10 => Some(Self::Float64),
            11 => Some(Self::Complex128),
            12 => Some(Self::UInt64),
            13 => Some(Self::Resource),
            14 => Some(Self::Variant),
            15 => Some(Self::UInt32),
            16 => Some(Self::UInt16),
            17 => Some(Self::Int4),
            _ => None,
        }
    }
}

impl From<TFLiteDataType> for DataType {
    fn from(dtype: TFLiteDataType) -> Self {
        match dtype {
            TFLiteDataType::Float32 => DataType::Float32,
            TFLiteDataType::Float16 => DataType::Float16,
            TFLiteDataType::Int32 => DataType::Int32,
            TFLiteDataType::UInt8 => DataType::UInt8,
            TFLiteDataType::Int64 => DataType::Int64,
            TFLiteDataType::String => DataType::String,
            TFLiteDataType::Bool => DataType::Bool,
            TFLiteDataType::Int16 => DataType::Int16,
            TFLiteDataType::Complex64 => DataType::Complex64,
            TFLiteDataType::Int8 => DataType::Int8,
            TFLiteDataType::Float64 => DataType::Float64,
            TFLiteDataType::Complex128 => DataType::Complex128,
            TFLiteDataType::UInt64 => DataType::UInt64,
            TFLiteDataType::Resource => DataType::Resource,
            TFLiteDataType::Variant => DataType::Variant,
            TFLiteDataType::UInt32 => DataType::UInt32,
            TFLiteDataType::UInt16 => DataType::UInt16,
            TFLiteDataType::Int4 => DataType::Int4,
        }
    }
}

/// TFLite model parser
pub struct TFLiteParser;

impl TFLiteParser {
    /// Create a new parser
    pub fn new() -> Self {
        Self
    }

    /// Read and parse a TFLite model file
    pub fn load(&self, path: &Path) -> Result<TFLiteModel, LoadError> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
            _ => LoadError::Io(e),
        })?;
        info!(path = %path.display(), bytes = data.len(), "loading TFLite model");
        self.parse(&data)
    }

    /// Parse a TFLite model from bytes
    pub fn parse(&self, data: &[u8]) -> Result<TFLiteModel, LoadError> {
        if data.len() < 8 {
            return Err(LoadError::Malformed("File too small".into()));
        }

        // Offset 0: u32 root table offset; offset 4: file identifier "TFL3"
        let identifier = &data[4..8];
        if identifier != schema::FILE_IDENTIFIER {
            return Err(LoadError::InvalidIdentifier {
                expected: String::from_utf8_lossy(schema::FILE_IDENTIFIER).into_owned(),
                found: String::from_utf8_lossy(identifier).into_owned(),
            });
        }

        let model = Table::root(data)?;

        let version = model.u32_field(field::model::VERSION, 3)?;
        let description = model.string_field(field::model::DESCRIPTION)?;

        let operator_codes = model
            .tables_field(field::model::OPERATOR_CODES)?
            .iter()
            .map(parse_operator_code)
            .collect::<Result<Vec<_>, _>>()?;

        // Parse buffers first (we need them for tensor data)
        let buffers = model
            .tables_field(field::model::BUFFERS)?
            .iter()
            .map(|buffer| parse_buffer(data, buffer))
            .collect::<Result<Vec<_>, _>>()?;

        let subgraphs = model
            .tables_field(field::model::SUBGRAPHS)?
            .iter()
            .map(|subgraph| parse_subgraph(subgraph, &buffers, &operator_codes))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            version,
            operator_codes = operator_codes.len(),
            subgraphs = subgraphs.len(),
            buffers = buffers.len(),
            "parsed TFLite model"
        );

        Ok(TFLiteModel {
            version,
            description,
            operator_codes,
            subgraphs,
            buffer_count: buffers.len(),
            size: data.len(),
            digest: sha256_hex(data),
        })
    }
}

impl Default for TFLiteParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_operator_code(table: &Table<'_>) -> Result<OperatorCode, LoadError> {
    use field::operator_code::*;

    // Codes above 127 only fit the int32 field; older files only set the
    // deprecated byte, so the larger of the two wins.
    let deprecated = table.u8_field(DEPRECATED_BUILTIN_CODE, 0)? as i8 as i32;
    let builtin = table.i32_field(BUILTIN_CODE, 0)?;

    Ok(OperatorCode {
        builtin_code: deprecated.max(builtin),
        custom_code: table.string_field(CUSTOM_CODE)?,
        version: table.i32_field(VERSION, 1)?,
    })
}

/// Resolve a buffer's payload, inline or at an offset into the file
fn parse_buffer(data: &[u8], table: &Table<'_>) -> Result<Arc<[u8]>, LoadError> {
    if let Some(bytes) = table.bytes_field(field::buffer::DATA)? {
        return Ok(Arc::from(bytes));
    }

    // Models over 2GB keep payloads after the FlatBuffer; offset 1 is a
    // placeholder written before the real offset is known.
    let offset = table.u64_field(field::buffer::OFFSET, 0)?;
    let size = table.u64_field(field::buffer::SIZE, 0)?;
    if offset > 1 && size > 0 {
        let offset = usize::try_from(offset)
            .map_err(|_| LoadError::Malformed("Buffer offset too large".into()))?;
        let size = usize::try_from(size)
            .map_err(|_| LoadError::Malformed("Buffer size too large".into()))?;
        return Ok(Arc::from(slice(data, offset, size)?));
    }

    Ok(Arc::from(Vec::new()))
}

fn parse_subgraph(
    table: &Table<'_>,
    buffers: &[Arc<[u8]>],
    operator_codes: &[OperatorCode],
) -> Result<SubGraph, LoadError> {
    use field::sub_graph::*;

    let tensors = table
        .tables_field(TENSORS)?
        .iter()
        .enumerate()
        .map(|(idx, tensor)| parse_tensor(tensor, buffers, idx))
        .collect::<Result<Vec<_>, _>>()?;

    let operators = table
        .tables_field(OPERATORS)?
        .iter()
        .map(|op| parse_operator(op, operator_codes))
        .collect::<Result<Vec<_>, _>>()?;

    let subgraph = SubGraph {
        name: table.string_field(NAME)?,
        tensors,
        inputs: table.i32_vector_field(INPUTS)?.unwrap_or_default(),
        outputs: table.i32_vector_field(OUTPUTS)?.unwrap_or_default(),
        operators,
    };

    debug!(
        name = subgraph.name.as_deref().unwrap_or(""),
        tensors = subgraph.tensors.len(),
        operators = subgraph.operators.len(),
        "parsed subgraph"
    );

    Ok(subgraph)
}

fn parse_tensor(
    table: &Table<'_>,
    buffers: &[Arc<[u8]>],
    tensor_idx: usize,
) -> Result<TFLiteTensor, LoadError> {
    use field::tensor::*;

    let type_val = table.u8_field(TYPE, 0)?;
    let dtype = TFLiteDataType::from_u8(type_val).ok_or_else(|| {
        LoadError::Malformed(format!(
            "Tensor {} has unknown type {}",
            tensor_idx, type_val
        ))
    })?;

    let buffer_index = table.u32_field(BUFFER, 0)?;
    let data = buffers
        .get(buffer_index as usize)
        .cloned()
        .unwrap_or_else(|| Arc::from(Vec::new()));

    let quantization = match table.table_field(QUANTIZATION)? {
        Some(q) => parse_quantization(&q)?,
        None => None,
    };

    Ok(TFLiteTensor {
        name: table
            .string_field(NAME)?
            .unwrap_or_else(|| format!("tensor_{}", tensor_idx)),
        shape: table.i32_vector_field(SHAPE)?.unwrap_or_default(),
        shape_signature: table.i32_vector_field(SHAPE_SIGNATURE)?,
        dtype,
        buffer_index,
        data,
        quantization,
    })
}

/// Quantization table; None when it carries no scales (float tensors often
/// have an empty one)
fn parse_quantization(table: &Table<'_>) -> Result<Option<QuantizationParams>, LoadError> {
    use field::quantization::*;

    let scale = table.f32_vector_field(SCALE)?.unwrap_or_default();
    if scale.is_empty() {
        return Ok(None);
    }

    Ok(Some(QuantizationParams {
        scale,
        zero_point: table.i64_vector_field(ZERO_POINT)?.unwrap_or_default(),
        quantized_dimension: table.i32_field(QUANTIZED_DIMENSION, 0)?,
    }))
}

fn parse_operator(
    table: &Table<'_>,
    operator_codes: &[OperatorCode],
) -> Result<TFLiteOperator, LoadError> {
    use field::operator::*;

    let opcode_index = table.u32_field(OPCODE_INDEX, 0)?;
    let code = operator_codes.get(opcode_index as usize).ok_or_else(|| {
        LoadError::Malformed(format!(
            "Operator references opcode {} of {}",
            opcode_index,
            operator_codes.len()
        ))
    })?;

    let options = Options {
        table: table.table_field(BUILTIN_OPTIONS)?,
        tag: table.u8_field(BUILTIN_OPTIONS_TYPE, options_type::NONE)?,
    };

    Ok(TFLiteOperator {
        opcode_index,
        inputs: table.i32_vector_field(INPUTS)?.unwrap_or_default(),
        outputs: table.i32_vector_field(OUTPUTS)?.unwrap_or_default(),
        options: options.decode(code.builtin_code)?,
    })
}

/// Union tag of the options table each decoded operator expects
fn expected_options_type(builtin_code: i32) -> Option<u8> {
    let tag = match builtin_code {
        builtin_op::CONV_2D => options_type::CONV_2D,
        builtin_op::DEPTHWISE_CONV_2D => options_type::DEPTHWISE_CONV_2D,
        builtin_op::AVERAGE_POOL_2D | builtin_op::MAX_POOL_2D => options_type::POOL_2D,
        builtin_op::FULLY_CONNECTED => options_type::FULLY_CONNECTED,
        builtin_op::SOFTMAX => options_type::SOFTMAX,
        builtin_op::CONCATENATION => options_type::CONCATENATION,
        builtin_op::ADD => options_type::ADD,
        builtin_op::SUB => options_type::SUB,
        builtin_op::MUL => options_type::MUL,
        builtin_op::DIV => options_type::DIV,
        builtin_op::RESHAPE => options_type::RESHAPE,
        builtin_op::MEAN => options_type::REDUCER,
        _ => return None,
    };
    Some(tag)
}

/// An operator's builtin options table and its union tag; absent fields
/// take schema defaults
struct Options<'a> {
    table: Option<Table<'a>>,
    tag: u8,
}

impl Options<'_> {
    fn u8(&self, field: u16, default: u8) -> Result<u8, LoadError> {
        self.table.map_or(Ok(default), |t| t.u8_field(field, default))
    }

    fn i32(&self, field: u16, default: i32) -> Result<i32, LoadError> {
        self.table.map_or(Ok(default), |t| t.i32_field(field, default))
    }

    fn f32(&self, field: u16, default: f32) -> Result<f32, LoadError> {
        self.table.map_or(Ok(default), |t| t.f32_field(field, default))
    }

    fn bool(&self, field: u16) -> Result<bool, LoadError> {
        self.table.map_or(Ok(false), |t| t.bool_field(field, false))
    }

    fn activation(&self, field: u16) -> Result<Activation, LoadError> {
        match self.u8(field, 0)? {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::ReluN1To1),
            3 => Ok(Activation::Relu6),
            4 => Ok(Activation::Tanh),
            5 => Ok(Activation::SignBit),
            other => Err(LoadError::Malformed(format!(
                "Unknown fused activation {}",
                other
            ))),
        }
    }

    fn padding(&self, field: u16) -> Result<Padding, LoadError> {
        match self.u8(field, 0)? {
            0 => Ok(Padding::Same),
            1 => Ok(Padding::Valid),
            other => Err(LoadError::Malformed(format!("Unknown padding {}", other))),
        }
    }

    // Strides and dilations default to 0 in the schema; runtimes treat that as 1.
    fn step(&self, field: u16) -> Result<i32, LoadError> {
        Ok(self.i32(field, 1)?.max(1))
    }

    fn decode(&self, builtin_code: i32) -> Result<BuiltinOptions, LoadError> {
        if let Some(expected) = expected_options_type(builtin_code) {
            if self.table.is_some() && self.tag != expected {
                return Err(LoadError::Malformed(format!(
                    "{} carries builtin options of type {}, expected {}",
                    schema::builtin_name(builtin_code),
                    self.tag,
                    expected
                )));
            }
        }

        let options = match builtin_code {
            builtin_op::CONV_2D => {
                use field::conv_2d::*;
                BuiltinOptions::Conv2d(ConvParams {
                    padding: self.padding(PADDING)?,
                    stride_h: self.step(STRIDE_H)?,
                    stride_w: self.step(STRIDE_W)?,
                    dilation_h: self.step(DILATION_H)?,
                    dilation_w: self.step(DILATION_W)?,
                    activation: self.activation(FUSED_ACTIVATION)?,
                })
            }
            builtin_op::DEPTHWISE_CONV_2D => {
                use field::depthwise_conv_2d::*;
                BuiltinOptions::DepthwiseConv2d {
                    params: ConvParams {
                        padding: self.padding(PADDING)?,
                        stride_h: self.step(STRIDE_H)?,
                        stride_w: self.step(STRIDE_W)?,
                        dilation_h: self.step(DILATION_H)?,
                        dilation_w: self.step(DILATION_W)?,
                        activation: self.activation(FUSED_ACTIVATION)?,
                    },
                    depth_multiplier: self.i32(DEPTH_MULTIPLIER, 0)?,
                }
            }
            builtin_op::AVERAGE_POOL_2D | builtin_op::MAX_POOL_2D => {
                use field::pool_2d::*;
                BuiltinOptions::Pool2d(PoolParams {
                    padding: self.padding(PADDING)?,
                    stride_h: self.step(STRIDE_H)?,
                    stride_w: self.step(STRIDE_W)?,
                    filter_h: self.i32(FILTER_H, 0)?,
                    filter_w: self.i32(FILTER_W, 0)?,
                    activation: self.activation(FUSED_ACTIVATION)?,
                })
            }
            builtin_op::FULLY_CONNECTED => {
                use field::fully_connected::*;
                BuiltinOptions::FullyConnected {
                    activation: self.activation(FUSED_ACTIVATION)?,
                    keep_num_dims: self.bool(KEEP_NUM_DIMS)?,
                    shuffled_weights: self.u8(WEIGHTS_FORMAT, 0)?
                        != schema::WEIGHTS_FORMAT_DEFAULT,
                }
            }
            builtin_op::SOFTMAX => BuiltinOptions::Softmax {
                beta: self.f32(field::softmax::BETA, 1.0)?,
            },
            builtin_op::CONCATENATION => BuiltinOptions::Concatenation {
                axis: self.i32(field::concatenation::AXIS, 0)?,
                activation: self.activation(field::concatenation::FUSED_ACTIVATION)?,
            },
            builtin_op::ADD | builtin_op::SUB | builtin_op::MUL | builtin_op::DIV => {
                BuiltinOptions::Arithmetic(self.activation(field::arithmetic::FUSED_ACTIVATION)?)
            }
            builtin_op::RESHAPE => BuiltinOptions::Reshape {
                new_shape: match self.table {
                    Some(t) => t
                        .i32_vector_field(field::reshape::NEW_SHAPE)?
                        .unwrap_or_default(),
                    None => Vec::new(),
                },
            },
            builtin_op::MEAN => BuiltinOptions::Reducer {
                keep_dims: self.bool(field::reducer::KEEP_DIMS)?,
            },
            _ => BuiltinOptions::None,
        };
        Ok(options)
    }
}
