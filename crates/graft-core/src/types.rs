//! Core data types for graft

use serde::Serialize;
use std::fmt;

/// Tensor element types understood by the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    // Float types
    Float32,
    Float16,
    Float64,
    // Integer types
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Int4,
    // Other
    Bool,
    String,
    Complex64,
    Complex128,
    Resource,
    Variant,
}

impl DataType {
    /// Check if this is a float type
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float16 | DataType::Float64
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Float64 => "float64",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Int4 => "int4",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Complex64 => "complex64",
            DataType::Complex128 => "complex128",
            DataType::Resource => "resource",
            DataType::Variant => "variant",
        };
        f.write_str(name)
    }
}

/// One dimension of a tensor shape
///
/// Serializes as the extent, or `null` when dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Dim {
    /// Statically known extent
    Fixed(i64),
    /// Extent only known at run time
    Dynamic,
}

impl Dim {
    /// Fixed extent, if known
    pub fn value(&self) -> Option<i64> {
        match self {
            Dim::Fixed(v) => Some(*v),
            Dim::Dynamic => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{}", v),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// Render a shape as `[1, 224, 224, 3]`
pub fn format_shape(shape: &[Dim]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

/// Affine quantization parameters
///
/// A single scale means per-tensor quantization; more than one means
/// per-channel along `quantized_dimension`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationParams {
    /// Scale factors
    pub scale: Vec<f32>,
    /// Zero points (same length as `scale`, or empty for all-zero)
    pub zero_point: Vec<i64>,
    /// Channel axis for per-channel quantization
    pub quantized_dimension: i32,
}

impl QuantizationParams {
    /// True when one scale covers the whole tensor
    pub fn is_per_tensor(&self) -> bool {
        self.scale.len() == 1
    }
}

/// Metadata for one tensor: the read-only view callers inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorDescriptor {
    /// Tensor index in the source graph
    pub index: usize,
    /// Tensor name
    pub name: String,
    /// Shape dimensions
    pub shape: Vec<Dim>,
    /// Element type
    pub dtype: DataType,
}

impl TensorDescriptor {
    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Fixed extent of dimension `axis`, if known
    pub fn dim(&self, axis: usize) -> Option<i64> {
        self.shape.get(axis).and_then(Dim::value)
    }

    /// All extents, if every dimension is fixed
    pub fn fixed_shape(&self) -> Option<Vec<i64>> {
        self.shape.iter().map(Dim::value).collect()
    }

    /// Element count, if every dimension is fixed
    pub fn num_elements(&self) -> Option<usize> {
        self.fixed_shape()
            .map(|dims| dims.iter().map(|&d| d.max(0) as usize).product())
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} '{}' {} {}",
            self.index,
            self.name,
            self.dtype,
            format_shape(&self.shape)
        )
    }
}
