//! Error types for graft
//!
//! Each pipeline stage has its own error enum; [`GraftError`] unifies them so
//! a caller can tell which stage failed from the variant alone.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a conversion run
#[derive(Debug, Error)]
pub enum GraftError {
    #[error("Model load error: {0}")]
    ModelLoad(#[from] LoadError),

    #[error("Unsupported topology: {0}")]
    UnsupportedTopology(#[from] TopologyError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact invalid: {0}")]
    ArtifactInvalid(#[from] VerifyError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors while loading a source model
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid file identifier (expected {expected:?}, found {found:?})")]
    InvalidIdentifier { expected: String, found: String },

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while reconstructing a graph from a loaded model
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Model has no subgraphs")]
    NoSubgraphs,

    #[error("Model declares no input tensors")]
    NoInputs,

    #[error("Model declares no output tensors")]
    NoOutputs,

    #[error("{context} references tensor {index}, but the graph has {count} tensors")]
    TensorOutOfRange {
        context: String,
        index: i64,
        count: usize,
    },

    #[error("Tensor {index} is listed more than once as a graph {role}")]
    DuplicateEndpoint { index: usize, role: &'static str },
}

/// Errors while lowering a graph to the target format
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unsupported operator {name} (code {code}) at node {node}")]
    UnsupportedOperator { name: String, code: i32, node: usize },

    #[error("Unsupported data type {dtype} for tensor '{tensor}'")]
    UnsupportedDataType { dtype: String, tensor: String },

    #[error("Unsupported fused activation {activation} at node {node}")]
    UnsupportedActivation { activation: String, node: usize },

    #[error("Quantized tensor '{tensor}' cannot be used by {op} at node {node}")]
    QuantizedOperand {
        tensor: String,
        op: &'static str,
        node: usize,
    },

    #[error("Shape mismatch at node {node}: {message}")]
    ShapeMismatch { node: usize, message: String },

    #[error("Missing operand {position} for {op} at node {node}")]
    MissingOperand {
        op: &'static str,
        position: usize,
        node: usize,
    },

    #[error("{op} at node {node} requires a constant {operand}")]
    NonConstantOperand {
        op: &'static str,
        operand: &'static str,
        node: usize,
    },

    #[error("Constant tensor '{tensor}' is invalid: {message}")]
    InvalidConstant { tensor: String, message: String },

    #[error("Tensor '{tensor}' is read by {consumer} before anything produces it")]
    UndefinedValue { tensor: String, consumer: String },

    #[error("Tensor '{tensor}' is produced more than once (again by node {node})")]
    DuplicateProducer { tensor: String, node: usize },

    #[error("{op_type} at opset {opset} does not accept {dtype} operand '{tensor}' (node {node})")]
    OperandType {
        op_type: &'static str,
        dtype: String,
        tensor: String,
        opset: i64,
        node: usize,
    },

    #[error("{op_type} at node {node} computes {computed}, but output '{tensor}' is {declared}")]
    OutputType {
        op_type: &'static str,
        computed: String,
        declared: String,
        tensor: String,
        node: usize,
    },

    #[error("Operands of {op_type} at node {node} mix {first} and {second}")]
    MixedOperandTypes {
        op_type: &'static str,
        first: String,
        second: String,
        node: usize,
    },

    #[error("Unsupported opset version: {0}")]
    UnsupportedOpset(i64),
}

/// Errors while verifying a written artifact
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Failed to decode model: {0}")]
    Decode(String),

    #[error("Invalid IR version: {0}")]
    InvalidIrVersion(i64),

    #[error("Model has no default-domain opset import")]
    MissingOpset,

    #[error("Model has no graph")]
    MissingGraph,

    #[error("Graph declares no outputs")]
    NoOutputs,

    #[error("Graph {role} '{name}' has no tensor type")]
    UntypedValue { role: &'static str, name: String },

    #[error("Node {node} ('{name}') is invalid: {message}")]
    InvalidNode {
        node: usize,
        name: String,
        message: String,
    },

    #[error("Graph output '{0}' is never produced")]
    DanglingOutput(String),

    #[error("Initializer '{name}' is invalid: {message}")]
    InvalidInitializer { name: String, message: String },

    #[error("Node {node} ('{name}') violates the {op_type} type constraints: {message}")]
    TypeConstraint {
        node: usize,
        name: String,
        op_type: String,
        message: String,
    },

    #[error("Inference session rejected the model: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the run configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Opset {opset} is outside the supported range {min}..={max}")]
    OpsetOutOfRange { opset: i64, min: i64, max: i64 },

    #[error("{0} path is empty")]
    EmptyPath(&'static str),

    #[error("Input and output paths are the same: {}", .0.display())]
    SamePaths(PathBuf),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
