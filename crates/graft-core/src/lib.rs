//! Graft Core - Shared primitives for model format conversion
//!
//! This crate provides the error taxonomy, tensor types, the in-memory
//! graph and the run configuration used by the format crates
//! (graft-tflite, graft-onnx).

pub mod config;
pub mod error;
pub mod graph;
pub mod hash;
pub mod types;

// Re-export commonly used types
pub use config::{ConvertConfig, DEFAULT_OPSET, MAX_OPSET, MIN_OPSET};
pub use error::{
    ConfigError, ConversionError, GraftError, LoadError, TopologyError, VerifyError,
};
pub use graph::{Activation, ConvParams, Graph, GraphTensor, Node, Op, Padding, PoolParams};
pub use hash::{sha256, sha256_hex};
pub use types::{format_shape, DataType, Dim, QuantizationParams, TensorDescriptor};
