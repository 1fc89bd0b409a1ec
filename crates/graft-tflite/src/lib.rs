//! Graft TFLite - TensorFlow Lite model loading
//!
//! This crate reads `.tflite` FlatBuffers into a [`TFLiteModel`] and
//! reconstructs the entry subgraph as a format-neutral [`graft_core::Graph`].

mod flatbuffer;
pub mod parser;
pub mod reconstruct;
pub mod schema;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

// Re-export main types
pub use parser::{
    BuiltinOptions, OperatorCode, SubGraph, TFLiteDataType, TFLiteModel, TFLiteOperator,
    TFLiteParser, TFLiteTensor,
};
pub use reconstruct::GraphReconstructor;

