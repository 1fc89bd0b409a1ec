//! Graft ONNX - ONNX export and verification
//!
//! This crate lowers a [`graft_core::Graph`] to an ONNX model at a chosen
//! default-domain opset and checks written `.onnx` files for structural and
//! element type validity. The `runtime` feature additionally loads each
//! verified model into an ONNX Runtime session.
//!
//! # Example
//!
//! ```ignore
//! use graft_onnx::{OnnxExporter, OnnxVerifier};
//!
//! let exporter = OnnxExporter::new(13)?;
//! exporter.export_to_file(&graph, Path::new("model.onnx"))?;
//!
//! let verified = OnnxVerifier::new().verify_file(Path::new("model.onnx"))?;
//! println!("{} nodes", verified.node_count);
//! ```

pub mod constraints;
pub mod export;
pub mod layout;
pub mod proto;
#[cfg(feature = "runtime")]
mod runtime;
pub mod verify;

pub use export::{ir_version_for_opset, OnnxExporter, PRODUCER_NAME};
pub use proto::{ModelProto, ONNXDataType};
pub use verify::{OnnxVerifier, ValueSummary, VerifiedModel};
