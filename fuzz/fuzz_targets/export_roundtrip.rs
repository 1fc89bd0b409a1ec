//! Fuzz target for export followed by verification
//!
//! Any TFLite input that exports must produce a model the verifier accepts.

#![no_main]

use graft_onnx::{OnnxExporter, OnnxVerifier};
use graft_tflite::{GraphReconstructor, TFLiteParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(model) = TFLiteParser::new().parse(data) else {
        return;
    };
    let Ok(graph) = GraphReconstructor::new().reconstruct(&model) else {
        return;
    };
    if let Ok(onnx) = OnnxExporter::default().export(&graph) {
        let bytes = OnnxExporter::to_bytes(&onnx);
        if let Err(e) = OnnxVerifier::new().verify_bytes(&bytes) {
            panic!("exported model failed verification: {}", e);
        }
    }
});
