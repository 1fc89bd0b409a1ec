//! Fuzz target for the ONNX verifier

#![no_main]

use graft_onnx::OnnxVerifier;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = OnnxVerifier::new().verify_bytes(data);
});
