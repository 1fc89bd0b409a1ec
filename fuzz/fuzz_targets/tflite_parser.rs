//! Fuzz target for the TFLite loader
//!
//! Parsing and graph reconstruction must reject malformed data with an
//! error, never a panic.

#![no_main]

use graft_tflite::{GraphReconstructor, TFLiteParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let parser = TFLiteParser::new();

    if let Ok(model) = parser.parse(data) {
        let _ = GraphReconstructor::new().reconstruct(&model);
    }
});
