//! `graft verify` command implementation

use anyhow::{Context, Result};
use graft_onnx::{OnnxVerifier, ValueSummary};
use std::path::Path;

fn format_dims(dims: &[Option<i64>]) -> String {
    let dims: Vec<String> = dims
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |v| v.to_string()))
        .collect();
    format!("[{}]", dims.join(", "))
}

fn print_values(title: &str, values: &[ValueSummary]) {
    println!("{}:", title);
    for value in values {
        println!(
            "  {:<24} {:<8} {}",
            value.name,
            value.elem_type,
            format_dims(&value.dims)
        );
    }
}

pub fn run(model: &Path) -> Result<()> {
    let verified = OnnxVerifier::new()
        .verify_file(model)
        .with_context(|| format!("Failed to verify {}", model.display()))?;

    println!("ONNX model loaded successfully.");
    println!();
    println!("File:          {}", model.display());
    println!("Producer:      {}", verified.producer);
    println!("IR version:    {}", verified.ir_version);
    println!("Opset:         {}", verified.opset);
    println!("Nodes:         {}", verified.node_count);
    println!("Initializers:  {}", verified.initializer_count);
    println!(
        "Runtime:       {}",
        if verified.session_checked {
            "session loaded"
        } else {
            "not checked"
        }
    );
    println!();
    print_values("Inputs", &verified.inputs);
    print_values("Outputs", &verified.outputs);

    Ok(())
}
