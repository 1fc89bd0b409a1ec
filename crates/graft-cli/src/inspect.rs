//! `graft inspect` command implementation

use anyhow::{Context, Result};
use graft_core::{format_shape, GraftError, Graph};
use graft_tflite::{GraphReconstructor, TFLiteParser};
use std::path::Path;

fn to_json(graph: &Graph) -> serde_json::Value {
    serde_json::json!({
        "name": graph.name,
        "description": graph.description,
        "inputs": graph.input_descriptors(),
        "outputs": graph.output_descriptors(),
        "tensor_count": graph.tensors.len(),
        "constant_count": graph.constant_count(),
        "node_count": graph.nodes.len(),
        "operators": graph.op_histogram(),
        "metadata": graph.metadata,
    })
}

pub fn run(model: &Path, json_output: bool) -> Result<()> {
    let parsed = TFLiteParser::new()
        .load(model)
        .map_err(GraftError::from)
        .with_context(|| format!("Failed to load {}", model.display()))?;
    let graph = GraphReconstructor::new()
        .reconstruct(&parsed)
        .map_err(GraftError::from)
        .context("Failed to reconstruct the model graph")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&to_json(&graph))?);
        return Ok(());
    }

    println!("TFLite Model");
    println!("============");
    println!();
    println!("File:        {}", model.display());
    println!("Graph:       {}", graph.name);
    if let Some(description) = &graph.description {
        println!("Description: {}", description);
    }
    println!("Tensors:     {} ({} constant)", graph.tensors.len(), graph.constant_count());
    println!("Operators:   {}", graph.nodes.len());
    println!();

    println!("Inputs:");
    for descriptor in graph.input_descriptors() {
        println!(
            "  {:<24} {:<8} {}",
            descriptor.name,
            descriptor.dtype.to_string(),
            format_shape(&descriptor.shape)
        );
    }
    println!("Outputs:");
    for descriptor in graph.output_descriptors() {
        println!(
            "  {:<24} {:<8} {}",
            descriptor.name,
            descriptor.dtype.to_string(),
            format_shape(&descriptor.shape)
        );
    }

    println!();
    println!("Operator histogram:");
    for (op, count) in graph.op_histogram() {
        println!("  {:<24} {}", op, count);
    }

    Ok(())
}
