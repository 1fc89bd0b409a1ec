//! `graft convert` command implementation

use anyhow::{Context, Result};
use graft_core::{ConfigError, ConvertConfig, GraftError};
use graft_onnx::{OnnxExporter, OnnxVerifier};
use graft_tflite::{GraphReconstructor, TFLiteParser};
use std::path::PathBuf;
use tracing::info;

/// Command-line overrides for a conversion run
#[derive(Debug, Default)]
pub struct ConvertArgs {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub opset: Option<i64>,
    pub config: Option<PathBuf>,
    pub no_verify: bool,
}

/// Defaults, then the config file, then flags; validated once
pub fn resolve_config(args: ConvertArgs) -> Result<ConvertConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => ConvertConfig::from_file(path)?,
        None => ConvertConfig::default(),
    };

    if let Some(input) = args.input {
        config.input = input;
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(opset) = args.opset {
        config.opset = opset;
    }
    if args.no_verify {
        config.verify = false;
    }

    config.validate()?;
    Ok(config)
}

pub fn run(args: ConvertArgs) -> Result<()> {
    let config = resolve_config(args)
        .map_err(GraftError::from)
        .context("Invalid configuration")?;
    info!(
        input = %config.input.display(),
        output = %config.output.display(),
        opset = config.opset,
        "starting conversion"
    );

    let model = TFLiteParser::new()
        .load(&config.input)
        .map_err(GraftError::from)
        .with_context(|| format!("Failed to load {}", config.input.display()))?;

    let graph = GraphReconstructor::new()
        .reconstruct(&model)
        .map_err(GraftError::from)
        .context("Failed to reconstruct the model graph")?;
    info!(
        nodes = graph.nodes.len(),
        inputs = graph.inputs.len(),
        outputs = graph.outputs.len(),
        "reconstructed graph"
    );

    let exporter = OnnxExporter::new(config.opset)
        .map_err(GraftError::from)
        .context("Failed to create the exporter")?;
    exporter
        .export_to_file(&graph, &config.output)
        .with_context(|| format!("Failed to convert to {}", config.output.display()))?;

    if config.verify {
        let verified = OnnxVerifier::new()
            .verify_file(&config.output)
            .map_err(GraftError::from)
            .with_context(|| format!("Failed to verify {}", config.output.display()))?;
        info!(
            nodes = verified.node_count,
            initializers = verified.initializer_count,
            "verified output"
        );
        println!("ONNX model loaded successfully.");
    }

    println!("Model conversion completed successfully.");
    Ok(())
}
