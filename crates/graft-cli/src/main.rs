//! Graft CLI - Convert TensorFlow Lite models to ONNX

mod convert;
mod inspect;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graft")]
#[command(author, version, about = "Convert TensorFlow Lite models to ONNX")]
#[command(long_about = "Graft converts a TensorFlow Lite model to an ONNX model and checks the result.\n\nWith no command it converts model.tflite to model.onnx at opset 13.")]
struct Cli {
    /// Log filter, e.g. `info` or `graft_onnx=debug` (default: RUST_LOG, then `warn`)
    #[arg(long, global = true, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a TFLite model to ONNX
    Convert {
        /// Source TFLite model [default: model.tflite]
        input: Option<PathBuf>,

        /// Destination ONNX model [default: model.onnx]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// ONNX opset version (13-17) [default: 13]
        #[arg(long)]
        opset: Option<i64>,

        /// JSON config file; flags override its values
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Skip reloading and checking the written model
        #[arg(long)]
        no_verify: bool,
    },

    /// Show the graph reconstructed from a TFLite model
    Inspect {
        /// TFLite model file
        model: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that an ONNX file is well formed
    Verify {
        /// ONNX model file
        model: PathBuf,
    },
}

fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid log filter '{}'", directives))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref())?;

    match cli.command {
        None => convert::run(convert::ConvertArgs::default()),

        Some(Commands::Convert {
            input,
            output,
            opset,
            config,
            no_verify,
        }) => convert::run(convert::ConvertArgs {
            input,
            output,
            opset,
            config,
            no_verify,
        }),

        Some(Commands::Inspect { model, json }) => inspect::run(&model, json),

        Some(Commands::Verify { model }) => verify::run(&model),
    }
}
