//! Conversion run configuration
//!
//! A [`ConvertConfig`] is assembled once at startup (defaults, then an
//! optional JSON file, then command-line overrides) and validated before any
//! pipeline stage runs.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default source model path
pub const DEFAULT_INPUT: &str = "model.tflite";
/// Default destination model path
pub const DEFAULT_OUTPUT: &str = "model.onnx";
/// Default ONNX operator-set version
pub const DEFAULT_OPSET: i64 = 13;
/// Lowest opset the exporter emits valid graphs for
pub const MIN_OPSET: i64 = 13;
/// Highest opset the exporter emits valid graphs for (ReduceMean moves axes
/// to an input at 18)
pub const MAX_OPSET: i64 = 17;

/// Settings for one conversion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvertConfig {
    /// Source TFLite model
    pub input: PathBuf,
    /// Destination ONNX model
    pub output: PathBuf,
    /// ONNX operator-set version to target
    pub opset: i64,
    /// Reload and check the written artifact
    pub verify: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT),
            output: PathBuf::from(DEFAULT_OUTPUT),
            opset: DEFAULT_OPSET,
            verify: true,
        }
    }
}

impl ConvertConfig {
    /// Load a config from a JSON file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a config from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Check the config before any stage runs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("Input"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("Output"));
        }
        if self.input == self.output {
            return Err(ConfigError::SamePaths(self.input.clone()));
        }
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset) {
            return Err(ConfigError::OpsetOutOfRange {
                opset: self.opset,
                min: MIN_OPSET,
                max: MAX_OPSET,
            });
        }
        Ok(())
    }
}
