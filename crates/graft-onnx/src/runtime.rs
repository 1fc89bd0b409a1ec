//! ONNX Runtime session check

use crate::verify::{ValueSummary, VerifiedModel};
use graft_core::VerifyError;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::fmt::Display;
use tracing::debug;

fn rejected(err: impl Display) -> VerifyError {
    VerifyError::Session(err.to_string())
}

/// Load `bytes` into a CPU session and confirm it exposes the endpoints the
/// structural pass read from the graph
pub(crate) fn check_session(bytes: &[u8], verified: &VerifiedModel) -> Result<(), VerifyError> {
    // Optimizations stay off so the session sees the graph as written
    let session = Session::builder()
        .map_err(rejected)?
        .with_optimization_level(GraphOptimizationLevel::Disable)
        .map_err(rejected)?
        .commit_from_memory(bytes)
        .map_err(rejected)?;

    let inputs: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
    let outputs: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
    compare("inputs", &inputs, &verified.inputs)?;
    compare("outputs", &outputs, &verified.outputs)?;

    debug!(
        inputs = inputs.len(),
        outputs = outputs.len(),
        "inference session accepted model"
    );
    Ok(())
}

fn compare(role: &str, session: &[&str], graph: &[ValueSummary]) -> Result<(), VerifyError> {
    let expected: Vec<&str> = graph.iter().map(|v| v.name.as_str()).collect();
    if session != expected.as_slice() {
        return Err(VerifyError::Session(format!(
            "session {} {:?} differ from graph {} {:?}",
            role, session, role, expected
        )));
    }
    Ok(())
}
