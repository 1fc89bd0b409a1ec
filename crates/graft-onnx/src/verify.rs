//! ONNX artifact verification
//!
//! Re-reads a written model and checks that it is well formed. The structural
//! pass confirms it decodes, declares a default-domain opset, has typed graph
//! endpoints and defines every value before a node consumes it. The type pass
//! propagates element types through the graph against each operator's
//! constraints at the imported opset. With the `runtime` feature the bytes
//! are finally loaded into an ONNX Runtime session.

use crate::constraints::{self, OutputType};
use crate::proto::{tensor_shape_proto, GraphProto, ModelProto, ONNXDataType, ValueInfoProto};
use graft_core::VerifyError;
use prost::Message;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;

type Result<T> = std::result::Result<T, VerifyError>;

/// Name, element type and shape of a graph endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueSummary {
    pub name: String,
    /// ONNX element type name, e.g. `float`
    pub elem_type: String,
    /// Extents; symbolic dimensions are None
    pub dims: Vec<Option<i64>>,
}

impl ValueSummary {
    fn from_value_info(info: &ValueInfoProto) -> Option<Self> {
        let tensor = info.tensor_type()?;
        let elem_type = ONNXDataType::from_i32(tensor.elem_type)
            .filter(|t| *t != ONNXDataType::Undefined)?;
        let dims = tensor
            .shape
            .as_ref()
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|d| match d.value {
                        Some(tensor_shape_proto::dimension::Value::DimValue(v)) => Some(v),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name: info.name.clone(),
            elem_type: elem_type.name().to_string(),
            dims,
        })
    }
}

/// What a successful verification saw
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedModel {
    pub ir_version: i64,
    pub opset: i64,
    pub producer: String,
    pub inputs: Vec<ValueSummary>,
    pub outputs: Vec<ValueSummary>,
    pub node_count: usize,
    pub initializer_count: usize,
    /// Whether an inference session accepted the model
    pub session_checked: bool,
}

/// Checker for written ONNX files
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxVerifier;

impl OnnxVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Read and verify the model at `path`
    pub fn verify_file(&self, path: &Path) -> Result<VerifiedModel> {
        let bytes = fs::read(path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "verifying ONNX model");
        self.verify_bytes(&bytes)
    }

    /// Verify serialized model bytes, then open them in an inference
    /// session when the `runtime` feature is enabled
    pub fn verify_bytes(&self, bytes: &[u8]) -> Result<VerifiedModel> {
        let model = ModelProto::decode(bytes).map_err(|e| VerifyError::Decode(e.to_string()))?;
        #[allow(unused_mut)]
        let mut verified = self.verify_model(&model)?;

        #[cfg(feature = "runtime")]
        {
            crate::runtime::check_session(bytes, &verified)?;
            verified.session_checked = true;
        }

        Ok(verified)
    }

    /// Structural and type checks of a decoded model

    pub fn verify_model(&self, model: &ModelProto) -> Result<VerifiedModel> {
        if model.ir_version <= 0 {
            return Err(VerifyError::InvalidIrVersion(model.ir_version));
        }

        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
            .ok_or(VerifyError::MissingOpset)?;

        let graph = model.graph.as_ref().ok_or(VerifyError::MissingGraph)?;
        if graph.output.is_empty() {
            return Err(VerifyError::NoOutputs);
        }

        let inputs = summarize(&graph.input, "input")?;
        let outputs = summarize(&graph.output, "output")?;

        check_initializers(graph)?;
        check_nodes(graph, &model.opset_import)?;
        check_types(graph, opset)?;

        Ok(VerifiedModel {
            ir_version: model.ir_version,
            opset,
            producer: model.producer_name.clone(),
            inputs,
            outputs,
            node_count: graph.node.len(),
            initializer_count: graph.initializer.len(),
            session_checked: false,
        })
    }
}

fn summarize(values: &[ValueInfoProto], role: &'static str) -> Result<Vec<ValueSummary>> {
    values
        .iter()
        .map(|info| {
            ValueSummary::from_value_info(info).ok_or_else(|| VerifyError::UntypedValue {
                role,
                name: info.name.clone(),
            })
        })
        .collect()
}

fn check_initializers(graph: &GraphProto) -> Result<()> {
    let mut names = HashSet::new();
    for tensor in &graph.initializer {
        let invalid = |message: String| VerifyError::InvalidInitializer {
            name: tensor.name.clone(),
            message,
        };

        if tensor.name.is_empty() {
            return Err(invalid("initializer has no name".to_string()));
        }
        if !names.insert(tensor.name.as_str()) {
            return Err(invalid("name is defined twice".to_string()));
        }

        let dtype = ONNXDataType::from_i32(tensor.data_type)
            .filter(|t| *t != ONNXDataType::Undefined)
            .ok_or_else(|| invalid(format!("unknown data type {}", tensor.data_type)))?;
        if tensor.dims.iter().any(|&d| d < 0) {
            return Err(invalid(format!("negative dimension in {:?}", tensor.dims)));
        }
        let count = tensor
            .dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
            .ok_or_else(|| invalid("element count overflows".to_string()))?;

        if !tensor.raw_data.is_empty() {
            let elem_size = dtype
                .element_size()
                .ok_or_else(|| invalid(format!("{} cannot be stored raw", dtype.name())))?;
            let expected = count.saturating_mul(elem_size);
            if tensor.raw_data.len() != expected {
                return Err(invalid(format!(
                    "raw payload is {} bytes, dims {:?} need {}",
                    tensor.raw_data.len(),
                    tensor.dims,
                    expected
                )));
            }
        } else if tensor.typed_len() != count {
            return Err(invalid(format!(
                "holds {} elements, dims {:?} need {}",
                tensor.typed_len(),
                tensor.dims,
                count
            )));
        }
    }
    Ok(())
}

fn check_nodes(graph: &GraphProto, opsets: &[crate::proto::OperatorSetIdProto]) -> Result<()> {
    let mut defined: HashSet<&str> = graph
        .input
        .iter()
        .map(|v| v.name.as_str())
        .chain(graph.initializer.iter().map(|t| t.name.as_str()))
        .collect();

    for (index, node) in graph.node.iter().enumerate() {
        let invalid = |message: String| VerifyError::InvalidNode {
            node: index,
            name: node.name.clone(),
            message,
        };

        if node.op_type.is_empty() {
            return Err(invalid("node has no op_type".to_string()));
        }
        let known_domain = node.domain.is_empty()
            || node.domain == "ai.onnx"
            || opsets.iter().any(|o| o.domain == node.domain);
        if !known_domain {
            return Err(invalid(format!(
                "domain '{}' has no opset import",
                node.domain
            )));
        }

        // Empty names mark omitted optional inputs
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(invalid(format!(
                    "{} input '{}' is not defined before use",
                    node.op_type, input
                )));
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output.as_str()) {
                return Err(invalid(format!("output '{}' is assigned twice", output)));
            }
        }
    }

    for output in &graph.output {
        if !defined.contains(output.name.as_str()) {
            return Err(VerifyError::DanglingOutput(output.name.clone()));
        }
    }
    Ok(())
}

fn elem_type(info: &ValueInfoProto) -> Option<ONNXDataType> {
    let tensor = info.tensor_type()?;
    ONNXDataType::from_i32(tensor.elem_type).filter(|t| *t != ONNXDataType::Undefined)
}

/// Propagate element types from inputs and initializers through every
/// default-domain node, checking each against its operator's constraint
fn check_types(graph: &GraphProto, opset: i64) -> Result<()> {
    let declared: HashMap<&str, ONNXDataType> = graph
        .input
        .iter()
        .chain(&graph.value_info)
        .chain(&graph.output)
        .filter_map(|info| Some((info.name.as_str(), elem_type(info)?)))
        .collect();

    let mut known = declared.clone();
    for tensor in &graph.initializer {
        if let Some(dtype) = ONNXDataType::from_i32(tensor.data_type) {
            known.insert(tensor.name.as_str(), dtype);
        }
    }

    for (index, node) in graph.node.iter().enumerate() {
        if !(node.domain.is_empty() || node.domain == "ai.onnx") {
            continue;
        }
        let Some(constraint) = constraints::constraint(&node.op_type, opset) else {
            continue;
        };
        let violation = |message: String| VerifyError::TypeConstraint {
            node: index,
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            message,
        };

        let mut bound: Option<ONNXDataType> = None;
        for (position, input) in node.input.iter().enumerate() {
            let Some(&dtype) = known.get(input.as_str()) else {
                continue;
            };
            if let Some(fixed) = constraint.fixed_type(position) {
                if dtype != fixed {
                    return Err(violation(format!(
                        "input {} '{}' is {}, expected {}",
                        position,
                        input,
                        dtype.name(),
                        fixed.name()
                    )));
                }
                continue;
            }
            if !constraint.binds(position) {
                continue;
            }
            if !constraint.accepts(dtype) {
                return Err(violation(format!(
                    "input {} '{}' has unsupported type {} at opset {}",
                    position,
                    input,
                    dtype.name(),
                    opset
                )));
            }
            match bound {
                Some(first) if first != dtype => {
                    return Err(violation(format!(
                        "input {} '{}' is {} but an earlier operand is {}",
                        position,
                        input,
                        dtype.name(),
                        first.name()
                    )))
                }
                Some(_) => {}
                None => bound = Some(dtype),
            }
        }

        let produced = match constraint.output {
            OutputType::Bound => bound,
            OutputType::Fixed(dtype) => Some(dtype),
            OutputType::CastTarget => node
                .attribute
                .iter()
                .find(|a| a.name == "to")
                .and_then(|a| i32::try_from(a.i).ok())
                .and_then(ONNXDataType::from_i32),
        };
        if let (Some(produced), Some(output)) = (produced, node.output.first()) {
            if let Some(&expected) = declared.get(output.as_str()) {
                if expected != produced {
                    return Err(violation(format!(
                        "output '{}' is declared {} but computed as {}",
                        output,
                        expected.name(),
                        produced.name()
                    )));
                }
            }
            known.insert(output.as_str(), produced);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        type_proto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    };

    fn typed(name: &str, dims: &[i64]) -> ValueInfoProto {
        typed_as(name, dims, ONNXDataType::Float)
    }

    fn typed_as(name: &str, dims: &[i64], dtype: ONNXDataType) -> ValueInfoProto {
        ValueInfoProto {
            name: name.into(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: dtype as i32,
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|&d| tensor_shape_proto::Dimension {
                                value: Some(if d < 0 {
                                    tensor_shape_proto::dimension::Value::DimParam("n".into())
                                } else {
                                    tensor_shape_proto::dimension::Value::DimValue(d)
                                }),
                                ..Default::default()
                            })
                            .collect(),
                    }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn relu_model() -> ModelProto {
        ModelProto {
            ir_version: 7,
            producer_name: "graft".into(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            graph: Some(GraphProto {
                name: "g".into(),
                node: vec![NodeProto {
                    input: vec!["x".into()],
                    output: vec!["y".into()],
                    op_type: "Relu".into(),
                    name: "Relu_0".into(),
                    ..Default::default()
                }],
                input: vec![typed("x", &[-1, 4])],
                output: vec![typed("y", &[-1, 4])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_model() {
        let bytes = relu_model().encode_to_vec();
        let verified = OnnxVerifier::new().verify_bytes(&bytes).unwrap();
        assert_eq!(verified.ir_version, 7);
        assert_eq!(verified.opset, 13);
        assert_eq!(verified.producer, "graft");
        assert_eq!(verified.node_count, 1);
        assert_eq!(verified.inputs[0].elem_type, "float");
        assert_eq!(verified.inputs[0].dims, vec![None, Some(4)]);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let err = OnnxVerifier::new()
            .verify_bytes(&[0xff, 0xff, 0xff, 0xff])
            .unwrap_err();
        assert!(matches!(err, VerifyError::Decode(_)));
    }

    #[test]
    fn test_missing_opset() {
        let mut model = relu_model();
        model.opset_import.clear();
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::MissingOpset));
    }

    #[test]
    fn test_zero_ir_version() {
        let mut model = relu_model();
        model.ir_version = 0;
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidIrVersion(0)));
    }

    #[test]
    fn test_undefined_node_input() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().node[0].input = vec!["missing".into()];
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidNode { node: 0, .. }));
    }

    #[test]
    fn test_dangling_output() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().output = vec![typed("z", &[1])];
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::DanglingOutput(ref name) if name == "z"));
    }

    #[test]
    fn test_untyped_output() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().output[0].r#type = None;
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::UntypedValue { role: "output", .. }));
    }

    #[test]
    fn test_initializer_size_mismatch() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().initializer.push(TensorProto {
            name: "w".into(),
            dims: vec![2, 2],
            data_type: ONNXDataType::Float as i32,
            raw_data: vec![0; 12],
            ..Default::default()
        });
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidInitializer { ref name, .. } if name == "w"));
    }

    #[test]
    fn test_initializer_feeds_node() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        graph.initializer.push(TensorProto {
            name: "bias".into(),
            dims: vec![4],
            data_type: ONNXDataType::Float as i32,
            float_data: vec![0.0; 4],
            ..Default::default()
        });
        graph.node.push(NodeProto {
            input: vec!["y".into(), "bias".into()],
            output: vec!["z".into()],
            op_type: "Add".into(),
            ..Default::default()
        });
        graph.output = vec![typed("z", &[-1, 4])];

        let verified = OnnxVerifier::new().verify_model(&model).unwrap();
        assert_eq!(verified.node_count, 2);
        assert_eq!(verified.initializer_count, 1);
    }

    #[test]
    fn test_output_assigned_twice() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        let duplicate = graph.node[0].clone();
        graph.node.push(duplicate);
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidNode { node: 1, .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = OnnxVerifier::new()
            .verify_file(Path::new("/nonexistent/model.onnx"))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Io(_)));
    }

    #[test]
    fn test_integer_relu_violates_opset_13() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        graph.input = vec![typed_as("x", &[1, 4], ONNXDataType::Int32)];
        graph.output = vec![typed_as("y", &[1, 4], ONNXDataType::Int32)];

        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::TypeConstraint { node: 0, ref op_type, .. } if op_type == "Relu"
        ));

        model.opset_import[0].version = 14;
        assert!(OnnxVerifier::new().verify_model(&model).is_ok());
    }

    #[test]
    fn test_clip_bounds_must_match_input() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        graph.initializer = vec![
            TensorProto {
                name: "lo".into(),
                data_type: ONNXDataType::Float as i32,
                raw_data: 0f32.to_le_bytes().to_vec(),
                ..Default::default()
            },
            TensorProto {
                name: "hi".into(),
                data_type: ONNXDataType::Float as i32,
                raw_data: 6f32.to_le_bytes().to_vec(),
                ..Default::default()
            },
        ];
        graph.node[0].op_type = "Clip".into();
        graph.node[0].input = vec!["x".into(), "lo".into(), "hi".into()];
        graph.input = vec![typed_as("x", &[1, 4], ONNXDataType::Int8)];
        graph.output = vec![typed_as("y", &[1, 4], ONNXDataType::Int8)];

        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(
            matches!(err, VerifyError::TypeConstraint { ref message, .. } if message.contains("'lo'"))
        );
    }

    #[test]
    fn test_declared_output_type_is_checked() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().output = vec![typed_as("y", &[1, 4], ONNXDataType::Double)];
        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::TypeConstraint { ref message, .. } if message.contains("declared")));
    }

    #[test]
    fn test_reshape_shape_must_be_int64() {
        let mut model = relu_model();
        let graph = model.graph.as_mut().unwrap();
        graph.initializer.push(TensorProto {
            name: "shape".into(),
            dims: vec![2],
            data_type: ONNXDataType::Int32 as i32,
            int32_data: vec![4, 1],
            ..Default::default()
        });
        graph.node[0].op_type = "Reshape".into();
        graph.node[0].input = vec!["x".into(), "shape".into()];
        graph.input = vec![typed("x", &[1, 4])];
        graph.output = vec![typed("y", &[4, 1])];

        let err = OnnxVerifier::new().verify_model(&model).unwrap_err();
        assert!(matches!(err, VerifyError::TypeConstraint { ref message, .. } if message.contains("int64")));
    }

    #[cfg(not(feature = "runtime"))]
    #[test]
    fn test_session_skipped_without_runtime() {
        let bytes = relu_model().encode_to_vec();
        let verified = OnnxVerifier::new().verify_bytes(&bytes).unwrap();
        assert!(!verified.session_checked);
    }
}
