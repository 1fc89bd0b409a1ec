//! End-to-end conversion tests: synthetic TFLite in, verified ONNX out

use graft_core::{ConversionError, GraftError};
use graft_onnx::proto::{tensor_shape_proto::dimension::Value as DimValue, ModelProto};
use graft_onnx::{OnnxExporter, OnnxVerifier};
use graft_tflite::fixtures::{self, FixtureOptions, ModelBuilder};
use graft_tflite::schema::builtin_op;
use graft_tflite::{GraphReconstructor, TFLiteDataType, TFLiteParser};
use tempfile::TempDir;

fn graph_of(data: &[u8]) -> graft_core::Graph {
    let model = TFLiteParser::new().parse(data).unwrap();
    GraphReconstructor::new().reconstruct(&model).unwrap()
}

fn op_types(model: &ModelProto) -> Vec<&str> {
    model
        .graph
        .as_ref()
        .unwrap()
        .node
        .iter()
        .map(|n| n.op_type.as_str())
        .collect()
}

#[test]
fn test_classifier_converts_and_verifies() {
    let data = fixtures::single_io_classifier();
    let graph = graph_of(&data);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("classifier.onnx");
    let model = OnnxExporter::default().export_to_file(&graph, &path).unwrap();

    assert_eq!(
        op_types(&model),
        ["Transpose", "Conv", "Transpose", "Clip", "ReduceMean", "Gemm", "Softmax"]
    );

    let verified = OnnxVerifier::new().verify_file(&path).unwrap();
    assert_eq!(verified.ir_version, 7);
    assert_eq!(verified.opset, 13);
    assert_eq!(verified.producer, "graft");
    assert_eq!(verified.inputs.len(), 1);
    assert_eq!(verified.inputs[0].name, "input");
    assert_eq!(verified.inputs[0].elem_type, "float");
    assert_eq!(
        verified.inputs[0].dims,
        vec![Some(1), Some(224), Some(224), Some(3)]
    );
    assert_eq!(verified.outputs[0].name, "output");
    assert_eq!(verified.outputs[0].dims, vec![Some(1), Some(1000)]);
}

#[test]
fn test_metadata_records_source_digest() {
    let data = fixtures::single_io_classifier();
    let model = OnnxExporter::default().export(&graph_of(&data)).unwrap();

    let digest = model
        .metadata_props
        .iter()
        .find(|p| p.key == "source_sha256")
        .map(|p| p.value.as_str());
    assert_eq!(digest, Some(graft_core::sha256_hex(&data).as_str()));
    assert_eq!(
        model.graph.as_ref().unwrap().doc_string,
        "graft fixture classifier"
    );
}

#[test]
fn test_multiple_endpoints_keep_their_order() {
    let graph = graph_of(&fixtures::two_input_add());
    let model = OnnxExporter::default().export(&graph).unwrap();
    let bytes = OnnxExporter::to_bytes(&model);

    let verified = OnnxVerifier::new().verify_bytes(&bytes).unwrap();
    let inputs: Vec<_> = verified.inputs.iter().map(|v| v.name.as_str()).collect();
    let outputs: Vec<_> = verified.outputs.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(inputs, ["lhs", "rhs"]);
    assert_eq!(outputs, ["sum", "product"]);
    assert_eq!(op_types(&model), ["Add", "Relu", "Mul"]);
}

#[test]
fn test_higher_opset_raises_ir_version() {
    let graph = graph_of(&fixtures::two_input_add());
    let model = OnnxExporter::new(17).unwrap().export(&graph).unwrap();
    let verified = OnnxVerifier::new()
        .verify_bytes(&OnnxExporter::to_bytes(&model))
        .unwrap();
    assert_eq!(verified.opset, 17);
    assert_eq!(verified.ir_version, 8);
}

#[test]
fn test_dynamic_batch_becomes_dim_param() {
    let mut b = ModelBuilder::new();
    let x = b.dynamic_tensor("x", &[1, 16], &[-1, 16]);
    let y = b.dynamic_tensor("y", &[1, 16], &[-1, 16]);
    b.operator(builtin_op::LOGISTIC, &[x], &[y], FixtureOptions::None)
        .inputs(&[x])
        .outputs(&[y]);
    let model = OnnxExporter::default().export(&graph_of(&b.build())).unwrap();

    let graph = model.graph.as_ref().unwrap();
    let dims = &graph.input[0].tensor_type().unwrap().shape.as_ref().unwrap().dim;
    assert_eq!(dims[0].value, Some(DimValue::DimParam("x_dim0".into())));
    assert_eq!(dims[1].value, Some(DimValue::DimValue(16)));
    assert_eq!(graph.node[0].op_type, "Sigmoid");

    let verified = OnnxVerifier::new().verify_model(&model).unwrap();
    assert_eq!(verified.outputs[0].dims, vec![None, Some(16)]);
}

#[test]
fn test_depthwise_and_pool_chain() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 8, 8, 4], TFLiteDataType::Float32);
    let w = b.constant_f32("dw/weights", &[1, 3, 3, 4], &vec![0.1; 36]);
    let conv = b.tensor("dw/output", &[1, 8, 8, 4], TFLiteDataType::Float32);
    let pooled = b.tensor("pool/output", &[1, 4, 4, 4], TFLiteDataType::Float32);
    let flat = b.tensor("flat", &[1, 64], TFLiteDataType::Float32);
    b.operator(
        builtin_op::DEPTHWISE_CONV_2D,
        &[x, w, -1],
        &[conv],
        FixtureOptions::DepthwiseConv2d {
            padding: 0,
            stride_w: 1,
            stride_h: 1,
            depth_multiplier: 1,
            activation: 1,
        },
    )
    .operator(
        builtin_op::MAX_POOL_2D,
        &[conv],
        &[pooled],
        FixtureOptions::Pool2d {
            padding: 1,
            stride_w: 2,
            stride_h: 2,
            filter_w: 2,
            filter_h: 2,
            activation: 0,
        },
    )
    .operator(
        builtin_op::RESHAPE,
        &[pooled],
        &[flat],
        FixtureOptions::Reshape {
            new_shape: vec![1, 64],
        },
    )
    .inputs(&[x])
    .outputs(&[flat]);

    let model = OnnxExporter::default().export(&graph_of(&b.build())).unwrap();
    assert_eq!(
        op_types(&model),
        [
            "Transpose",
            "Conv",
            "Transpose",
            "Relu",
            "Transpose",
            "MaxPool",
            "Transpose",
            "Reshape"
        ]
    );
    OnnxVerifier::new().verify_model(&model).unwrap();
}

#[test]
fn test_dequantized_weights_feed_fully_connected() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 4], TFLiteDataType::Float32);
    let wq = b.quantized_constant(
        "fc/weights_quant",
        &[2, 4],
        TFLiteDataType::Int8,
        vec![1, 2, 3, 4, 5, 6, 7, 8],
        vec![0.5, 0.25],
        vec![0, 0],
        0,
    );
    let w = b.tensor("fc/weights", &[2, 4], TFLiteDataType::Float32);
    let y = b.tensor("y", &[1, 2], TFLiteDataType::Float32);
    b.operator(builtin_op::DEQUANTIZE, &[wq], &[w], FixtureOptions::None)
        .operator(
            builtin_op::FULLY_CONNECTED,
            &[x, w, -1],
            &[y],
            FixtureOptions::FullyConnected {
                activation: 0,
                keep_num_dims: false,
            },
        )
        .inputs(&[x])
        .outputs(&[y]);

    let model = OnnxExporter::default().export(&graph_of(&b.build())).unwrap();
    assert_eq!(op_types(&model), ["DequantizeLinear", "Gemm"]);
    OnnxVerifier::new().verify_model(&model).unwrap();
}

#[test]
fn test_quantized_operand_is_rejected() {
    let mut b = ModelBuilder::new();
    let x = b.quantized_tensor("x", &[1, 4], TFLiteDataType::UInt8, 0.1, 128);
    let y = b.quantized_tensor("y", &[1, 4], TFLiteDataType::UInt8, 0.1, 128);
    b.operator(builtin_op::RELU, &[x], &[y], FixtureOptions::None)
        .inputs(&[x])
        .outputs(&[y]);

    let err = OnnxExporter::default()
        .export(&graph_of(&b.build()))
        .unwrap_err();
    assert!(matches!(
        err,
        ConversionError::QuantizedOperand { ref tensor, op: "RELU", node: 0 } if tensor == "x"
    ));
}

#[test]
fn test_unsupported_operator_writes_nothing() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 4], TFLiteDataType::Float32);
    let y = b.tensor("y", &[1, 4], TFLiteDataType::Float32);
    b.custom_operator("MyCustomOp", &[x], &[y])
        .inputs(&[x])
        .outputs(&[y]);
    let graph = graph_of(&b.build());

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.onnx");
    let err = OnnxExporter::default()
        .export_to_file(&graph, &path)
        .unwrap_err();

    assert!(matches!(
        err,
        GraftError::Conversion(ConversionError::UnsupportedOperator { ref name, .. })
            if name == "MyCustomOp"
    ));
    assert!(!path.exists());
}

#[test]
fn test_sign_bit_activation_is_rejected() {
    let mut b = ModelBuilder::new();
    let lhs = b.tensor("lhs", &[1, 4], TFLiteDataType::Float32);
    let rhs = b.tensor("rhs", &[1, 4], TFLiteDataType::Float32);
    let out = b.tensor("out", &[1, 4], TFLiteDataType::Float32);
    b.operator(
        builtin_op::SUB,
        &[lhs, rhs],
        &[out],
        FixtureOptions::Arithmetic { activation: 5 },
    )
    .inputs(&[lhs, rhs])
    .outputs(&[out]);

    let err = OnnxExporter::default()
        .export(&graph_of(&b.build()))
        .unwrap_err();
    assert!(matches!(
        err,
        ConversionError::UnsupportedActivation { ref activation, node: 0 } if activation == "SIGN_BIT"
    ));
}

#[test]
fn test_reshape_to_scalar_with_empty_shape_constant() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 1], TFLiteDataType::Float32);
    let shape = b.constant_i32("shape", &[0], &[]);
    let y = b.tensor("y", &[], TFLiteDataType::Float32);
    b.operator(builtin_op::RESHAPE, &[x, shape], &[y], FixtureOptions::None)
        .inputs(&[x])
        .outputs(&[y]);

    let model = OnnxExporter::default().export(&graph_of(&b.build())).unwrap();
    assert_eq!(op_types(&model), ["Reshape"]);

    let graph = model.graph.as_ref().unwrap();
    let target = &graph.initializer[0];
    assert_eq!(target.dims, vec![0]);
    assert!(target.raw_data.is_empty());

    let verified = OnnxVerifier::new()
        .verify_bytes(&OnnxExporter::to_bytes(&model))
        .unwrap();
    assert!(verified.outputs[0].dims.is_empty());
}

#[test]
fn test_integer_relu_follows_opset() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 4], TFLiteDataType::Int32);
    let y = b.tensor("y", &[1, 4], TFLiteDataType::Int32);
    b.operator(builtin_op::RELU, &[x], &[y], FixtureOptions::None)
        .inputs(&[x])
        .outputs(&[y]);
    let graph = graph_of(&b.build());

    let err = OnnxExporter::default().export(&graph).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Relu at opset 13 does not accept int32 operand 'x' (node 0)"
    );

    let model = OnnxExporter::new(14).unwrap().export(&graph).unwrap();
    let verified = OnnxVerifier::new().verify_model(&model).unwrap();
    assert_eq!(verified.inputs[0].elem_type, "int32");
}

#[test]
fn test_integer_relu6_verifies() {
    let mut b = ModelBuilder::new();
    let x = b.tensor("x", &[1, 4], TFLiteDataType::Int8);
    let y = b.tensor("y", &[1, 4], TFLiteDataType::Int8);
    b.operator(builtin_op::RELU6, &[x], &[y], FixtureOptions::None)
        .inputs(&[x])
        .outputs(&[y]);

    let model = OnnxExporter::default().export(&graph_of(&b.build())).unwrap();
    assert_eq!(op_types(&model), ["Clip"]);
    OnnxVerifier::new().verify_model(&model).unwrap();
}
