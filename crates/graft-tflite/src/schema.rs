//! TFLite schema constants
//!
//! Field slots, operator codes and union tags from the TFLite FlatBuffer
//! schema. Only what the loader and fixtures touch is listed.

/// File identifier stored at byte offset 4
pub const FILE_IDENTIFIER: &[u8; 4] = b"TFL3";

/// Vtable offset of field number `field`
pub const fn voffset(field: u16) -> u16 {
    4 + 2 * field
}

/// Field numbers per table
pub mod field {
    pub mod model {
        pub const VERSION: u16 = 0;
        pub const OPERATOR_CODES: u16 = 1;
        pub const SUBGRAPHS: u16 = 2;
        pub const DESCRIPTION: u16 = 3;
        pub const BUFFERS: u16 = 4;
    }

    pub mod operator_code {
        pub const DEPRECATED_BUILTIN_CODE: u16 = 0;
        pub const CUSTOM_CODE: u16 = 1;
        pub const VERSION: u16 = 2;
        pub const BUILTIN_CODE: u16 = 3;
    }

    pub mod sub_graph {
        pub const TENSORS: u16 = 0;
        pub const INPUTS: u16 = 1;
        pub const OUTPUTS: u16 = 2;
        pub const OPERATORS: u16 = 3;
        pub const NAME: u16 = 4;
    }

    pub mod tensor {
        pub const SHAPE: u16 = 0;
        pub const TYPE: u16 = 1;
        pub const BUFFER: u16 = 2;
        pub const NAME: u16 = 3;
        pub const QUANTIZATION: u16 = 4;
        pub const SHAPE_SIGNATURE: u16 = 7;
    }

    pub mod quantization {
        pub const SCALE: u16 = 2;
        pub const ZERO_POINT: u16 = 3;
        pub const QUANTIZED_DIMENSION: u16 = 6;
    }

    pub mod operator {
        pub const OPCODE_INDEX: u16 = 0;
        pub const INPUTS: u16 = 1;
        pub const OUTPUTS: u16 = 2;
        pub const BUILTIN_OPTIONS_TYPE: u16 = 3;
        pub const BUILTIN_OPTIONS: u16 = 4;
    }

    pub mod buffer {
        pub const DATA: u16 = 0;
        pub const OFFSET: u16 = 1;
        pub const SIZE: u16 = 2;
    }

    pub mod conv_2d {
        pub const PADDING: u16 = 0;
        pub const STRIDE_W: u16 = 1;
        pub const STRIDE_H: u16 = 2;
        pub const FUSED_ACTIVATION: u16 = 3;
        pub const DILATION_W: u16 = 4;
        pub const DILATION_H: u16 = 5;
    }

    pub mod depthwise_conv_2d {
        pub const PADDING: u16 = 0;
        pub const STRIDE_W: u16 = 1;
        pub const STRIDE_H: u16 = 2;
        pub const DEPTH_MULTIPLIER: u16 = 3;
        pub const FUSED_ACTIVATION: u16 = 4;
        pub const DILATION_W: u16 = 5;
        pub const DILATION_H: u16 = 6;
    }

    pub mod pool_2d {
        pub const PADDING: u16 = 0;
        pub const STRIDE_W: u16 = 1;
        pub const STRIDE_H: u16 = 2;
        pub const FILTER_W: u16 = 3;
        pub const FILTER_H: u16 = 4;
        pub const FUSED_ACTIVATION: u16 = 5;
    }

    pub mod fully_connected {
        pub const FUSED_ACTIVATION: u16 = 0;
        pub const WEIGHTS_FORMAT: u16 = 1;
        pub const KEEP_NUM_DIMS: u16 = 2;
    }

    pub mod softmax {
        pub const BETA: u16 = 0;
    }

    pub mod concatenation {
        pub const AXIS: u16 = 0;
        pub const FUSED_ACTIVATION: u16 = 1;
    }

    /// AddOptions, SubOptions, MulOptions, DivOptions
    pub mod arithmetic {
        pub const FUSED_ACTIVATION: u16 = 0;
    }

    pub mod reshape {
        pub const NEW_SHAPE: u16 = 0;
    }

    pub mod reducer {
        pub const KEEP_DIMS: u16 = 0;
    }
}

/// BuiltinOptions union tags
pub mod options_type {
    pub const NONE: u8 = 0;
    pub const CONV_2D: u8 = 1;
    pub const DEPTHWISE_CONV_2D: u8 = 2;
    pub const POOL_2D: u8 = 5;
    pub const FULLY_CONNECTED: u8 = 8;
    pub const SOFTMAX: u8 = 9;
    pub const CONCATENATION: u8 = 10;
    pub const ADD: u8 = 11;
    pub const RESHAPE: u8 = 17;
    pub const MUL: u8 = 21;
    pub const REDUCER: u8 = 27;
    pub const SUB: u8 = 28;
    pub const DIV: u8 = 29;
}

/// BuiltinOperator codes the converter handles
pub mod builtin_op {
    pub const ADD: i32 = 0;
    pub const AVERAGE_POOL_2D: i32 = 1;
    pub const CONCATENATION: i32 = 2;
    pub const CONV_2D: i32 = 3;
    pub const DEPTHWISE_CONV_2D: i32 = 4;
    pub const DEQUANTIZE: i32 = 6;
    pub const FULLY_CONNECTED: i32 = 9;
    pub const LOGISTIC: i32 = 14;
    pub const MAX_POOL_2D: i32 = 17;
    pub const MUL: i32 = 18;
    pub const RELU: i32 = 19;
    pub const RELU_N1_TO_1: i32 = 20;
    pub const RELU6: i32 = 21;
    pub const RESHAPE: i32 = 22;
    pub const SOFTMAX: i32 = 25;
    pub const TANH: i32 = 28;
    pub const CUSTOM: i32 = 32;
    pub const MEAN: i32 = 40;
    pub const SUB: i32 = 41;
    pub const DIV: i32 = 42;
}

/// FullyConnectedOptionsWeightsFormat::DEFAULT
pub const WEIGHTS_FORMAT_DEFAULT: u8 = 0;

// Indexed by BuiltinOperator code.
const BUILTIN_NAMES: [&str; 127] = [
    "ADD",
    "AVERAGE_POOL_2D",
    "CONCATENATION",
    "CONV_2D",
    "DEPTHWISE_CONV_2D",
    "DEPTH_TO_SPACE",
    "DEQUANTIZE",
    "EMBEDDING_LOOKUP",
    "FLOOR",
    "FULLY_CONNECTED",
    "HASHTABLE_LOOKUP",
    "L2_NORMALIZATION",
    "L2_POOL_2D",
    "LOCAL_RESPONSE_NORMALIZATION",
    "LOGISTIC",
    "LSH_PROJECTION",
    "LSTM",
    "MAX_POOL_2D",
    "MUL",
    "RELU",
    "RELU_N1_TO_1",
    "RELU6",
    "RESHAPE",
    "RESIZE_BILINEAR",
    "RNN",
    "SOFTMAX",
    "SPACE_TO_DEPTH",
    "SVDF",
    "TANH",
    "CONCAT_EMBEDDINGS",
    "SKIP_GRAM",
    "CALL",
    "CUSTOM",
    "EMBEDDING_LOOKUP_SPARSE",
    "PAD",
    "UNIDIRECTIONAL_SEQUENCE_RNN",
    "GATHER",
    "BATCH_TO_SPACE_ND",
    "SPACE_TO_BATCH_ND",
    "TRANSPOSE",
    "MEAN",
    "SUB",
    "DIV",
    "SQUEEZE",
    "UNIDIRECTIONAL_SEQUENCE_LSTM",
    "STRIDED_SLICE",
    "BIDIRECTIONAL_SEQUENCE_RNN",
    "EXP",
    "TOPK_V2",
    "SPLIT",
    "LOG_SOFTMAX",
    "DELEGATE",
    "BIDIRECTIONAL_SEQUENCE_LSTM",
    "CAST",
    "PRELU",
    "MAXIMUM",
    "ARG_MAX",
    "MINIMUM",
    "LESS",
    "NEG",
    "PADV2",
    "GREATER",
    "GREATER_EQUAL",
    "LESS_EQUAL",
    "SELECT",
    "SLICE",
    "SIN",
    "TRANSPOSE_CONV",
    "SPARSE_TO_DENSE",
    "TILE",
    "EXPAND_DIMS",
    "EQUAL",
    "NOT_EQUAL",
    "LOG",
    "SUM",
    "SQRT",
    "RSQRT",
    "SHAPE",
    "POW",
    "ARG_MIN",
    "FAKE_QUANT",
    "REDUCE_PROD",
    "REDUCE_MAX",
    "PACK",
    "LOGICAL_OR",
    "ONE_HOT",
    "LOGICAL_AND",
    "LOGICAL_NOT",
    "UNPACK",
    "REDUCE_MIN",
    "FLOOR_DIV",
    "REDUCE_ANY",
    "SQUARE",
    "ZEROS_LIKE",
    "FILL",
    "FLOOR_MOD",
    "RANGE",
    "RESIZE_NEAREST_NEIGHBOR",
    "LEAKY_RELU",
    "SQUARED_DIFFERENCE",
    "MIRROR_PAD",
    "ABS",
    "SPLIT_V",
    "UNIQUE",
    "CEIL",
    "REVERSE_V2",
    "ADD_N",
    "GATHER_ND",
    "COS",
    "WHERE",
    "RANK",
    "ELU",
    "REVERSE_SEQUENCE",
    "MATRIX_DIAG",
    "QUANTIZE",
    "MATRIX_SET_DIAG",
    "ROUND",
    "HARD_SWISH",
    "IF",
    "WHILE",
    "NON_MAX_SUPPRESSION_V4",
    "NON_MAX_SUPPRESSION_V5",
    "SCATTER_ND",
    "SELECT_V2",
    "DENSIFY",
    "SEGMENT_SUM",
    "BATCH_MATMUL",
];

/// Schema name of a builtin operator code
pub fn builtin_name(code: i32) -> String {
    usize::try_from(code)
        .ok()
        .and_then(|i| BUILTIN_NAMES.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("BUILTIN_{}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_line_up_with_codes() {
        assert_eq!(builtin_name(builtin_op::ADD), "ADD");
        assert_eq!(builtin_name(builtin_op::CONV_2D), "CONV_2D");
        assert_eq!(builtin_name(builtin_op::SOFTMAX), "SOFTMAX");
        assert_eq!(builtin_name(builtin_op::MEAN), "MEAN");
        assert_eq!(builtin_name(builtin_op::DIV), "DIV");
        assert_eq!(builtin_name(114), "QUANTIZE");
        assert_eq!(builtin_name(126), "BATCH_MATMUL");
    }

    #[test]
    fn test_unknown_builtin_name() {
        assert_eq!(builtin_name(400), "BUILTIN_400");
        assert_eq!(builtin_name(-3), "BUILTIN_-3");
    }

    #[test]
    fn test_voffset() {
        assert_eq!(voffset(0), 4);
        assert_eq!(voffset(field::operator::BUILTIN_OPTIONS), 12);
    }
}
