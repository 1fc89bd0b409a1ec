//! Element type constraints of the default-domain operators graft emits
//!
//! Each operator binds some of its inputs to one type variable `T`; the
//! exporter rejects operands outside the allowed set before writing a node,
//! and the verifier re-checks every node of a written model against the same
//! table.

use crate::proto::ONNXDataType;

const FLOATS: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
    ONNXDataType::BFloat16,
];

const IEEE_FLOATS: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
];

const MAX_POOL: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
    ONNXDataType::Int8,
    ONNXDataType::UInt8,
];

const RELU_14: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
    ONNXDataType::BFloat16,
    ONNXDataType::Int8,
    ONNXDataType::Int16,
    ONNXDataType::Int32,
    ONNXDataType::Int64,
];

/// Floats plus the wide integers; Gemm, ReduceMean and arithmetic before 14
const WIDE_NUMERIC: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
    ONNXDataType::BFloat16,
    ONNXDataType::Int32,
    ONNXDataType::Int64,
    ONNXDataType::UInt32,
    ONNXDataType::UInt64,
];

const NUMERIC: &[ONNXDataType] = &[
    ONNXDataType::Float16,
    ONNXDataType::Float,
    ONNXDataType::Double,
    ONNXDataType::BFloat16,
    ONNXDataType::Int8,
    ONNXDataType::Int16,
    ONNXDataType::Int32,
    ONNXDataType::Int64,
    ONNXDataType::UInt8,
    ONNXDataType::UInt16,
    ONNXDataType::UInt32,
    ONNXDataType::UInt64,
];

const QUANTIZED: &[ONNXDataType] = &[
    ONNXDataType::Int8,
    ONNXDataType::UInt8,
    ONNXDataType::Int32,
];

/// Inputs that share the type variable `T`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Positions(&'static [usize]),
    /// Every input, for variadic operators
    All,
}

/// Element type of an operator's first output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Same as `T`
    Bound,
    Fixed(ONNXDataType),
    /// Taken from the `to` attribute
    CastTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeConstraint {
    pub binding: Binding,
    /// Types `T` may take; None accepts any tensor type
    pub allowed: Option<&'static [ONNXDataType]>,
    /// Inputs pinned to a type outside `T`
    pub fixed: &'static [(usize, ONNXDataType)],
    pub output: OutputType,
}

impl TypeConstraint {
    const fn new(binding: Binding, allowed: Option<&'static [ONNXDataType]>) -> Self {
        Self {
            binding,
            allowed,
            fixed: &[],
            output: OutputType::Bound,
        }
    }

    pub fn accepts(&self, dtype: ONNXDataType) -> bool {
        self.allowed.map_or(true, |allowed| allowed.contains(&dtype))
    }

    /// Whether input `position` takes the type `T`
    pub fn binds(&self, position: usize) -> bool {
        match self.binding {
            Binding::Positions(positions) => positions.contains(&position),
            Binding::All => true,
        }
    }

    pub fn fixed_type(&self, position: usize) -> Option<ONNXDataType> {
        self.fixed
            .iter()
            .find(|(p, _)| *p == position)
            .map(|(_, dtype)| *dtype)
    }
}

/// Constraint of default-domain `op_type` at `opset`, for the operators the
/// exporter writes
pub fn constraint(op_type: &str, opset: i64) -> Option<TypeConstraint> {
    use Binding::{All, Positions};

    let constraint = match op_type {
        "Relu" if opset >= 14 => TypeConstraint::new(Positions(&[0]), Some(RELU_14)),
        "Relu" | "Sigmoid" | "Tanh" | "Softmax" => {
            TypeConstraint::new(Positions(&[0]), Some(FLOATS))
        }
        "Add" | "Sub" | "Mul" | "Div" if opset >= 14 => {
            TypeConstraint::new(Positions(&[0, 1]), Some(NUMERIC))
        }
        "Add" | "Sub" | "Mul" | "Div" => {
            TypeConstraint::new(Positions(&[0, 1]), Some(WIDE_NUMERIC))
        }
        "Clip" => TypeConstraint::new(Positions(&[0, 1, 2]), Some(NUMERIC)),
        "Gemm" => TypeConstraint::new(Positions(&[0, 1, 2]), Some(WIDE_NUMERIC)),
        "Conv" => TypeConstraint::new(Positions(&[0, 1, 2]), Some(IEEE_FLOATS)),
        "AveragePool" => TypeConstraint::new(Positions(&[0]), Some(IEEE_FLOATS)),
        "MaxPool" => TypeConstraint::new(Positions(&[0]), Some(MAX_POOL)),
        "ReduceMean" => TypeConstraint::new(Positions(&[0]), Some(WIDE_NUMERIC)),
        "Concat" => TypeConstraint::new(All, None),
        "Transpose" => TypeConstraint::new(Positions(&[0]), None),
        "Reshape" => TypeConstraint {
            fixed: &[(1, ONNXDataType::Int64)],
            ..TypeConstraint::new(Positions(&[0]), None)
        },
        "Cast" => TypeConstraint {
            output: OutputType::CastTarget,
            ..TypeConstraint::new(Positions(&[0]), None)
        },
        "DequantizeLinear" => TypeConstraint {
            fixed: &[(1, ONNXDataType::Float)],
            output: OutputType::Fixed(ONNXDataType::Float),
            ..TypeConstraint::new(Positions(&[0, 2]), Some(QUANTIZED))
        },
        _ => return None,
    };
    Some(constraint)
}
