#![forbid(unsafe_code)]

use pnp_dtype::{DType, Scalar, arithmetic_promote, promote_for_division};
use pnp_ndarray::{ArrayError, ErrorKind, NdArray, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Power,
}

impl BinaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Power => "power",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "add" | "+" => Some(Self::Add),
            "sub" | "subtract" | "-" => Some(Self::Sub),
            "mul" | "multiply" | "*" => Some(Self::Mul),
            "div" | "divide" | "true_divide" | "/" => Some(Self::Div),
            "power" | "pow" | "**" => Some(Self::Power),
            _ => None,
        }
    }

    /// Output dtype: true division is always float, the rest lift booleans
    /// to integers and otherwise take the wider operand.
    #[must_use]
    pub const fn out_dtype(self, lhs: DType, rhs: DType) -> DType {
        match self {
            Self::Div => promote_for_division(lhs, rhs),
            Self::Add | Self::Sub | Self::Mul | Self::Power => arithmetic_promote(lhs, rhs),
        }
    }

    /// IEEE float semantics.
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Power => lhs.powf(rhs),
        }
    }

    /// Wrapping two's-complement semantics for the integer kernels.
    pub fn apply_int(self, lhs: i64, rhs: i64) -> Result<i64, UFuncError> {
        match self {
            Self::Add => Ok(lhs.wrapping_add(rhs)),
            Self::Sub => Ok(lhs.wrapping_sub(rhs)),
            Self::Mul => Ok(lhs.wrapping_mul(rhs)),
            Self::Power => {
                let exp = u64::try_from(rhs).map_err(|_| UFuncError::NegativeIntegerPower)?;
                Ok(wrapping_ipow(lhs, exp))
            }
            // Division never reaches the integer kernel.
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            Self::Div => Ok((lhs as f64 / rhs as f64) as i64),
        }
    }
}

fn wrapping_ipow(mut base: i64, mut exp: u64) -> i64 {
    let mut acc: i64 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    acc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "eq" | "equal" | "==" => Some(Self::Eq),
            "ne" | "not_equal" | "!=" => Some(Self::Ne),
            "lt" | "less" | "<" => Some(Self::Lt),
            "le" | "less_equal" | "<=" => Some(Self::Le),
            "gt" | "greater" | ">" => Some(Self::Gt),
            "ge" | "greater_equal" | ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    /// NaN compares unequal to everything, itself included.
    #[must_use]
    pub fn apply<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Negative,
}

impl UnaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::Negative => "negative",
        }
    }

    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Abs => x.abs(),
            Self::Negative => -x,
        }
    }
}

/// Which side of the operator the scalar sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UFuncError {
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    NegativeIntegerPower,
    UnsupportedDtype { op: &'static str, dtype: DType },
    Array(ArrayError),
}

impl std::fmt::Display for UFuncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { lhs, rhs } => write!(
                f,
                "operands could not be broadcast together with shapes {} {}",
                Shape::from(lhs.as_slice()),
                Shape::from(rhs.as_slice())
            ),
            Self::NegativeIntegerPower => {
                write!(f, "Integers to negative integer powers are not allowed.")
            }
            Self::UnsupportedDtype { op, dtype } => {
                write!(f, "operation '{op}' is not supported for dtype {dtype}")
            }
            Self::Array(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for UFuncError {}

impl UFuncError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { .. } => "ufunc_shape_mismatch",
            Self::NegativeIntegerPower => "ufunc_negative_integer_power",
            Self::UnsupportedDtype { .. } => "ufunc_unsupported_dtype",
            Self::Array(err) => err.reason_code(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeMismatch { .. } => ErrorKind::Shape,
            Self::NegativeIntegerPower | Self::UnsupportedDtype { .. } => ErrorKind::Value,
            Self::Array(err) => err.kind(),
        }
    }
}

impl From<ArrayError> for UFuncError {
    fn from(err: ArrayError) -> Self {
        Self::Array(err)
    }
}

fn ensure_same_shape(lhs: &NdArray, rhs: &NdArray) -> Result<(), UFuncError> {
    if lhs.shape() != rhs.shape() {
        return Err(UFuncError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

/// Integer outputs run on the exact `i64` elements; everything else on
/// their `f64` widening.
fn arithmetic(
    shape: &[usize],
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    op: BinaryOp,
    out_dtype: DType,
) -> Result<NdArray, UFuncError> {
    if out_dtype.is_integer() {
        let values = lhs
            .ints()
            .zip(rhs.ints())
            .map(|(l, r)| op.apply_int(l, r))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(NdArray::from_ints(shape.to_vec(), values)?);
    }
    let values = lhs
        .floats()
        .zip(rhs.floats())
        .map(|(l, r)| op.apply(l, r))
        .collect();
    Ok(NdArray::from_values(shape.to_vec(), values, out_dtype)?)
}

fn comparison(
    shape: &[usize],
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    op: CompareOp,
) -> Result<NdArray, UFuncError> {
    let values = if lhs.is_float() || rhs.is_float() {
        lhs.floats()
            .zip(rhs.floats())
            .map(|(l, r)| op.apply(l, r))
            .collect()
    } else {
        lhs.ints()
            .zip(rhs.ints())
            .map(|(l, r)| op.apply(l, r))
            .collect()
    };
    Ok(NdArray::from_bools(shape.to_vec(), values)?)
}

/// Elements of one operand; a scalar repeats for as long as the other
/// side has elements.
#[derive(Clone, Copy)]
enum Operand<'a> {
    Array(&'a NdArray),
    Scalar(Scalar),
}

impl Operand<'_> {
    fn is_float(self) -> bool {
        match self {
            Self::Array(array) => array.dtype().is_float(),
            Self::Scalar(value) => value.dtype().is_float(),
        }
    }

    fn ints(self) -> Box<dyn Iterator<Item = i64>> {
        match self {
            Self::Array(array) => Box::new(array.ints().into_iter()),
            Self::Scalar(value) => Box::new(std::iter::repeat(value.as_i64())),
        }
    }

    fn floats(self) -> Box<dyn Iterator<Item = f64>> {
        match self {
            Self::Array(array) => Box::new(array.values().into_iter()),
            Self::Scalar(value) => Box::new(std::iter::repeat(value.as_f64())),
        }
    }
}

fn ordered<'a>(array: &'a NdArray, scalar: Scalar, side: ScalarSide) -> (Operand<'a>, Operand<'a>) {
    match side {
        ScalarSide::Right => (Operand::Array(array), Operand::Scalar(scalar)),
        ScalarSide::Left => (Operand::Scalar(scalar), Operand::Array(array)),
    }
}

/// Array-array arithmetic. Shapes must match exactly.
pub fn binary(lhs: &NdArray, rhs: &NdArray, op: BinaryOp) -> Result<NdArray, UFuncError> {
    ensure_same_shape(lhs, rhs)?;
    let out_dtype = op.out_dtype(lhs.dtype(), rhs.dtype());
    arithmetic(
        lhs.shape(),
        Operand::Array(lhs),
        Operand::Array(rhs),
        op,
        out_dtype,
    )
}

/// Array-scalar arithmetic; the scalar is applied to every element.
pub fn binary_scalar(
    array: &NdArray,
    scalar: Scalar,
    op: BinaryOp,
    side: ScalarSide,
) -> Result<NdArray, UFuncError> {
    let out_dtype = op.out_dtype(array.dtype(), scalar.dtype());
    let (lhs, rhs) = ordered(array, scalar, side);
    arithmetic(array.shape(), lhs, rhs, op, out_dtype)
}

/// Elementwise comparison producing a bool array. Integer and boolean
/// operands compare exactly.
pub fn compare(lhs: &NdArray, rhs: &NdArray, op: CompareOp) -> Result<NdArray, UFuncError> {
    ensure_same_shape(lhs, rhs)?;
    comparison(
        lhs.shape(),
        Operand::Array(lhs),
        Operand::Array(rhs),
        op,
    )
}

pub fn compare_scalar(
    array: &NdArray,
    scalar: Scalar,
    op: CompareOp,
    side: ScalarSide,
) -> Result<NdArray, UFuncError> {
    let (lhs, rhs) = ordered(array, scalar, side);
    comparison(array.shape(), lhs, rhs, op)
}

pub fn unary(array: &NdArray, op: UnaryOp) -> Result<NdArray, UFuncError> {
    match (op, array.dtype()) {
        (UnaryOp::Negative, DType::Bool) => Err(UFuncError::UnsupportedDtype {
            op: op.as_str(),
            dtype: DType::Bool,
        }),
        (UnaryOp::Abs, DType::Bool) => Ok(array.astype(DType::Bool)),
        (_, DType::I64) => {
            let values = array
                .ints()
                .into_iter()
                .map(|int| match op {
                    UnaryOp::Abs => int.wrapping_abs(),
                    UnaryOp::Negative => int.wrapping_neg(),
                })
                .collect();
            Ok(NdArray::from_ints(array.shape().to_vec(), values)?)
        }
        (_, dtype) => Ok(array.map_values(dtype, |v| op.apply(v))),
    }
}

fn bool_storage(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

#[must_use]
pub fn isnan(array: &NdArray) -> NdArray {
    array.map_values(DType::Bool, |v| bool_storage(v.is_nan()))
}

#[must_use]
pub fn isinf(array: &NdArray) -> NdArray {
    array.map_values(DType::Bool, |v| bool_storage(v.is_infinite()))
}

#[must_use]
pub fn isfinite(array: &NdArray) -> NdArray {
    array.map_values(DType::Bool, |v| bool_storage(v.is_finite()))
}

#[must_use]
pub fn isnan_scalar(value: Scalar) -> bool {
    value.is_nan()
}

#[must_use]
pub fn isinf_scalar(value: Scalar) -> bool {
    value.is_inf()
}

#[must_use]
pub fn isfinite_scalar(value: Scalar) -> bool {
    value.is_finite()
}

/// Logical AND over element truthiness. Empty arrays are vacuously true.
#[must_use]
pub fn all(array: &NdArray) -> bool {
    array.scalars().into_iter().all(Scalar::truthy)
}

#[must_use]
pub fn all_scalar(value: Scalar) -> bool {
    value.truthy()
}

#[must_use]
pub fn any(array: &NdArray) -> bool {
    array.scalars().into_iter().any(Scalar::truthy)
}
