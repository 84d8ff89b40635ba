use crate::{EngineError, Value};
use pnp_dtype::Scalar;
use std::borrow::Cow;
use pnp_linalg as linalg;
use pnp_ndarray::{NdArray, Nested};
use pnp_ufunc::{self as ufunc, BinaryOp, CompareOp, ScalarSide, UnaryOp};

/// A unit of work an execution engine can run.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, args: &[Value]) -> Result<Value, EngineError>;
}

/// Wraps an arbitrary closure as a [`Job`].
pub struct FnJob<F> {
    name: String,
    func: F,
}

impl<F> FnJob<F>
where
    F: Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Job for FnJob<F>
where
    F: Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, args: &[Value]) -> Result<Value, EngineError> {
        (self.func)(args)
    }
}

impl<F> std::fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJob").field("name", &self.name).finish()
    }
}

/// Named engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Array,
    Zeros,
    Ones,
    Eye,
    Arange,
    Shape,
    Len,
    Index,
    ToList,
    Transpose,
    Flatten,
    Reshape,
    Slice,
    Binary(BinaryOp),
    Compare(CompareOp),
    Unary(UnaryOp),
    IsNan,
    IsInf,
    IsFinite,
    All,
    Any,
    Dot,
    DotColumns,
    Inv,
    Solve,
    Pinv,
    Eigh,
    Svd,
    Lstsq,
    Norm,
    Det,
    Slogdet,
    MatrixRank,
}

const NAMED: [(&str, Operation); 30] = [
    ("array", Operation::Array),
    ("zeros", Operation::Zeros),
    ("ones", Operation::Ones),
    ("eye", Operation::Eye),
    ("arange", Operation::Arange),
    ("shape", Operation::Shape),
    ("len", Operation::Len),
    ("index", Operation::Index),
    ("tolist", Operation::ToList),
    ("transpose", Operation::Transpose),
    ("flatten", Operation::Flatten),
    ("reshape", Operation::Reshape),
    ("slice", Operation::Slice),
    ("isnan", Operation::IsNan),
    ("isinf", Operation::IsInf),
    ("isfinite", Operation::IsFinite),
    ("all", Operation::All),
    ("any", Operation::Any),
    ("dot", Operation::Dot),
    ("dot_columns", Operation::DotColumns),
    ("inv", Operation::Inv),
    ("solve", Operation::Solve),
    ("pinv", Operation::Pinv),
    ("eigh", Operation::Eigh),
    ("svd", Operation::Svd),
    ("lstsq", Operation::Lstsq),
    ("norm", Operation::Norm),
    ("det", Operation::Det),
    ("slogdet", Operation::Slogdet),
    ("matrix_rank", Operation::MatrixRank),
];

impl Operation {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        if let Some(op) = BinaryOp::from_token(token) {
            return Some(Self::Binary(op));
        }
        if let Some(op) = CompareOp::from_token(token) {
            return Some(Self::Compare(op));
        }
        match token {
            "abs" | "absolute" => return Some(Self::Unary(UnaryOp::Abs)),
            "negative" | "neg" => return Some(Self::Unary(UnaryOp::Negative)),
            _ => {}
        }
        NAMED
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, op)| *op)
    }

    pub fn parse(token: &str) -> Result<Self, EngineError> {
        Self::from_token(token).ok_or_else(|| EngineError::UnknownOperation(token.to_string()))
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary(op) => op.as_str(),
            Self::Compare(op) => op.as_str(),
            Self::Unary(op) => op.as_str(),
            other => NAMED
                .iter()
                .find(|(_, op)| *op == other)
                .map_or("unknown", |(name, _)| name),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply(self, args: &[Value]) -> Result<Value, EngineError> {
        let name = self.as_str();
        match self {
            Self::Array => match args {
                [Value::List(nested)] => Value::array_from_nested(nested),
                [Value::Scalar(value)] => Value::array_from_nested(&Nested::Scalar(*value)),
                [Value::Array(array)] => Ok(Value::Array(array.clone())),
                _ => Err(EngineError::invalid(name, "expected one nested list")),
            },
            Self::Zeros | Self::Ones => {
                let [Value::Shape(dims)] = args else {
                    return Err(EngineError::invalid(name, "expected one shape"));
                };
                let array = if self == Self::Zeros {
                    NdArray::zeros(dims)?
                } else {
                    NdArray::ones(dims)?
                };
                Ok(Value::Array(array))
            }
            Self::Eye => match args {
                [Value::Scalar(n)] => {
                    let n = as_usize(name, *n)?;
                    Ok(Value::Array(NdArray::eye(n, n)?))
                }
                [Value::Scalar(rows), Value::Scalar(cols)] => Ok(Value::Array(NdArray::eye(
                    as_usize(name, *rows)?,
                    as_usize(name, *cols)?,
                )?)),
                _ => Err(EngineError::invalid(name, "expected rows and optional cols")),
            },
            Self::Arange => match args {
                [Value::Scalar(stop)] => Ok(Value::Array(NdArray::arange(
                    Scalar::Int(0),
                    *stop,
                    Scalar::Int(1),
                )?)),
                [Value::Scalar(start), Value::Scalar(stop)] => Ok(Value::Array(NdArray::arange(
                    *start,
                    *stop,
                    Scalar::Int(1),
                )?)),
                [Value::Scalar(start), Value::Scalar(stop), Value::Scalar(step)] => {
                    Ok(Value::Array(NdArray::arange(*start, *stop, *step)?))
                }
                _ => Err(EngineError::invalid(name, "expected start, stop and step scalars")),
            },
            Self::Shape => {
                let array = one_array(name, args)?;
                Ok(Value::Shape(array.shape().to_vec()))
            }
            Self::Len => {
                let array = one_array(name, args)?;
                let len = i64::try_from(array.len())
                    .map_err(|_| EngineError::invalid(name, "length exceeds int64"))?;
                Ok(Value::Scalar(Scalar::Int(len)))
            }
            Self::Index => {
                let [Value::Array(array), Value::Shape(indices)] = args else {
                    return Err(EngineError::invalid(name, "expected an array and indices"));
                };
                Ok(array.at(indices)?.into())
            }
            Self::ToList => match args {
                [Value::Array(array)] => Ok(Value::List(array.to_nested())),
                [Value::Scalar(value)] => Ok(Value::Scalar(*value)),
                _ => Err(EngineError::invalid(name, "expected one array")),
            },
            Self::Transpose => Ok(Value::Array(one_array(name, args)?.transpose())),
            Self::Flatten => Ok(Value::Array(one_array(name, args)?.flatten())),
            Self::Reshape => {
                let [Value::Array(array), Value::Shape(dims)] = args else {
                    return Err(EngineError::invalid(name, "expected an array and a shape"));
                };
                Ok(Value::Array(array.reshape(dims)?))
            }
            Self::Slice => match args {
                [Value::Array(array), Value::Scalar(low), Value::Scalar(high)] => Ok(Value::Array(
                    array.slice(as_isize(name, *low)?, as_isize(name, *high)?),
                )),
                [
                    Value::Array(array),
                    Value::Scalar(axis),
                    Value::Scalar(low),
                    Value::Scalar(high),
                ] => Ok(Value::Array(array.slice_axis(
                    as_usize(name, *axis)?,
                    as_isize(name, *low)?,
                    as_isize(name, *high)?,
                )?)),
                _ => Err(EngineError::invalid(name, "expected an array and slice bounds")),
            },
            Self::Binary(op) => match args {
                [Value::Array(lhs), Value::Array(rhs)] => Ok(ufunc::binary(lhs, rhs, op)?.into()),
                [Value::Array(lhs), Value::Scalar(rhs)] => {
                    Ok(ufunc::binary_scalar(lhs, *rhs, op, ScalarSide::Right)?.into())
                }
                [Value::Scalar(lhs), Value::Array(rhs)] => {
                    Ok(ufunc::binary_scalar(rhs, *lhs, op, ScalarSide::Left)?.into())
                }
                _ => Err(EngineError::invalid(name, "expected two operands, one an array")),
            },
            Self::Compare(op) => match args {
                [Value::Array(lhs), Value::Array(rhs)] => Ok(ufunc::compare(lhs, rhs, op)?.into()),
                [Value::Array(lhs), Value::Scalar(rhs)] => {
                    Ok(ufunc::compare_scalar(lhs, *rhs, op, ScalarSide::Right)?.into())
                }
                [Value::Scalar(lhs), Value::Array(rhs)] => {
                    Ok(ufunc::compare_scalar(rhs, *lhs, op, ScalarSide::Left)?.into())
                }
                _ => Err(EngineError::invalid(name, "expected two operands, one an array")),
            },
            Self::Unary(op) => Ok(ufunc::unary(&*one_array(name, args)?, op)?.into()),
            Self::IsNan | Self::IsInf | Self::IsFinite => match args {
                [Value::Array(array)] => Ok(match self {
                    Self::IsNan => ufunc::isnan(array),
                    Self::IsInf => ufunc::isinf(array),
                    _ => ufunc::isfinite(array),
                }
                .into()),
                [Value::Scalar(value)] => Ok(Scalar::Bool(match self {
                    Self::IsNan => ufunc::isnan_scalar(*value),
                    Self::IsInf => ufunc::isinf_scalar(*value),
                    _ => ufunc::isfinite_scalar(*value),
                })
                .into()),
                _ => Err(EngineError::invalid(name, "expected an array or a scalar")),
            },
            Self::All => match args {
                [Value::Array(array)] => Ok(Scalar::Bool(ufunc::all(array)).into()),
                [Value::Scalar(value)] => Ok(Scalar::Bool(ufunc::all_scalar(*value)).into()),
                _ => Err(EngineError::invalid(name, "expected an array or a scalar")),
            },
            Self::Any => Ok(Scalar::Bool(ufunc::any(&*one_array(name, args)?)).into()),
            Self::Dot => {
                let (lhs, rhs) = two_arrays(name, args)?;
                Ok(linalg::dot(&lhs, &rhs)?.into())
            }
            Self::DotColumns => {
                let [Value::Tuple(columns), weights] = args else {
                    return Err(EngineError::invalid(
                        name,
                        "expected a tuple of columns and a weight vector",
                    ));
                };
                let columns = columns
                    .iter()
                    .map(|column| vector_operand(name, column).map(|column| column.values()))
                    .collect::<Result<Vec<_>, _>>()?;
                let frame = linalg::ColumnFrame::new(columns)?;
                let weights = vector_operand(name, weights)?;
                Ok(linalg::dot_columns(&frame, &weights.values())?.into())
            }
            Self::Inv => Ok(linalg::inv(&*one_array(name, args)?)?.into()),
            Self::Solve => {
                let (a, b) = two_arrays(name, args)?;
                Ok(linalg::solve(&a, &b)?.into())
            }
            Self::Pinv => match args {
                [a] => Ok(linalg::pinv(&*operand(name, a)?)?.into()),
                [a, Value::Scalar(rcond)] => {
                    Ok(linalg::pinv_with_rcond(&*operand(name, a)?, rcond.as_f64())?.into())
                }
                _ => Err(EngineError::invalid(name, "expected an array and optional rcond")),
            },
            Self::Eigh => {
                let (a, uplo) = match args {
                    [a] => (a, linalg::Uplo::default()),
                    [a, Value::Token(token)] => (
                        a,
                        linalg::Uplo::from_token(token).map_err(|_| {
                            EngineError::invalid(name, "UPLO argument must be 'L' or 'U'")
                        })?,
                    ),
                    _ => {
                        return Err(EngineError::invalid(
                            name,
                            "expected an array and optional UPLO token",
                        ));
                    }
                };
                let result = linalg::eigh(&*operand(name, a)?, uplo)?;
                Ok(Value::Tuple(vec![
                    result.eigenvalues.into(),
                    result.eigenvectors.into(),
                ]))
            }
            Self::Svd => {
                let result = match args {
                    [a] => linalg::svd(&*operand(name, a)?)?,
                    [a, Value::Scalar(Scalar::Bool(full_matrices))] => {
                        linalg::svd_with(&*operand(name, a)?, *full_matrices)?
                    }
                    _ => {
                        return Err(EngineError::invalid(
                            name,
                            "expected an array and optional full_matrices flag",
                        ));
                    }
                };
                Ok(Value::Tuple(vec![
                    result.u.into(),
                    result.s.into(),
                    result.vt.into(),
                ]))
            }
            Self::Lstsq => {
                let result = match args {
                    [a, b] => linalg::lstsq(&*operand(name, a)?, &*operand(name, b)?)?,
                    [a, b, Value::Scalar(rcond)] => linalg::lstsq_with_rcond(
                        &*operand(name, a)?,
                        &*operand(name, b)?,
                        rcond.as_f64(),
                    )?,
                    _ => {
                        return Err(EngineError::invalid(
                            name,
                            "expected two arrays and optional rcond",
                        ));
                    }
                };
                let rank = i64::try_from(result.rank)
                    .map_err(|_| EngineError::invalid(name, "rank exceeds int64"))?;
                Ok(Value::Tuple(vec![
                    result.solution.into(),
                    result.residuals.into(),
                    Scalar::Int(rank).into(),
                    result.singular_values.into(),
                ]))
            }
            Self::Norm => {
                let norm = match args {
                    [x] => linalg::norm(&*operand(name, x)?)?,
                    [x, order] => {
                        let x = operand(name, x)?;
                        let order =
                            linalg::NormOrder::from_token(&order_token(name, order)?, x.rank())?;
                        linalg::norm_with_order(&x, order)?
                    }
                    _ => {
                        return Err(EngineError::invalid(
                            name,
                            "expected an array and optional order",
                        ));
                    }
                };
                Ok(Scalar::Float(norm).into())
            }
            Self::Det => Ok(Scalar::Float(linalg::det(&*one_array(name, args)?)?).into()),
            Self::Slogdet => {
                let result = linalg::slogdet(&*one_array(name, args)?)?;
                Ok(Value::Tuple(vec![
                    Scalar::Float(result.sign).into(),
                    Scalar::Float(result.logabsdet).into(),
                ]))
            }
            Self::MatrixRank => {
                let rank = linalg::matrix_rank(&*one_array(name, args)?)?;
                let rank = i64::try_from(rank)
                    .map_err(|_| EngineError::invalid(name, "rank exceeds int64"))?;
                Ok(Scalar::Int(rank).into())
            }
        }
    }
}

impl Job for Operation {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn run(&self, args: &[Value]) -> Result<Value, EngineError> {
        self.apply(args)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arrays pass through; nested lists are validated into arrays first, so a
/// ragged list fails the way `array` would.
fn operand<'a>(name: &str, value: &'a Value) -> Result<Cow<'a, NdArray>, EngineError> {
    match value {
        Value::Array(array) => Ok(Cow::Borrowed(array)),
        Value::List(nested) => Ok(Cow::Owned(NdArray::from_nested(nested)?)),
        _ => Err(EngineError::invalid(name, "expected an array or a nested list")),
    }
}

fn vector_operand<'a>(name: &str, value: &'a Value) -> Result<Cow<'a, NdArray>, EngineError> {
    let vector = operand(name, value)?;
    if vector.rank() != 1 {
        return Err(EngineError::invalid(name, "expected a 1-D array"));
    }
    Ok(vector)
}

fn one_array<'a>(name: &str, args: &'a [Value]) -> Result<Cow<'a, NdArray>, EngineError> {
    match args {
        [value] => operand(name, value),
        _ => Err(EngineError::invalid(name, "expected one array")),
    }
}

fn two_arrays<'a>(
    name: &str,
    args: &'a [Value],
) -> Result<(Cow<'a, NdArray>, Cow<'a, NdArray>), EngineError> {
    match args {
        [lhs, rhs] => Ok((operand(name, lhs)?, operand(name, rhs)?)),
        _ => Err(EngineError::invalid(name, "expected two arrays")),
    }
}

/// Norm orders arrive as tokens (`"fro"`, `"nuc"`) or as numbers (`2`, `-inf`).
fn order_token(name: &str, value: &Value) -> Result<String, EngineError> {
    match value {
        Value::Token(text) => Ok(text.clone()),
        Value::Scalar(Scalar::Int(order)) => Ok(order.to_string()),
        Value::Scalar(Scalar::Float(order)) if order.is_infinite() => {
            Ok(if *order > 0.0 { "inf" } else { "-inf" }.to_string())
        }
        Value::Scalar(Scalar::Float(order)) if order.fract() == 0.0 => Ok(format!("{order:.0}")),
        _ => Err(EngineError::invalid(name, "norm order must be a token or an integer")),
    }
}

fn as_isize(name: &str, value: Scalar) -> Result<isize, EngineError> {
    match value {
        Scalar::Int(int) => {
            isize::try_from(int).map_err(|_| EngineError::invalid(name, "integer out of range"))
        }
        Scalar::Bool(flag) => Ok(isize::from(flag)),
        Scalar::Float(_) => Err(EngineError::invalid(name, "expected an integer argument")),
    }
}

fn as_usize(name: &str, value: Scalar) -> Result<usize, EngineError> {
    usize::try_from(as_isize(name, value)?)
        .map_err(|_| EngineError::invalid(name, "expected a non-negative integer"))
}
