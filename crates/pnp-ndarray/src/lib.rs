#![forbid(unsafe_code)]

use pnp_dtype::{DType, DTypeInference, Scalar};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coarse error taxonomy shared by every engine crate. Remote evaluation
/// must surface the same kind that local evaluation raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RaggedShape,
    Shape,
    Index,
    SingularMatrix,
    Value,
    Remote,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RaggedShape => "ragged_shape",
            Self::Shape => "shape",
            Self::Index => "index",
            Self::SingularMatrix => "singular_matrix",
            Self::Value => "value",
            Self::Remote => "remote",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "ragged_shape" | "ragged" => Some(Self::RaggedShape),
            "shape" => Some(Self::Shape),
            "index" => Some(Self::Index),
            "singular_matrix" | "singular" => Some(Self::SingularMatrix),
            "value" => Some(Self::Value),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    ZeroRank,
    InvalidDimension(isize),
    MultipleUnknownDimensions,
    Overflow,
    IncompatibleElementCount { old: usize, new: usize },
}

impl ShapeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ZeroRank => "shape_zero_rank",
            Self::InvalidDimension(_) => "shape_invalid_dimension",
            Self::MultipleUnknownDimensions => "shape_multiple_unknown_dimensions",
            Self::Overflow => "shape_overflow",
            Self::IncompatibleElementCount { .. } => "shape_incompatible_element_count",
        }
    }
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroRank => write!(f, "arrays must have at least one axis"),
            Self::InvalidDimension(dim) => write!(f, "invalid dimension {dim}"),
            Self::MultipleUnknownDimensions => write!(f, "can only specify one unknown dimension"),
            Self::Overflow => write!(f, "size arithmetic overflow"),
            Self::IncompatibleElementCount { old, new } => {
                write!(
                    f,
                    "cannot reshape array of size {old} into shape of size {new}"
                )
            }
        }
    }
}

impl std::error::Error for ShapeError {}

/// Product of all extents with overflow checking. The empty product is 1;
/// see [`Shape::size`] for the array-facing definition.
pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(ShapeError::Overflow)
    })
}

/// Row-major element strides.
pub fn contiguous_strides(shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let mut strides = vec![0usize; shape.len()];
    let mut stride = 1usize;
    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride = stride.checked_mul(dim).ok_or(ShapeError::Overflow)?;
    }
    Ok(strides)
}

pub fn fix_unknown_dimension(
    new_shape: &[isize],
    old_element_count: usize,
) -> Result<Vec<usize>, ShapeError> {
    let mut known_product: usize = 1;
    let mut unknown_index: Option<usize> = None;
    let mut out = Vec::with_capacity(new_shape.len());

    for (idx, &dim) in new_shape.iter().enumerate() {
        match dim {
            -1 => {
                if unknown_index.replace(idx).is_some() {
                    return Err(ShapeError::MultipleUnknownDimensions);
                }
                out.push(0);
            }
            d if d < -1 => return Err(ShapeError::InvalidDimension(d)),
            d => {
                let d = usize::try_from(d).map_err(|_| ShapeError::InvalidDimension(d))?;
                known_product = known_product.checked_mul(d).ok_or(ShapeError::Overflow)?;
                out.push(d);
            }
        }
    }

    match unknown_index {
        Some(idx) => {
            if known_product == 0 || old_element_count % known_product != 0 {
                return Err(ShapeError::IncompatibleElementCount {
                    old: old_element_count,
                    new: known_product,
                });
            }
            out[idx] = old_element_count / known_product;
        }
        None => {
            if known_product != old_element_count {
                return Err(ShapeError::IncompatibleElementCount {
                    old: old_element_count,
                    new: known_product,
                });
            }
        }
    }

    Ok(out)
}

/// Per-axis extents of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of addressable elements. An empty shape has no elements.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.dims.is_empty() {
            return 0;
        }
        self.dims.iter().fold(1usize, |acc, &dim| acc.saturating_mul(dim))
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.dims.len()];
        let mut stride = 1usize;
        for (i, &dim) in self.dims.iter().enumerate().rev() {
            strides[i] = stride;
            stride = stride.saturating_mul(dim);
        }
        strides
    }

    pub fn validate_reshape(&self, new_shape: &Shape) -> Result<(), ShapeError> {
        let old = self.size();
        let new = new_shape.size();
        if old != new {
            return Err(ShapeError::IncompatibleElementCount { old, new });
        }
        Ok(())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

/// Host-side nested sequence, the construction and `tolist` boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Nested {
    Scalar(Scalar),
    List(Vec<Nested>),
}

impl Nested {
    #[must_use]
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Nested]> {
        match self {
            Self::Scalar(_) => None,
            Self::List(items) => Some(items),
        }
    }

    /// Structural equality with NaN == NaN and numeric Int/Float agreement.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Scalar(lhs), Self::Scalar(rhs)) => lhs.same_value(*rhs),
            (Self::List(lhs), Self::List(rhs)) => {
                lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(l, r)| l.same_value(r))
            }
            _ => false,
        }
    }
}

impl From<Scalar> for Nested {
    fn from(value: Scalar) -> Self {
        Self::Scalar(value)
    }
}

impl From<f64> for Nested {
    fn from(value: f64) -> Self {
        Self::Scalar(Scalar::Float(value))
    }
}

impl From<i64> for Nested {
    fn from(value: i64) -> Self {
        Self::Scalar(Scalar::Int(value))
    }
}

impl From<i32> for Nested {
    fn from(value: i32) -> Self {
        Self::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<bool> for Nested {
    fn from(value: bool) -> Self {
        Self::Scalar(Scalar::Bool(value))
    }
}

impl<T: Into<Nested>> From<Vec<T>> for Nested {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for Nested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    Shape(ShapeError),
    Ragged {
        depth: usize,
        expected: usize,
        actual: usize,
    },
    MixedNesting {
        depth: usize,
    },
    ScalarInput,
    InvalidInputLength {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        axis: usize,
        index: usize,
        extent: usize,
    },
    TooManyIndices {
        given: usize,
        rank: usize,
    },
    IncompleteIndex {
        given: usize,
        rank: usize,
    },
    AxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
    InvalidArgument(&'static str),
}

impl ArrayError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Shape(err) => err.reason_code(),
            Self::Ragged { .. } => "array_ragged_sequence",
            Self::MixedNesting { .. } => "array_mixed_nesting",
            Self::ScalarInput => "array_scalar_input",
            Self::InvalidInputLength { .. } => "array_invalid_input_length",
            Self::IndexOutOfBounds { .. } => "array_index_out_of_bounds",
            Self::TooManyIndices { .. } => "array_too_many_indices",
            Self::IncompleteIndex { .. } => "array_incomplete_index",
            Self::AxisOutOfBounds { .. } => "array_axis_out_of_bounds",
            Self::InvalidArgument(_) => "array_invalid_argument",
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Shape(_) | Self::InvalidInputLength { .. } => ErrorKind::Shape,
            Self::Ragged { .. } | Self::MixedNesting { .. } => ErrorKind::RaggedShape,
            Self::IndexOutOfBounds { .. }
            | Self::TooManyIndices { .. }
            | Self::IncompleteIndex { .. }
            | Self::AxisOutOfBounds { .. } => ErrorKind::Index,
            Self::ScalarInput | Self::InvalidArgument(_) => ErrorKind::Value,
        }
    }
}

impl std::fmt::Display for ArrayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "{err}"),
            Self::Ragged {
                depth,
                expected,
                actual,
            } => write!(
                f,
                "inhomogeneous shape after {depth} dimensions: expected length {expected}, found {actual}"
            ),
            Self::MixedNesting { depth } => {
                write!(f, "sequences and scalars mixed at depth {depth}")
            }
            Self::ScalarInput => write!(f, "array construction requires a sequence"),
            Self::InvalidInputLength { expected, actual } => {
                write!(
                    f,
                    "invalid input length expected={expected} actual={actual}"
                )
            }
            Self::IndexOutOfBounds {
                axis,
                index,
                extent,
            } => write!(
                f,
                "index {index} is out of bounds for axis {axis} with size {extent}"
            ),
            Self::TooManyIndices { given, rank } => write!(
                f,
                "too many indices for array: array is {rank}-dimensional, but {given} were indexed"
            ),
            Self::IncompleteIndex { given, rank } => write!(
                f,
                "item requires {rank} indices, but {given} were given"
            ),
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {axis} is out of bounds for array of dimension {rank}")
            }
            Self::InvalidArgument(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ArrayError {}

impl From<ShapeError> for ArrayError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

/// Result of indexing, iterating or a rank-dispatched product.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Scalar(Scalar),
    Array(NdArray),
}

impl Element {
    #[must_use]
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Array(_) => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Scalar(_) => None,
            Self::Array(array) => Some(array),
        }
    }

    #[must_use]
    pub fn into_array(self) -> Option<NdArray> {
        match self {
            Self::Scalar(_) => None,
            Self::Array(array) => Some(array),
        }
    }

    #[must_use]
    pub fn to_nested(&self) -> Nested {
        match self {
            Self::Scalar(value) => Nested::Scalar(*value),
            Self::Array(array) => array.to_nested(),
        }
    }
}

/// Dtype-tagged element vector: the exact contents of an array in
/// row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum Elements {
    Bool(Vec<bool>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl Elements {
    /// Casts every scalar to `dtype`. Integer targets never pass through
    /// `f64`.
    #[must_use]
    pub fn from_scalars(dtype: DType, scalars: &[Scalar]) -> Self {
        match dtype {
            DType::Bool => Self::Bool(scalars.iter().map(|s| s.truthy()).collect()),
            DType::I64 => Self::I64(scalars.iter().map(|s| s.as_i64()).collect()),
            DType::F64 => Self::F64(scalars.iter().map(|s| s.as_f64()).collect()),
        }
    }

    /// Stores float results under `dtype`: nonzero is true, integers are
    /// truncated toward zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(dtype: DType, values: Vec<f64>) -> Self {
        match dtype {
            DType::Bool => Self::Bool(values.into_iter().map(|raw| raw != 0.0).collect()),
            DType::I64 => Self::I64(values.into_iter().map(|raw| raw as i64).collect()),
            DType::F64 => Self::F64(values),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::I64(_) => DType::I64,
            Self::F64(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::F64(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn scalars(&self) -> Vec<Scalar> {
        match self {
            Self::Bool(values) => values.iter().copied().map(Scalar::Bool).collect(),
            Self::I64(values) => values.iter().copied().map(Scalar::Int).collect(),
            Self::F64(values) => values.iter().copied().map(Scalar::Float).collect(),
        }
    }
}

/// Shared backing storage, one variant per dtype.
#[derive(Debug, Clone)]
enum Buffer {
    Bool(Arc<[bool]>),
    I64(Arc<[i64]>),
    F64(Arc<[f64]>),
}

impl Buffer {
    fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::I64(_) => DType::I64,
            Self::F64(_) => DType::F64,
        }
    }

    fn scalar_at(&self, idx: usize) -> Scalar {
        match self {
            Self::Bool(data) => Scalar::Bool(data[idx]),
            Self::I64(data) => Scalar::Int(data[idx]),
            Self::F64(data) => Scalar::Float(data[idx]),
        }
    }

    fn same_allocation(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(lhs), Self::Bool(rhs)) => Arc::ptr_eq(lhs, rhs),
            (Self::I64(lhs), Self::I64(rhs)) => Arc::ptr_eq(lhs, rhs),
            (Self::F64(lhs), Self::F64(rhs)) => Arc::ptr_eq(lhs, rhs),
            _ => false,
        }
    }
}

impl From<Elements> for Buffer {
    fn from(elements: Elements) -> Self {
        match elements {
            Elements::Bool(values) => Self::Bool(values.into()),
            Elements::I64(values) => Self::I64(values.into()),
            Elements::F64(values) => Self::F64(values.into()),
        }
    }
}

fn clamp_bound(bound: isize, extent: usize) -> usize {
    if bound < 0 {
        extent.saturating_sub(bound.unsigned_abs())
    } else {
        bound.unsigned_abs().min(extent)
    }
}

/// Immutable dense N-dimensional array. Transposes and slices share the
/// backing buffer through a stride/offset remap.
#[derive(Debug, Clone)]
pub struct NdArray {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
    data: Buffer,
}

impl NdArray {
    fn contiguous(shape: Shape, elements: Elements) -> Self {
        let strides = shape.strides();
        Self {
            shape,
            strides,
            offset: 0,
            data: elements.into(),
        }
    }

    fn view(&self, shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Self {
            shape,
            strides,
            offset,
            data: self.data.clone(),
        }
    }

    /// Builds an array from row-major elements; the dtype is the variant's.
    pub fn from_elements(shape: Vec<usize>, elements: Elements) -> Result<Self, ArrayError> {
        if shape.is_empty() {
            return Err(ShapeError::ZeroRank.into());
        }
        let expected = element_count(&shape)?;
        if elements.len() != expected {
            return Err(ArrayError::InvalidInputLength {
                expected,
                actual: elements.len(),
            });
        }
        Ok(Self::contiguous(Shape::new(shape), elements))
    }

    /// Builds an array from a row-major float buffer stored under `dtype`
    /// (see [`Elements::from_f64`]).
    pub fn from_values(
        shape: Vec<usize>,
        values: Vec<f64>,
        dtype: DType,
    ) -> Result<Self, ArrayError> {
        Self::from_elements(shape, Elements::from_f64(dtype, values))
    }

    pub fn from_ints(shape: Vec<usize>, values: Vec<i64>) -> Result<Self, ArrayError> {
        Self::from_elements(shape, Elements::I64(values))
    }

    pub fn from_bools(shape: Vec<usize>, values: Vec<bool>) -> Result<Self, ArrayError> {
        Self::from_elements(shape, Elements::Bool(values))
    }

    pub fn from_scalars(shape: Vec<usize>, scalars: &[Scalar]) -> Result<Self, ArrayError> {
        let dtype = pnp_dtype::result_type(&scalars.iter().map(|s| s.dtype()).collect::<Vec<_>>());
        Self::from_elements(shape, Elements::from_scalars(dtype, scalars))
    }

    pub fn from_nested(nested: &Nested) -> Result<Self, ArrayError> {
        if !matches!(nested, Nested::List(_)) {
            return Err(ArrayError::ScalarInput);
        }

        let mut shape = Vec::new();
        let mut cursor = nested;
        while let Nested::List(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }

        let mut leaves = Vec::with_capacity(element_count(&shape)?);
        let mut inference = DTypeInference::new();
        collect_leaves(nested, &shape, 0, &mut leaves, &mut inference)?;
        let elements = Elements::from_scalars(inference.finish(), &leaves);
        Ok(Self::contiguous(Shape::new(shape), elements))
    }

    pub fn full(shape: &[usize], fill: Scalar) -> Result<Self, ArrayError> {
        if shape.is_empty() {
            return Err(ShapeError::ZeroRank.into());
        }
        let count = element_count(shape)?;
        let elements = match fill {
            Scalar::Bool(value) => Elements::Bool(vec![value; count]),
            Scalar::Int(value) => Elements::I64(vec![value; count]),
            Scalar::Float(value) => Elements::F64(vec![value; count]),
        };
        Ok(Self::contiguous(Shape::from(shape), elements))
    }

    pub fn zeros(shape: &[usize]) -> Result<Self, ArrayError> {
        Self::full(shape, Scalar::Float(0.0))
    }

    pub fn ones(shape: &[usize]) -> Result<Self, ArrayError> {
        Self::full(shape, Scalar::Float(1.0))
    }

    pub fn eye(rows: usize, cols: usize) -> Result<Self, ArrayError> {
        let count = element_count(&[rows, cols])?;
        let mut values = vec![0.0; count];
        for diag in 0..rows.min(cols) {
            values[diag * cols + diag] = 1.0;
        }
        Ok(Self::contiguous(
            Shape::new(vec![rows, cols]),
            Elements::F64(values),
        ))
    }

    /// Half-open range `[start, stop)` in steps of `step`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn arange(start: Scalar, stop: Scalar, step: Scalar) -> Result<Self, ArrayError> {
        let integral = [start, stop, step].iter().all(|s| !s.dtype().is_float());
        if integral {
            let (lo, hi, st) = (
                i128::from(start.as_i64()),
                i128::from(stop.as_i64()),
                i128::from(step.as_i64()),
            );
            if st == 0 {
                return Err(ArrayError::InvalidArgument("arange step must not be zero"));
            }
            let span = hi - lo;
            let len = if st > 0 {
                (span + st - 1).div_euclid(st)
            } else {
                (span + st + 1).div_euclid(st)
            }
            .max(0);
            let len = usize::try_from(len).map_err(|_| ShapeError::Overflow)?;
            // Every element lies between start and stop, so it fits in i64.
            let values = (0..len)
                .map(|i| (lo + i as i128 * st) as i64)
                .collect::<Vec<_>>();
            return Ok(Self::contiguous(
                Shape::new(vec![len]),
                Elements::I64(values),
            ));
        }

        let (lo, hi, st) = (start.as_f64(), stop.as_f64(), step.as_f64());
        if !lo.is_finite() || !hi.is_finite() || !st.is_finite() {
            return Err(ArrayError::InvalidArgument("arange bounds must be finite"));
        }
        if st == 0.0 {
            return Err(ArrayError::InvalidArgument("arange step must not be zero"));
        }
        let span = ((hi - lo) / st).ceil();
        let len = if span > 0.0 { span as usize } else { 0 };
        let values = (0..len).map(|i| lo + i as f64 * st).collect::<Vec<_>>();
        Ok(Self::contiguous(
            Shape::new(vec![len]),
            Elements::F64(values),
        ))
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.shape.dims()
    }

    #[must_use]
    pub fn layout(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Extent of the leading axis.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.size() == 0 || self.strides == self.shape.strides()
    }

    /// True when `other` reads from the same backing buffer.
    #[must_use]
    pub fn shares_buffer_with(&self, other: &Self) -> bool {
        self.data.same_allocation(&other.data)
    }

    /// Row-major copy of the logical elements out of `data`.
    fn gather<T: Copy>(&self, data: &[T]) -> Vec<T> {
        let count = self.size();
        if count == 0 {
            return Vec::new();
        }
        if self.is_contiguous() {
            return data[self.offset..self.offset + count].to_vec();
        }

        let dims = self.shape.dims();
        let mut multi = vec![0usize; dims.len()];
        let mut flat = self.offset;
        let mut out = Vec::with_capacity(count);
        for step in 0..count {
            out.push(data[flat]);
            if step + 1 == count {
                break;
            }
            // Odometer increment over the view's axes.
            for axis in (0..dims.len()).rev() {
                multi[axis] += 1;
                flat += self.strides[axis];
                if multi[axis] < dims[axis] {
                    break;
                }
                multi[axis] = 0;
                flat -= self.strides[axis] * dims[axis];
            }
        }
        out
    }

    /// Exact row-major copy of the logical elements.
    #[must_use]
    pub fn elements(&self) -> Elements {
        match &self.data {
            Buffer::Bool(data) => Elements::Bool(self.gather(data)),
            Buffer::I64(data) => Elements::I64(self.gather(data)),
            Buffer::F64(data) => Elements::F64(self.gather(data)),
        }
    }

    /// Row-major elements widened to `f64`. Integers beyond 2^53 round;
    /// use [`Self::elements`] or [`Self::ints`] where exactness matters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn values(&self) -> Vec<f64> {
        match &self.data {
            Buffer::Bool(data) => self
                .gather(data)
                .into_iter()
                .map(|flag| if flag { 1.0 } else { 0.0 })
                .collect(),
            Buffer::I64(data) => self.gather(data).into_iter().map(|v| v as f64).collect(),
            Buffer::F64(data) => self.gather(data),
        }
    }

    /// Row-major elements as integers: booleans as 0/1, floats truncated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ints(&self) -> Vec<i64> {
        match &self.data {
            Buffer::Bool(data) => self.gather(data).into_iter().map(i64::from).collect(),
            Buffer::I64(data) => self.gather(data),
            Buffer::F64(data) => self.gather(data).into_iter().map(|v| v as i64).collect(),
        }
    }

    #[must_use]
    pub fn scalars(&self) -> Vec<Scalar> {
        self.elements().scalars()
    }

    /// Applies `f` to every element widened to `f64`, storing the results
    /// under `dtype` in a contiguous array.
    #[must_use]
    pub fn map_values(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Self {
        let values = self.values().into_iter().map(f).collect();
        Self::contiguous(self.shape.clone(), Elements::from_f64(dtype, values))
    }

    #[must_use]
    pub fn astype(&self, dtype: DType) -> Self {
        if dtype == self.dtype() {
            return self.clone();
        }
        Self::contiguous(
            self.shape.clone(),
            Elements::from_scalars(dtype, &self.scalars()),
        )
    }

    /// Indexes the leading `indices.len()` axes. A full index yields a
    /// scalar; a partial one yields a view of the trailing axes.
    pub fn at(&self, indices: &[usize]) -> Result<Element, ArrayError> {
        let rank = self.rank();
        if indices.len() > rank {
            return Err(ArrayError::TooManyIndices {
                given: indices.len(),
                rank,
            });
        }

        let dims = self.shape.dims();
        let mut offset = self.offset;
        for (axis, (&index, &extent)) in indices.iter().zip(dims).enumerate() {
            if index >= extent {
                return Err(ArrayError::IndexOutOfBounds {
                    axis,
                    index,
                    extent,
                });
            }
            offset += index * self.strides[axis];
        }

        if indices.len() == rank {
            return Ok(Element::Scalar(self.data.scalar_at(offset)));
        }

        Ok(Element::Array(self.view(
            Shape::new(dims[indices.len()..].to_vec()),
            self.strides[indices.len()..].to_vec(),
            offset,
        )))
    }

    pub fn item(&self, indices: &[usize]) -> Result<Scalar, ArrayError> {
        if indices.len() < self.rank() {
            return Err(ArrayError::IncompleteIndex {
                given: indices.len(),
                rank: self.rank(),
            });
        }
        match self.at(indices)? {
            Element::Scalar(value) => Ok(value),
            Element::Array(_) => Err(ArrayError::IncompleteIndex {
                given: indices.len(),
                rank: self.rank(),
            }),
        }
    }

    /// Iterates the leading axis in index order.
    #[must_use]
    pub fn iter(&self) -> AxisIter<'_> {
        AxisIter {
            array: self,
            next: 0,
            end: self.len(),
        }
    }

    #[must_use]
    pub fn to_nested(&self) -> Nested {
        let scalars = self.scalars();
        nest(&scalars, self.shape.dims())
    }

    /// Reverses the axis order without copying.
    #[must_use]
    pub fn transpose(&self) -> Self {
        if self.rank() < 2 {
            return self.clone();
        }
        let mut dims = self.shape.dims().to_vec();
        dims.reverse();
        let mut strides = self.strides.clone();
        strides.reverse();
        self.view(Shape::new(dims), strides, self.offset)
    }

    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self, ArrayError> {
        if new_shape.is_empty() {
            return Err(ShapeError::ZeroRank.into());
        }
        let target = Shape::from(new_shape);
        self.shape.validate_reshape(&target)?;

        if self.is_contiguous() {
            let strides = target.strides();
            return Ok(self.view(target, strides, self.offset));
        }
        Ok(Self::contiguous(target, self.elements()))
    }

    /// Reshape where a single `-1` extent is inferred from the element count.
    pub fn reshape_inferred(&self, new_shape: &[isize]) -> Result<Self, ArrayError> {
        let resolved = fix_unknown_dimension(new_shape, self.size())?;
        self.reshape(&resolved)
    }

    #[must_use]
    pub fn flatten(&self) -> Self {
        let elements = self.elements();
        Self::contiguous(Shape::new(vec![elements.len()]), elements)
    }

    /// `self[low:high]` on the leading axis.
    #[must_use]
    pub fn slice(&self, low: isize, high: isize) -> Self {
        self.slice_view(0, low, high)
    }

    pub fn slice_axis(&self, axis: usize, low: isize, high: isize) -> Result<Self, ArrayError> {
        if axis >= self.rank() {
            return Err(ArrayError::AxisOutOfBounds {
                axis,
                rank: self.rank(),
            });
        }
        Ok(self.slice_view(axis, low, high))
    }

    fn slice_view(&self, axis: usize, low: isize, high: isize) -> Self {
        let extent = self.shape.dims()[axis];
        let lo = clamp_bound(low, extent);
        let hi = clamp_bound(high, extent);
        let len = hi.saturating_sub(lo);

        let mut dims = self.shape.dims().to_vec();
        dims[axis] = len;
        let offset = if len == 0 {
            self.offset
        } else {
            self.offset + lo * self.strides[axis]
        };
        self.view(Shape::new(dims), self.strides.clone(), offset)
    }
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.elements() == other.elements()
    }
}

impl std::fmt::Display for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "array({}, dtype={})", self.to_nested(), self.dtype())
    }
}

impl<'a> IntoIterator for &'a NdArray {
    type Item = Element;
    type IntoIter = AxisIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Leading-axis iterator; cloning it restarts from the clone point.
#[derive(Debug, Clone)]
pub struct AxisIter<'a> {
    array: &'a NdArray,
    next: usize,
    end: usize,
}

impl Iterator for AxisIter<'_> {
    type Item = Element;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        self.array.at(&[index]).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AxisIter<'_> {}

fn collect_leaves(
    node: &Nested,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<Scalar>,
    inference: &mut DTypeInference,
) -> Result<(), ArrayError> {
    match node {
        Nested::Scalar(value) => {
            if depth != shape.len() {
                return Err(ArrayError::MixedNesting { depth });
            }
            inference.observe(value.dtype());
            out.push(*value);
            Ok(())
        }
        Nested::List(items) => {
            let Some(&expected) = shape.get(depth) else {
                return Err(ArrayError::MixedNesting { depth });
            };
            if items.len() != expected {
                return Err(ArrayError::Ragged {
                    depth,
                    expected,
                    actual: items.len(),
                });
            }
            for item in items {
                collect_leaves(item, shape, depth + 1, out, inference)?;
            }
            Ok(())
        }
    }
}

fn nest(scalars: &[Scalar], dims: &[usize]) -> Nested {
    match dims {
        [] => Nested::List(Vec::new()),
        [_] => Nested::List(scalars.iter().copied().map(Nested::Scalar).collect()),
        [outer, rest @ ..] => {
            let chunk = rest.iter().product::<usize>();
            Nested::List(
                (0..*outer)
                    .map(|i| nest(&scalars[i * chunk..(i + 1) * chunk], rest))
                    .collect(),
            )
        }
    }
}
