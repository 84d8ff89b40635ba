#![forbid(unsafe_code)]

use core::fmt;
use core::ops::{Index, IndexMut};
use pnp_dtype::{DType, Scalar, arithmetic_promote};
use pnp_ndarray::{ArrayError, Element, Elements, ErrorKind, NdArray, Shape};

/// Sweep cap for the Jacobi eigen and singular-value iterations.
pub const MAX_JACOBI_SWEEPS: usize = 100;
pub const DEFAULT_PINV_RCOND: f64 = 1e-15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorNormOrder {
    One,
    Two,
    Inf,
    NegInf,
}

impl VectorNormOrder {
    pub fn from_token(token: &str) -> Result<Self, LinAlgError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "1" => Ok(Self::One),
            "2" => Ok(Self::Two),
            "inf" | "+inf" => Ok(Self::Inf),
            "-inf" => Ok(Self::NegInf),
            _ => Err(LinAlgError::NormDetRankPolicyViolation(
                "unsupported vector norm order token",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixNormOrder {
    Fro,
    One,
    NegOne,
    Inf,
    NegInf,
    Two,
    NegTwo,
    Nuclear,
}

impl MatrixNormOrder {
    pub fn from_token(token: &str) -> Result<Self, LinAlgError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "fro" | "f" => Ok(Self::Fro),
            "1" => Ok(Self::One),
            "-1" => Ok(Self::NegOne),
            "inf" | "+inf" => Ok(Self::Inf),
            "-inf" => Ok(Self::NegInf),
            "2" => Ok(Self::Two),
            "-2" => Ok(Self::NegTwo),
            "nuc" => Ok(Self::Nuclear),
            _ => Err(LinAlgError::NormDetRankPolicyViolation(
                "unsupported matrix norm order token",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormOrder {
    Vector(VectorNormOrder),
    Matrix(MatrixNormOrder),
}

impl NormOrder {
    /// Parses `token` against the order family that applies to `rank`.
    pub fn from_token(token: &str, rank: usize) -> Result<Self, LinAlgError> {
        match rank {
            1 => VectorNormOrder::from_token(token).map(Self::Vector),
            2 => MatrixNormOrder::from_token(token).map(Self::Matrix),
            _ => Err(LinAlgError::ShapeContractViolation(
                "norm supports only 1-D and 2-D inputs",
            )),
        }
    }
}

/// Which triangle of a symmetric input `eigh` trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Uplo {
    #[default]
    Lower,
    Upper,
}

impl Uplo {
    pub fn from_token(token: &str) -> Result<Self, LinAlgError> {
        match token.trim() {
            "L" | "l" => Ok(Self::Lower),
            "U" | "u" => Ok(Self::Upper),
            _ => Err(LinAlgError::ShapeContractViolation(
                "UPLO argument must be 'L' or 'U'",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinAlgError {
    ShapeContractViolation(&'static str),
    AlignmentMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
        lhs_axis: usize,
        rhs_axis: usize,
    },
    SingularMatrix,
    SvdNonConvergence,
    SpectralConvergenceFailed,
    NormDetRankPolicyViolation(&'static str),
    Array(ArrayError),
}

impl LinAlgError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ShapeContractViolation(_) => "linalg_shape_contract_violation",
            Self::AlignmentMismatch { .. } => "linalg_alignment_mismatch",
            Self::SingularMatrix => "linalg_singular_matrix",
            Self::SvdNonConvergence => "linalg_svd_nonconvergence",
            Self::SpectralConvergenceFailed => "linalg_spectral_convergence_failed",
            Self::NormDetRankPolicyViolation(_) => "linalg_norm_det_rank_policy_violation",
            Self::Array(err) => err.reason_code(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeContractViolation(_) | Self::AlignmentMismatch { .. } => ErrorKind::Shape,
            Self::SingularMatrix => ErrorKind::SingularMatrix,
            Self::SvdNonConvergence
            | Self::SpectralConvergenceFailed
            | Self::NormDetRankPolicyViolation(_) => ErrorKind::Value,
            Self::Array(err) => err.kind(),
        }
    }
}

impl fmt::Display for LinAlgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeContractViolation(msg) => write!(f, "{msg}"),
            Self::AlignmentMismatch {
                lhs,
                rhs,
                lhs_axis,
                rhs_axis,
            } => write!(
                f,
                "shapes {} and {} not aligned: {} (dim {lhs_axis}) != {} (dim {rhs_axis})",
                Shape::from(lhs.as_slice()),
                Shape::from(rhs.as_slice()),
                lhs[*lhs_axis],
                rhs[*rhs_axis],
            ),
            Self::SingularMatrix => write!(f, "matrix was singular"),
            Self::SvdNonConvergence => write!(f, "SVD did not converge"),
            Self::SpectralConvergenceFailed => write!(f, "Eigenvalues did not converge"),
            Self::NormDetRankPolicyViolation(msg) => write!(f, "{msg}"),
            Self::Array(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LinAlgError {}

impl From<ArrayError> for LinAlgError {
    fn from(err: ArrayError) -> Self {
        Self::Array(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SvdResult {
    pub u: NdArray,
    pub s: NdArray,
    pub vt: NdArray,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EighResult {
    pub eigenvalues: NdArray,
    pub eigenvectors: NdArray,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LstsqResult {
    pub solution: NdArray,
    pub residuals: NdArray,
    pub rank: usize,
    pub singular_values: NdArray,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlogdetResult {
    pub sign: f64,
    pub logabsdet: f64,
}

/// Accepts any 2-D shape; zero extents give empty results downstream.
pub fn validate_matrix_shape(shape: &[usize]) -> Result<(usize, usize), LinAlgError> {
    let [rows, cols] = shape else {
        return Err(LinAlgError::ShapeContractViolation(
            "linalg input must be 2-D",
        ));
    };
    Ok((*rows, *cols))
}

pub fn validate_square_matrix(shape: &[usize]) -> Result<usize, LinAlgError> {
    let (rows, cols) = validate_matrix_shape(shape)?;
    if rows != cols {
        return Err(LinAlgError::ShapeContractViolation(
            "Last 2 dimensions of the array must be square",
        ));
    }
    Ok(rows)
}

pub fn validate_tolerance_policy(rcond: f64) -> Result<(), LinAlgError> {
    if !rcond.is_finite() || rcond < 0.0 {
        return Err(LinAlgError::NormDetRankPolicyViolation(
            "rcond must be finite and >= 0",
        ));
    }
    Ok(())
}

/// Dense row-major scratch matrix used by every routine in this crate.
#[derive(Debug, Clone, PartialEq)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn identity(n: usize) -> Self {
        let mut out = Self::zeros(n, n);
        for i in 0..n {
            out[(i, i)] = 1.0;
        }
        out
    }

    fn from_array(array: &NdArray) -> Result<Self, LinAlgError> {
        let (rows, cols) = validate_matrix_shape(array.shape())?;
        Ok(Self {
            rows,
            cols,
            data: array.values(),
        })
    }

    fn from_columns(rows: usize, columns: &[Vec<f64>]) -> Self {
        let mut out = Self::zeros(rows, columns.len());
        for (j, column) in columns.iter().enumerate() {
            for (i, &value) in column.iter().enumerate() {
                out[(i, j)] = value;
            }
        }
        out
    }

    fn column(&self, j: usize) -> Vec<f64> {
        (0..self.rows).map(|i| self[(i, j)]).collect()
    }

    fn transpose(&self) -> Self {
        let mut out = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out[(j, i)] = self[(i, j)];
            }
        }
        out
    }

    fn matmul(&self, rhs: &Self) -> Self {
        let mut out = Self::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self[(i, k)];
                if lhs == 0.0 {
                    continue;
                }
                for j in 0..rhs.cols {
                    out[(i, j)] += lhs * rhs[(k, j)];
                }
            }
        }
        out
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.cols {
            self.data.swap(a * self.cols + j, b * self.cols + j);
        }
    }

    fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    fn into_array(self) -> Result<NdArray, LinAlgError> {
        Ok(NdArray::from_values(
            vec![self.rows, self.cols],
            self.data,
            DType::F64,
        )?)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (row, col): (usize, usize)) -> &f64 {
        &self.data[row * self.cols + col]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut f64 {
        &mut self.data[row * self.cols + col]
    }
}

fn vector_array(values: Vec<f64>) -> Result<NdArray, LinAlgError> {
    let len = values.len();
    Ok(NdArray::from_values(vec![len], values, DType::F64)?)
}

/// Largest-magnitude component; the first one wins ties.
fn dominant_component(values: impl Iterator<Item = f64>) -> f64 {
    let mut best = 0.0;
    let mut best_abs = -1.0;
    for value in values {
        if value.abs() > best_abs {
            best_abs = value.abs();
            best = value;
        }
    }
    best
}

fn float_dot(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter().zip(rhs).map(|(l, r)| l * r).sum()
}

fn integer_dot(lhs: &[i64], rhs: &[i64]) -> i64 {
    lhs.iter()
        .zip(rhs)
        .fold(0i64, |acc, (&l, &r)| acc.wrapping_add(l.wrapping_mul(r)))
}

/// Boolean product: OR over the pairwise ANDs.
fn logical_dot(lhs: &[bool], rhs: &[bool]) -> bool {
    lhs.iter().zip(rhs).any(|(&l, &r)| l && r)
}

/// Row-by-column products of `a` (`m x k`, row-major) and `bt` (`n x k`,
/// the right operand's columns laid out as rows).
fn products<T: Copy>(
    a: &[T],
    bt: &[T],
    (m, k, n): (usize, usize, usize),
    kernel: fn(&[T], &[T]) -> T,
) -> Vec<T> {
    let mut out = Vec::with_capacity(m * n);
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            out.push(kernel(row, &bt[j * k..(j + 1) * k]));
        }
    }
    out
}

fn truth_values(array: &NdArray) -> Vec<bool> {
    array.scalars().into_iter().map(Scalar::truthy).collect()
}

/// Rank-dispatched product: inner product, matrix-vector, vector-matrix or
/// matrix-matrix. Two bool operands give a bool result, integer operands
/// an exact wrapping `int64` one.
pub fn dot(lhs: &NdArray, rhs: &NdArray) -> Result<Element, LinAlgError> {
    let misaligned = |lhs_axis: usize, rhs_axis: usize| LinAlgError::AlignmentMismatch {
        lhs: lhs.shape().to_vec(),
        rhs: rhs.shape().to_vec(),
        lhs_axis,
        rhs_axis,
    };

    let (dims, out_shape) = match (lhs.shape(), rhs.shape()) {
        ([n], [k]) => {
            if n != k {
                return Err(misaligned(0, 0));
            }
            ((1, *n, 1), Vec::new())
        }
        ([m, k], [n]) => {
            if k != n {
                return Err(misaligned(1, 0));
            }
            ((*m, *k, 1), vec![*m])
        }
        ([k], [rows, n]) => {
            if k != rows {
                return Err(misaligned(0, 0));
            }
            ((1, *k, *n), vec![*n])
        }
        ([m, k], [rows, n]) => {
            if k != rows {
                return Err(misaligned(1, 0));
            }
            ((*m, *k, *n), vec![*m, *n])
        }
        _ => {
            return Err(LinAlgError::ShapeContractViolation(
                "dot supports only 1-D and 2-D operands",
            ));
        }
    };

    // For a 1-D right operand the transpose is the operand itself, i.e.
    // its single column.
    let columns = rhs.transpose();
    let elements = match (lhs.dtype(), rhs.dtype()) {
        (DType::Bool, DType::Bool) => Elements::Bool(products(
            &truth_values(lhs),
            &truth_values(&columns),
            dims,
            logical_dot,
        )),
        (l, r) if arithmetic_promote(l, r).is_integer() => Elements::I64(products(
            &lhs.ints(),
            &columns.ints(),
            dims,
            integer_dot,
        )),
        _ => Elements::F64(products(&lhs.values(), &columns.values(), dims, float_dot)),
    };

    if out_shape.is_empty() {
        return elements
            .scalars()
            .first()
            .copied()
            .map(Element::Scalar)
            .ok_or(LinAlgError::ShapeContractViolation(
                "inner product produced no value",
            ));
    }
    Ok(Element::Array(NdArray::from_elements(out_shape, elements)?))
}

/// Gauss-Jordan elimination with scaled partial pivoting, solving `a x = b`.
/// A pivot is singular when it is within `n * EPSILON` of its row's
/// original magnitude, so badly scaled but regular systems still solve.
#[allow(clippy::cast_precision_loss)]
fn gauss_jordan(mut a: Matrix, mut b: Matrix) -> Result<Matrix, LinAlgError> {
    let n = a.rows;
    let mut row_scale = (0..n)
        .map(|i| (0..n).fold(0.0_f64, |acc, j| acc.max(a[(i, j)].abs())))
        .collect::<Vec<_>>();
    if row_scale.iter().any(|&scale| scale == 0.0) {
        return Err(LinAlgError::SingularMatrix);
    }
    let tolerance = n as f64 * f64::EPSILON;

    for k in 0..n {
        let mut pivot_row = k;
        for i in k + 1..n {
            if a[(i, k)].abs() / row_scale[i] > a[(pivot_row, k)].abs() / row_scale[pivot_row] {
                pivot_row = i;
            }
        }
        if a[(pivot_row, k)].abs() <= tolerance * row_scale[pivot_row] {
            return Err(LinAlgError::SingularMatrix);
        }
        a.swap_rows(k, pivot_row);
        b.swap_rows(k, pivot_row);
        row_scale.swap(k, pivot_row);

    let pivot = a[(k, k)];
        for i in 0..n {
            if i == k {
                continue;
            }
            let factor = a[(i, k)] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in k..n {
                let delta = factor * a[(k, j)];
                a[(i, j)] -= delta;
            }
            for j in 0..b.cols {
                let delta = factor * b[(k, j)];
                b[(i, j)] -= delta;
            }
        }
    }

    for i in 0..n {
        let diag = a[(i, i)];
        for j in 0..b.cols {
            b[(i, j)] /= diag;
        }
    }
    Ok(b)
}

pub fn inv(a: &NdArray) -> Result<NdArray, LinAlgError> {
    let n = validate_square_matrix(a.shape())?;
    gauss_jordan(Matrix::from_array(a)?, Matrix::identity(n))?.into_array()
}

/// Solves `a x = b` for a vector `(n,)` or matrix `(n, k)` right-hand side.
pub fn solve(a: &NdArray, b: &NdArray) -> Result<NdArray, LinAlgError> {
    let n = validate_square_matrix(a.shape())?;
    let (rhs, vector) = match b.shape() {
        [rows] if *rows == n => (
            Matrix {
                rows: n,
                cols: 1,
                data: b.values(),
            },
            true,
        ),
        [rows, cols] if *rows == n => (
            Matrix {
                rows: n,
                cols: *cols,
                data: b.values(),
            },
            false,
        ),
        [_] | [_, _] => {
            return Err(LinAlgError::ShapeContractViolation(
                "solve right-hand side rows must match the matrix order",
            ));
        }
        _ => {
            return Err(LinAlgError::ShapeContractViolation(
                "solve right-hand side must be 1-D or 2-D",
            ));
        }
    };

    let x = gauss_jordan(Matrix::from_array(a)?, rhs)?;
    if vector {
        return vector_array(x.data);
    }
    x.into_array()
}

fn symmetrize(a: &Matrix, uplo: Uplo) -> Matrix {
    let n = a.rows;
    let mut out = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let (hi, lo) = if i >= j { (i, j) } else { (j, i) };
            out[(i, j)] = match uplo {
                Uplo::Lower => a[(hi, lo)],
                Uplo::Upper => a[(lo, hi)],
            };
        }
    }
    out
}

/// Cyclic Jacobi on a symmetric matrix. Returns the (unsorted) diagonal
/// and the accumulated rotations.
fn jacobi_eigen(mut a: Matrix) -> Result<(Vec<f64>, Matrix), LinAlgError> {
    let n = a.rows;
    let mut v = Matrix::identity(n);

    for sweep in 0..=MAX_JACOBI_SWEEPS {
        let mut off = 0.0;
        let mut total = 0.0;
        for i in 0..n {
            for j in 0..n {
                let sq = a[(i, j)] * a[(i, j)];
                total += sq;
                if i != j {
                    off += sq;
                }
            }
        }
        if off == 0.0 || off <= f64::EPSILON * f64::EPSILON * total {
            break;
        }
        if sweep == MAX_JACOBI_SWEEPS {
            return Err(LinAlgError::SpectralConvergenceFailed);
        }

        for p in 0..n.saturating_sub(1) {
            for q in p + 1..n {
                let apq = a[(p, q)];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                a[(p, p)] -= t * apq;
                a[(q, q)] += t * apq;
                a[(p, q)] = 0.0;
                a[(q, p)] = 0.0;
                for r in 0..n {
                    if r == p || r == q {
                        continue;
                    }
                    let (arp, arq) = (a[(r, p)], a[(r, q)]);
                    let new_p = c * arp - s * arq;
                    let new_q = s * arp + c * arq;
                    a[(r, p)] = new_p;
                    a[(p, r)] = new_p;
                    a[(r, q)] = new_q;
                    a[(q, r)] = new_q;
                }
                for r in 0..n {
                    let (vrp, vrq) = (v[(r, p)], v[(r, q)]);
                    v[(r, p)] = c * vrp - s * vrq;
                    v[(r, q)] = s * vrp + c * vrq;
                }
            }
        }
    }

    Ok(((0..n).map(|i| a[(i, i)]).collect(), v))
}

/// Eigen-decomposition of a symmetric matrix. Eigenvalues ascending,
/// eigenvectors as columns.
pub fn eigh(a: &NdArray, uplo: Uplo) -> Result<EighResult, LinAlgError> {
    let n = validate_square_matrix(a.shape())?;
    let matrix = Matrix::from_array(a)?;
    if !matrix.is_finite() {
        return Err(LinAlgError::SpectralConvergenceFailed);
    }

    let (diag, v) = jacobi_eigen(symmetrize(&matrix, uplo))?;
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&i, &j| diag[i].total_cmp(&diag[j]));

    let eigenvalues = order.iter().map(|&i| diag[i]).collect::<Vec<_>>();
    let columns = order
        .iter()
        .map(|&i| {
            let column = v.column(i);
            if dominant_component(column.iter().copied()) > 0.0 {
                column.into_iter().map(|x| -x).collect()
            } else {
                column
            }
        })
        .collect::<Vec<Vec<f64>>>();

    Ok(EighResult {
        eigenvalues: vector_array(eigenvalues)?,
        eigenvectors: Matrix::from_columns(n, &columns).into_array()?,
    })
}

struct Svd {
    u: Matrix,
    s: Vec<f64>,
    vt: Matrix,
}

/// Extends `columns` to an orthonormal set of `dim`-vectors, filling every
/// `None` slot from the standard basis via Gram-Schmidt.
fn complete_basis(columns: Vec<Option<Vec<f64>>>, dim: usize) -> Vec<Vec<f64>> {
    let mut basis = columns.iter().flatten().cloned().collect::<Vec<_>>();
    let mut out = Vec::with_capacity(columns.len());

    for column in columns {
        if let Some(column) = column {
            out.push(column);
            continue;
        }
        let mut filled = vec![0.0; dim];
        for e in 0..dim {
            let mut candidate = vec![0.0; dim];
            candidate[e] = 1.0;
            // Two passes keep the result orthogonal to working precision.
            for _ in 0..2 {
                for b in &basis {
                    let proj = float_dot(&candidate, b);
                    for (c, &bi) in candidate.iter_mut().zip(b) {
                        *c -= proj * bi;
                    }
                }
            }
            let norm = float_dot(&candidate, &candidate).sqrt();
            if norm > 1e-8 {
                filled = candidate.into_iter().map(|c| c / norm).collect();
                break;
            }
        }
        basis.push(filled.clone());
        out.push(filled);
    }
    out
}

/// One-sided Hestenes Jacobi for `rows >= cols`.
#[allow(clippy::cast_precision_loss)]
fn svd_tall(a: &Matrix, full_matrices: bool) -> Result<Svd, LinAlgError> {
    let (m, n) = (a.rows, a.cols);
    let mut w = a.clone();
    let mut v = Matrix::identity(n);

    let mut converged = false;
    for _ in 0..MAX_JACOBI_SWEEPS {
        let mut rotated = false;
        for p in 0..n.saturating_sub(1) {
            for q in p + 1..n {
                let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, 0.0);
                for i in 0..m {
                    alpha += w[(i, p)] * w[(i, p)];
                    beta += w[(i, q)] * w[(i, q)];
                    gamma += w[(i, p)] * w[(i, q)];
                }
                if gamma == 0.0 || gamma.abs() <= f64::EPSILON * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let sign = if zeta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for i in 0..m {
                    let (x, y) = (w[(i, p)], w[(i, q)]);
                    w[(i, p)] = c * x - s * y;
                    w[(i, q)] = s * x + c * y;
                }
                for i in 0..n {
                    let (x, y) = (v[(i, p)], v[(i, q)]);
                    v[(i, p)] = c * x - s * y;
                    v[(i, q)] = s * x + c * y;
                }
            }
        }
        if !rotated {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(LinAlgError::SvdNonConvergence);
    }

    let sigma = (0..n)
        .map(|j| (0..m).map(|i| w[(i, j)] * w[(i, j)]).sum::<f64>().sqrt())
        .collect::<Vec<_>>();
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&i, &j| sigma[j].total_cmp(&sigma[i]));
    let s = order.iter().map(|&j| sigma[j]).collect::<Vec<_>>();
    let cutoff = s.first().copied().unwrap_or(0.0) * f64::EPSILON * m.max(n) as f64;

    let mut u_columns = order
        .iter()
        .map(|&j| {
            (sigma[j] > cutoff && sigma[j] > 0.0)
                .then(|| (0..m).map(|i| w[(i, j)] / sigma[j]).collect::<Vec<_>>())
        })
        .collect::<Vec<_>>();
    if full_matrices {
        u_columns.extend(std::iter::repeat_n(None, m - n));
    }
    let u_columns = complete_basis(u_columns, m);

    let v_columns = order.iter().map(|&j| v.column(j)).collect::<Vec<_>>();
    Ok(Svd {
        u: Matrix::from_columns(m, &u_columns),
        s,
        vt: Matrix::from_columns(n, &v_columns).transpose(),
    })
}

/// Makes the dominant component of every right singular vector negative,
/// flipping the paired left singular vector with it.
fn normalize_signs(svd: &mut Svd) {
    for i in 0..svd.vt.rows {
        let row = (0..svd.vt.cols).map(|j| svd.vt[(i, j)]);
        if dominant_component(row) <= 0.0 {
            continue;
        }
        for j in 0..svd.vt.cols {
            svd.vt[(i, j)] = -svd.vt[(i, j)];
        }
        if i < svd.u.cols {
            for r in 0..svd.u.rows {
                svd.u[(r, i)] = -svd.u[(r, i)];
            }
        }
    }
}

fn svd_matrix(a: &Matrix, full_matrices: bool) -> Result<Svd, LinAlgError> {
    if !a.is_finite() {
        return Err(LinAlgError::SvdNonConvergence);
    }
    let mut svd = if a.rows >= a.cols {
        svd_tall(a, full_matrices)?
    } else {
        let flipped = svd_tall(&a.transpose(), full_matrices)?;
        Svd {
            u: flipped.vt.transpose(),
            s: flipped.s,
            vt: flipped.u.transpose(),
        }
    };
    normalize_signs(&mut svd);
    Ok(svd)
}

/// Full-matrices singular value decomposition.
pub fn svd(a: &NdArray) -> Result<SvdResult, LinAlgError> {
    svd_with(a, true)
}

pub fn svd_with(a: &NdArray, full_matrices: bool) -> Result<SvdResult, LinAlgError> {
    let matrix = Matrix::from_array(a)?;
    let Svd { u, s, vt } = svd_matrix(&matrix, full_matrices)?;
    Ok(SvdResult {
        u: u.into_array()?,
        s: vector_array(s)?,
        vt: vt.into_array()?,
    })
}

/// `V · diag(1/s) · Uᵀ` over the singular values above `cutoff`.
fn pseudo_inverse(svd: &Svd, cutoff: f64) -> Matrix {
    let (m, n) = (svd.u.rows, svd.vt.cols);
    let mut out = Matrix::zeros(n, m);
    for (idx, &sigma) in svd.s.iter().enumerate() {
        if sigma <= cutoff {
            continue;
        }
        let inv_sigma = 1.0 / sigma;
        for i in 0..n {
            let vi = svd.vt[(idx, i)] * inv_sigma;
            if vi == 0.0 {
                continue;
            }
            for j in 0..m {
                out[(i, j)] += vi * svd.u[(j, idx)];
            }
        }
    }
    out
}

pub fn pinv(a: &NdArray) -> Result<NdArray, LinAlgError> {
    pinv_with_rcond(a, DEFAULT_PINV_RCOND)
}

pub fn pinv_with_rcond(a: &NdArray, rcond: f64) -> Result<NdArray, LinAlgError> {
    validate_tolerance_policy(rcond)?;
    let svd = svd_matrix(&Matrix::from_array(a)?, false)?;
    let cutoff = rcond * svd.s.first().copied().unwrap_or(0.0);
    pseudo_inverse(&svd, cutoff).into_array()
}

/// Minimum-norm least-squares solution with the default cutoff
/// `EPSILON * max(m, n)`.
#[allow(clippy::cast_precision_loss)]
pub fn lstsq(a: &NdArray, b: &NdArray) -> Result<LstsqResult, LinAlgError> {
    let (m, n) = validate_matrix_shape(a.shape())?;
    lstsq_with_rcond(a, b, f64::EPSILON * m.max(n) as f64)
}

pub fn lstsq_with_rcond(a: &NdArray, b: &NdArray, rcond: f64) -> Result<LstsqResult, LinAlgError> {
    validate_tolerance_policy(rcond)?;
    let matrix = Matrix::from_array(a)?;
    let (m, n) = (matrix.rows, matrix.cols);
    let (rhs, vector) = match b.shape() {
        [rows] if *rows == m => (
            Matrix {
                rows: m,
                cols: 1,
                data: b.values(),
            },
            true,
        ),
        [rows, cols] if *rows == m => (
            Matrix {
                rows: m,
                cols: *cols,
                data: b.values(),
            },
            false,
        ),
        _ => {
            return Err(LinAlgError::ShapeContractViolation(
                "Incompatible dimensions",
            ));
        }
    };

    let svd = svd_matrix(&matrix, false)?;
    let cutoff = rcond * svd.s.first().copied().unwrap_or(0.0);
    let rank = svd.s.iter().filter(|&&sigma| sigma > cutoff).count();
    let x = pseudo_inverse(&svd, cutoff).matmul(&rhs);

    let residuals = if rank == n && m > n {
        let fitted = matrix.matmul(&x);
        (0..rhs.cols)
            .map(|j| {
                (0..m)
                    .map(|i| {
                        let r = rhs[(i, j)] - fitted[(i, j)];
                        r * r
                    })
                    .sum::<f64>()
            })
            .collect()
    } else {
        Vec::new()
    };

    let solution = if vector {
        vector_array(x.data)?
    } else {
        x.into_array()?
    };
    Ok(LstsqResult {
        solution,
        residuals: vector_array(residuals)?,
        rank,
        singular_values: vector_array(svd.s)?,
    })
}

pub fn vector_norm(values: &[f64], ord: Option<VectorNormOrder>) -> Result<f64, LinAlgError> {
    let order = ord.unwrap_or(VectorNormOrder::Two);
    if values.is_empty() {
        if matches!(order, VectorNormOrder::NegInf) {
            return Err(LinAlgError::NormDetRankPolicyViolation(
                "negative infinity vector norm is undefined for empty inputs",
            ));
        }
        return Ok(0.0);
    }

    let abs_values = values.iter().map(|value| value.abs());
    let result = match order {
        VectorNormOrder::One => abs_values.sum(),
        VectorNormOrder::Two => abs_values.map(|value| value * value).sum::<f64>().sqrt(),
        VectorNormOrder::Inf => abs_values.fold(0.0, f64::max),
        VectorNormOrder::NegInf => abs_values.fold(f64::INFINITY, f64::min),
    };
    Ok(result)
}

fn matrix_norm(matrix: &Matrix, order: MatrixNormOrder) -> Result<f64, LinAlgError> {
    let column_sums = || {
        (0..matrix.cols).map(|j| (0..matrix.rows).map(|i| matrix[(i, j)].abs()).sum::<f64>())
    };
    let row_sums = || {
        (0..matrix.rows).map(|i| (0..matrix.cols).map(|j| matrix[(i, j)].abs()).sum::<f64>())
    };
    let no_lines = match order {
        MatrixNormOrder::NegOne => matrix.cols == 0,
        MatrixNormOrder::NegInf => matrix.rows == 0,
        _ => false,
    };
    if no_lines {
        return Err(LinAlgError::NormDetRankPolicyViolation(
            "negative matrix norm orders are undefined for empty inputs",
        ));
    }
    let result = match order {
        MatrixNormOrder::Fro => matrix.data.iter().map(|v| v * v).sum::<f64>().sqrt(),
        MatrixNormOrder::One => column_sums().fold(0.0, f64::max),
        MatrixNormOrder::NegOne => column_sums().fold(f64::INFINITY, f64::min),
        MatrixNormOrder::Inf => row_sums().fold(0.0, f64::max),
        MatrixNormOrder::NegInf => row_sums().fold(f64::INFINITY, f64::min),
        MatrixNormOrder::Two => svd_matrix(matrix, false)?.s.first().copied().unwrap_or(0.0),
        MatrixNormOrder::NegTwo => svd_matrix(matrix, false)?.s.last().copied().unwrap_or(0.0),
        MatrixNormOrder::Nuclear => svd_matrix(matrix, false)?.s.iter().sum(),
    };
    Ok(result)
}

/// 2-norm for vectors, Frobenius for matrices.
pub fn norm(x: &NdArray) -> Result<f64, LinAlgError> {
    let order = match x.rank() {
        1 => NormOrder::Vector(VectorNormOrder::Two),
        _ => NormOrder::Matrix(MatrixNormOrder::Fro),
    };
    norm_with_order(x, order)
}

pub fn norm_with_order(x: &NdArray, order: NormOrder) -> Result<f64, LinAlgError> {
    match (x.rank(), order) {
        (1, NormOrder::Vector(ord)) => vector_norm(&x.values(), Some(ord)),
        (2, NormOrder::Matrix(ord)) => matrix_norm(&Matrix::from_array(x)?, ord),
        (1 | 2, _) => Err(LinAlgError::NormDetRankPolicyViolation(
            "norm order does not apply to the input rank",
        )),
        _ => Err(LinAlgError::ShapeContractViolation(
            "norm supports only 1-D and 2-D inputs",
        )),
    }
}

/// LU with partial pivoting: returns the permutation sign and the U diagonal.
fn lu_diagonal(mut a: Matrix) -> (f64, Vec<f64>) {
    let n = a.rows;
    let mut sign = 1.0;
    for k in 0..n {
        let mut pivot_row = k;
        for i in k + 1..n {
            if a[(i, k)].abs() > a[(pivot_row, k)].abs() {
                pivot_row = i;
            }
        }
        if pivot_row != k {
            a.swap_rows(k, pivot_row);
            sign = -sign;
        }
        let pivot = a[(k, k)];
        if pivot == 0.0 {
            continue;
        }
        for i in k + 1..n {
            let factor = a[(i, k)] / pivot;
            for j in k..n {
                let delta = factor * a[(k, j)];
                a[(i, j)] -= delta;
            }
        }
    }
    (sign, (0..n).map(|i| a[(i, i)]).collect())
}

pub fn det(a: &NdArray) -> Result<f64, LinAlgError> {
    validate_square_matrix(a.shape())?;
    let (sign, diag) = lu_diagonal(Matrix::from_array(a)?);
    Ok(diag.iter().fold(sign, |acc, d| acc * d))
}

pub fn slogdet(a: &NdArray) -> Result<SlogdetResult, LinAlgError> {
    validate_square_matrix(a.shape())?;
    let (mut sign, diag) = lu_diagonal(Matrix::from_array(a)?);
    let mut logabsdet = 0.0;
    for d in diag {
        if d == 0.0 {
            return Ok(SlogdetResult {
                sign: 0.0,
                logabsdet: f64::NEG_INFINITY,
            });
        }
        sign *= d.signum();
        logabsdet += d.abs().ln();
    }
    Ok(SlogdetResult { sign, logabsdet })
}

/// Count of singular values above `s_max * max(m, n) * EPSILON`. Vectors
/// have rank 1 unless all-zero.
#[allow(clippy::cast_precision_loss)]
pub fn matrix_rank(a: &NdArray) -> Result<usize, LinAlgError> {
    if a.rank() == 1 {
        return Ok(usize::from(a.values().iter().any(|&v| v != 0.0)));
    }
    let matrix = Matrix::from_array(a)?;
    let s = svd_matrix(&matrix, false)?.s;
    let tol = s.first().copied().unwrap_or(0.0) * matrix.rows.max(matrix.cols) as f64 * f64::EPSILON;
    Ok(s.iter().filter(|&&sigma| sigma > tol).count())
}

/// Read-only columnar storage, e.g. a dataframe's numeric columns.
pub trait ColumnStore {
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;
    fn column(&self, idx: usize) -> Option<&[f64]>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFrame {
    rows: usize,
    columns: Vec<Vec<f64>>,
}

impl ColumnFrame {
    pub fn new(columns: Vec<Vec<f64>>) -> Result<Self, LinAlgError> {
        let rows = columns.first().map_or(0, Vec::len);
        if columns.iter().any(|column| column.len() != rows) {
            return Err(LinAlgError::ShapeContractViolation(
                "frame columns must share a row count",
            ));
        }
        Ok(Self { rows, columns })
    }
}

impl ColumnStore for ColumnFrame {
    fn row_count(&self) -> usize {
        self.rows
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column(&self, idx: usize) -> Option<&[f64]> {
        self.columns.get(idx).map(Vec::as_slice)
    }
}

/// `result[j] = Σ_i column_i[j] * vector[i]`, accumulated eight rows at a
/// time.
pub fn dot_columns(store: &impl ColumnStore, vector: &[f64]) -> Result<NdArray, LinAlgError> {
    let columns = store.column_count();
    if vector.len() != columns {
        return Err(LinAlgError::AlignmentMismatch {
            lhs: vec![store.row_count(), columns],
            rhs: vec![vector.len()],
            lhs_axis: 1,
            rhs_axis: 0,
        });
    }

    let rows = store.row_count();
    let mut out = vec![0.0; rows];
    for (idx, &weight) in vector.iter().enumerate() {
        let column = store
            .column(idx)
            .filter(|column| column.len() == rows)
            .ok_or(LinAlgError::ShapeContractViolation(
                "column store returned a short column",
            ))?;
        let mut out_chunks = out.chunks_exact_mut(8);
        let mut col_chunks = column.chunks_exact(8);
        for (acc, src) in (&mut out_chunks).zip(&mut col_chunks) {
            acc[0] += src[0] * weight;
            acc[1] += src[1] * weight;
            acc[2] += src[2] * weight;
            acc[3] += src[3] * weight;
            acc[4] += src[4] * weight;
            acc[5] += src[5] * weight;
            acc[6] += src[6] * weight;
            acc[7] += src[7] * weight;
        }
        for (acc, src) in out_chunks
            .into_remainder()
            .iter_mut()
            .zip(col_chunks.remainder())
        {
            *acc += src * weight;
        }
    }
    vector_array(out)
}

#[cfg(test)]
mod tests {
    use super::{
        ColumnFrame, LinAlgError, MatrixNormOrder, NormOrder, Uplo, VectorNormOrder, det, dot,
        dot_columns, eigh, inv, lstsq, matrix_rank, norm, norm_with_order, pinv, slogdet, solve,
        svd, svd_with, validate_square_matrix,
    };
    use pnp_dtype::{DType, Scalar};
    use pnp_ndarray::{Element, ErrorKind, NdArray, Nested};

    fn array(nested: Nested) -> NdArray {
        NdArray::from_nested(&nested).expect("fixture array")
    }

    fn approx_equal(lhs: f64, rhs: f64, tol: f64) -> bool {
        (lhs - rhs).abs() <= tol
    }

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!(approx_equal(*a, *e, tol), "index {idx}: {a} vs {e}");
        }
    }

    fn matmul(lhs: &NdArray, rhs: &NdArray) -> NdArray {
        dot(lhs, rhs)
            .expect("aligned")
            .into_array()
            .expect("matrix product")
    }

    fn diag(values: &NdArray, rows: usize, cols: usize) -> NdArray {
        let mut out = vec![0.0; rows * cols];
        for (i, v) in values.values().into_iter().enumerate() {
            out[i * cols + i] = v;
        }
        NdArray::from_values(vec![rows, cols], out, DType::F64).expect("diag")
    }

    #[test]
    fn dot_dispatches_on_rank() {
        let x = array(Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        let v = array(Nested::from(vec![1.0, -1.0]));

        let Element::Scalar(inner) = dot(&v, &v).expect("inner") else {
            panic!("1-D . 1-D is a scalar");
        };
        assert_eq!(inner, Scalar::Float(2.0));

        let mv = dot(&x, &v).expect("mat-vec").into_array().expect("array");
        assert_eq!(mv.shape(), &[2]);
        assert_eq!(mv.values(), vec![-1.0, -1.0]);

        let vm = dot(&v, &x).expect("vec-mat").into_array().expect("array");
        assert_eq!(vm.values(), vec![-2.0, -2.0]);

        let mm = matmul(&x, &x);
        assert_eq!(mm.shape(), &[2, 2]);
        assert_eq!(mm.values(), vec![7.0, 10.0, 15.0, 22.0]);
    }

    #[test]
    fn dot_keeps_integer_dtype() {
        let x = array(Nested::from(vec![vec![1, 2], vec![3, 4]]));
        let out = matmul(&x, &x);
        assert_eq!(out.dtype(), DType::I64);
        assert_eq!(out.to_nested(), Nested::from(vec![vec![7, 10], vec![15, 22]]));
        let v = array(Nested::from(vec![1, 2]));
        assert_eq!(
            dot(&v, &v).expect("inner").as_scalar(),
            Some(Scalar::Int(5))
        );
    }

    #[test]
    fn integer_dot_is_exact_past_two_pow_53() {
        let big = 9_007_199_254_740_993_i64;
        let x = array(Nested::from(vec![vec![big, 1], vec![0, -1]]));
        let v = array(Nested::from(vec![1, 2]));
        let out = dot(&x, &v).expect("mat-vec").into_array().expect("array");
        assert_eq!(out.dtype(), DType::I64);
        assert_eq!(out.to_nested(), Nested::from(vec![big + 2, -2]));
        assert_eq!(
            dot(&v, &array(Nested::from(vec![big, 0]))).expect("inner").as_scalar(),
            Some(Scalar::Int(big))
        );
    }

    #[test]
    fn bool_dot_is_logical() {
        let a = array(Nested::from(vec![vec![true, false], vec![false, false]]));
        let b = array(Nested::from(vec![vec![true, true], vec![true, false]]));
        let out = matmul(&a, &b);
        assert_eq!(out.dtype(), DType::Bool);
        assert_eq!(
            out.to_nested(),
            Nested::from(vec![vec![true, true], vec![false, false]])
        );
        let flags = array(Nested::from(vec![true, true]));
        assert_eq!(
            dot(&flags, &flags).expect("inner").as_scalar(),
            Some(Scalar::Bool(true))
        );
        let mixed = dot(&flags, &array(Nested::from(vec![2, 3]))).expect("bool . int");
        assert_eq!(mixed.as_scalar(), Some(Scalar::Int(5)));
    }

    #[test]
    fn dot_shape_results_follow_operands() {
        let a = NdArray::ones(&[3, 4]).expect("a");
        let b = NdArray::ones(&[4, 5]).expect("b");
        assert_eq!(matmul(&a, &b).shape(), &[3, 5]);
    }

    #[test]
    fn dot_rejects_misaligned_operands() {
        let x = array(Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        let y = array(Nested::from(vec![1.0, 2.0, 3.0]));
        let tall = NdArray::ones(&[3, 2]).expect("tall");
        let four = NdArray::ones(&[4]).expect("four");

        let err = dot(&y, &x).expect_err("(3,) . (2,2)");
        assert_eq!(err.kind(), ErrorKind::Shape);
        let err = dot(&x, &tall).expect_err("(2,2) . (3,2)");
        assert!(err.to_string().starts_with("shapes (2,2) and (3,2) not aligned"));
        assert_eq!(err.reason_code(), "linalg_alignment_mismatch");
        dot(&four, &tall).expect_err("(4,) . (3,2)");

        let cube = NdArray::ones(&[2, 2, 2]).expect("cube");
        let err = dot(&cube, &x).expect_err("rank 3");
        assert!(matches!(err, LinAlgError::ShapeContractViolation(_)));
    }

    #[test]
    fn inverse_of_regular_matrix() {
        let x = array(Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        let inverse = inv(&x).expect("non-singular");
        assert_close(&inverse.values(), &[-2.0, 1.0, 1.5, -0.5], 1e-12);

        let identity = matmul(&x, &inverse);
        assert_close(&identity.values(), &[1.0, 0.0, 0.0, 1.0], 1e-12);

        let ints = array(Nested::from(vec![
            vec![4, 7, 2],
            vec![3, 6, 1],
            vec![2, 5, 3],
        ]));
        let product = matmul(&ints.astype(DType::F64), &inv(&ints).expect("3x3"));
        let expected = NdArray::eye(3, 3).expect("eye").values();
        assert_close(&product.values(), &expected, 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported_with_reference_message() {
        let x = array(Nested::from(vec![vec![1.0, 1.0], vec![1.0, 1.0]]));
        let err = inv(&x).expect_err("singular");
        assert_eq!(err, LinAlgError::SingularMatrix);
        assert_eq!(err.kind(), ErrorKind::SingularMatrix);
        assert_eq!(err.to_string(), "matrix was singular");

        let zeros = NdArray::zeros(&[3, 3]).expect("zeros");
        assert_eq!(inv(&zeros).expect_err("zero"), LinAlgError::SingularMatrix);

        let rect = NdArray::ones(&[2, 3]).expect("rect");
        assert!(matches!(
            inv(&rect).expect_err("non-square"),
            LinAlgError::ShapeContractViolation(_)
        ));
        assert_eq!(validate_square_matrix(&[3, 3]).expect("square"), 3);
    }

    #[test]
    fn badly_scaled_regular_matrices_invert() {
        let x = array(Nested::from(vec![vec![1e-20, 0.0], vec![0.0, 1.0]]));
        let inverse = inv(&x).expect("regular despite scale");
        let values = inverse.values();
        assert!(approx_equal(values[0] / 1e20, 1.0, 1e-12), "{}", values[0]);
        assert_eq!(&values[1..], &[0.0, 0.0, 1.0]);

        let rows = array(Nested::from(vec![vec![1e-30, 2e-30], vec![3.0, 4.0]]));
        let x = solve(&rows, &array(Nested::from(vec![1e-30, 2.0]))).expect("row scaled");
        assert_close(&x.values(), &[0.0, 0.5], 1e-12);

        let singular = array(Nested::from(vec![vec![1e-20, 2e-20], vec![1.0, 2.0]]));
        assert_eq!(inv(&singular).expect_err("dependent rows"), LinAlgError::SingularMatrix);
    }

    #[test]
    fn empty_square_matrices_give_empty_results() {
        let empty = NdArray::zeros(&[0, 0]).expect("0x0");
        assert_eq!(inv(&empty).expect("inv").shape(), &[0, 0]);
        assert_eq!(det(&empty).expect("det"), 1.0);
        let slog = slogdet(&empty).expect("slogdet");
        assert_eq!((slog.sign, slog.logabsdet), (1.0, 0.0));
        let eig = eigh(&empty, Uplo::Lower).expect("eigh");
        assert_eq!(eig.eigenvalues.shape(), &[0]);
        assert_eq!(eig.eigenvectors.shape(), &[0, 0]);
        let x = solve(&empty, &NdArray::zeros(&[0]).expect("rhs")).expect("solve");
        assert_eq!(x.shape(), &[0]);
        assert_eq!(matrix_rank(&empty).expect("rank"), 0);
        assert_eq!(norm(&empty).expect("norm"), 0.0);
    }

    #[test]
    fn solve_accepts_vector_and_matrix_rhs() {
        let a = array(Nested::from(vec![vec![-2, 3], vec![4, 7]]));
        let vector = solve(&a, &array(Nested::from(vec![1, 2]))).expect("vector rhs");
        assert_eq!(vector.shape(), &[2]);
        assert_close(&vector.values(), &[-1.0 / 26.0, 8.0 / 26.0], 1e-12);

        let column = solve(&a, &array(Nested::from(vec![vec![1], vec![2]]))).expect("column");
        assert_eq!(column.shape(), &[2, 1]);
        assert_close(&column.values(), &vector.values(), 1e-15);

        let singular = array(Nested::from(vec![vec![-2, 3], vec![-2, 3]]));
        let err = solve(&singular, &array(Nested::from(vec![1, 2]))).expect_err("singular");
        assert_eq!(err.kind(), ErrorKind::SingularMatrix);

        let err = solve(&a, &array(Nested::from(vec![1, 2, 3]))).expect_err("rows");
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn eigh_matches_reference_values() {
        let a = array(Nested::from(vec![vec![2.0, 1.0], vec![1.0, 1.0]]));
        let result = eigh(&a, Uplo::Lower).expect("symmetric");
        assert_close(
            &result.eigenvalues.values(),
            &[0.381_966_011_250_105_2, 2.618_033_988_749_895],
            1e-12,
        );
        assert_close(
            &result.eigenvectors.values(),
            &[
                0.525_731_112_119_133_5,
                -0.850_650_808_352_039_9,
                -0.850_650_808_352_039_9,
                -0.525_731_112_119_133_5,
            ],
            1e-12,
        );
    }

    #[test]
    fn eigh_trusts_only_the_selected_triangle() {
        let lower_only = array(Nested::from(vec![vec![2.0, 99.0], vec![1.0, 1.0]]));
        let upper_only = array(Nested::from(vec![vec![2.0, 1.0], vec![-99.0, 1.0]]));
        let lower = eigh(&lower_only, Uplo::Lower).expect("lower");
        let upper = eigh(&upper_only, Uplo::from_token("U").expect("U")).expect("upper");
        assert_close(&lower.eigenvalues.values(), &upper.eigenvalues.values(), 1e-14);
        assert!(Uplo::from_token("X").is_err());
    }

    #[test]
    fn eigh_reconstructs_larger_symmetric_input() {
        let a = array(Nested::from(vec![
            vec![4.0, 1.0, -2.0, 2.0],
            vec![1.0, 2.0, 0.0, 1.0],
            vec![-2.0, 0.0, 3.0, -2.0],
            vec![2.0, 1.0, -2.0, -1.0],
        ]));
        let result = eigh(&a, Uplo::default()).expect("symmetric");
        let values = result.eigenvalues.values();
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "ascending");
        let v = &result.eigenvectors;
        let rebuilt = matmul(&matmul(v, &diag(&result.eigenvalues, 4, 4)), &v.transpose());
        assert_close(&rebuilt.values(), &a.values(), 1e-10);
        let trace: f64 = values.iter().sum();
        assert!(approx_equal(trace, 8.0, 1e-10));
    }

    #[test]
    fn svd_matches_reference_values() {
        let a = array(Nested::from(vec![vec![1.0, 3.0], vec![2.0, 4.0]]));
        let result = svd(&a).expect("svd");
        assert_close(
            &result.s.values(),
            &[5.464_985_704_219_042, 0.365_966_190_626_257_8],
            1e-12,
        );
        assert_close(
            &result.u.values(),
            &[
                -0.576_048_436_766_320_8,
                0.817_415_560_470_363_2,
                -0.817_415_560_470_363_2,
                -0.576_048_436_766_320_8,
            ],
            1e-12,
        );
        assert_close(
            &result.vt.values(),
            &[
                -0.404_553_584_833_756_9,
                -0.914_514_295_677_304_4,
                -0.914_514_295_677_304_4,
                0.404_553_584_833_756_9,
            ],
            1e-12,
        );
    }

    #[test]
    fn svd_handles_rectangular_shapes() {
        let wide = array(Nested::from(vec![vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 6.0]]));
        let result = svd(&wide).expect("wide");
        assert_eq!(result.u.shape(), &[2, 2]);
        assert_eq!(result.vt.shape(), &[3, 3]);
        assert_close(
            &result.s.values(),
            &[8.650_217_581_753_543, 0.416_816_252_468_540_2],
            1e-10,
        );
        let thin = svd_with(&wide, false).expect("thin");
        assert_eq!(thin.vt.shape(), &[2, 3]);
        let rebuilt = matmul(&matmul(&thin.u, &diag(&thin.s, 2, 2)), &thin.vt);
        assert_close(&rebuilt.values(), &wide.values(), 1e-10);

        let tall = array(Nested::from(vec![
            vec![1.0, 2.0],
            vec![3.0, 4.0],
            vec![5.0, 6.0],
        ]));
        let result = svd(&tall).expect("tall");
        assert_eq!(result.u.shape(), &[3, 3]);
        assert_close(
            &result.s.values(),
            &[9.525_518_091_565_106, 0.514_300_580_658_644_3],
            1e-10,
        );
        let rebuilt = matmul(&matmul(&result.u, &diag(&result.s, 3, 2)), &result.vt);
        assert_close(&rebuilt.values(), &tall.values(), 1e-10);
        let orthogonal = matmul(&result.u.transpose(), &result.u);
        assert_close(
            &orthogonal.values(),
            &NdArray::eye(3, 3).expect("eye").values(),
            1e-10,
        );
    }

    #[test]
    fn svd_rejects_non_finite_input() {
        let a = array(Nested::from(vec![vec![1.0, f64::NAN], vec![0.0, 1.0]]));
        assert_eq!(svd(&a).expect_err("nan"), LinAlgError::SvdNonConvergence);
        assert_eq!(pinv(&a).expect_err("nan"), LinAlgError::SvdNonConvergence);
    }

    #[test]
    fn pinv_inverts_regular_and_rank_deficient_input() {
        let x = array(Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        assert_close(
            &pinv(&x).expect("pinv").values(),
            &[-2.0, 1.0, 1.5, -0.5],
            1e-12,
        );
        let ones = array(Nested::from(vec![vec![1.0, 1.0], vec![1.0, 1.0]]));
        assert_close(&pinv(&ones).expect("rank 1").values(), &[0.25; 4], 1e-12);

        let wide = array(Nested::from(vec![vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 6.0]]));
        let p = pinv(&wide).expect("wide");
        assert_eq!(p.shape(), &[3, 2]);
        let identity = matmul(&wide, &p);
        assert_close(&identity.values(), &[1.0, 0.0, 0.0, 1.0], 1e-10);
    }

    #[test]
    fn lstsq_tall_system_reports_residuals() {
        let a = array(Nested::from(vec![vec![1, 2], vec![3, 4], vec![5, 6]]));
        let b = array(Nested::from(vec![1, 2, 3]));
        let result = lstsq(&a, &b).expect("tall");
        assert_close(&result.solution.values(), &[0.0, 0.5], 1e-10);
        assert_eq!(result.rank, 2);
        assert_eq!(result.residuals.shape(), &[1]);
        assert!(result.residuals.values()[0].abs() < 1e-20);
        assert_eq!(result.singular_values.shape(), &[2]);
    }

    #[test]
    fn lstsq_wide_system_is_minimum_norm() {
        let a = array(Nested::from(vec![vec![1, 2, 3], vec![3, 4, 6]]));
        let b = array(Nested::from(vec![1, 2]));
        let result = lstsq(&a, &b).expect("wide");
        assert_eq!(result.solution.shape(), &[3]);
        assert_eq!(result.residuals.shape(), &[0]);
        assert_eq!(result.rank, 2);
        let fitted = dot(&a, &result.solution)
            .expect("fit")
            .into_array()
            .expect("array");
        assert_close(&fitted.values(), &[1.0, 2.0], 1e-10);
        let reference = dot(&pinv(&a).expect("pinv"), &b)
            .expect("pinv b")
            .into_array()
            .expect("array");
        assert_close(&result.solution.values(), &reference.values(), 1e-10);
    }

    #[test]
    fn lstsq_rejects_mismatched_rhs() {
        let a = NdArray::ones(&[3, 2]).expect("a");
        let b = NdArray::ones(&[2]).expect("b");
        assert_eq!(lstsq(&a, &b).expect_err("rows").kind(), ErrorKind::Shape);
    }

    #[test]
    fn norm_of_vector_equals_frobenius_of_reshape() {
        let x = array(Nested::from(vec![1.0, 2.0, 3.0, 4.0]));
        let vector = norm(&x).expect("vector");
        assert!(approx_equal(vector, 30.0_f64.sqrt(), 1e-15));
        let matrix = norm(&x.reshape(&[2, 2]).expect("2x2")).expect("matrix");
        assert_eq!(vector, matrix);
    }

    #[test]
    fn norm_orders_follow_definitions() {
        let x = array(Nested::from(vec![3.0, -4.0]));
        let one = norm_with_order(&x, NormOrder::Vector(VectorNormOrder::One)).expect("1");
        assert!(approx_equal(one, 7.0, 1e-15));
        let inf = norm_with_order(&x, NormOrder::from_token("inf", 1).expect("inf")).expect("inf");
        assert!(approx_equal(inf, 4.0, 1e-15));

        let m = array(Nested::from(vec![vec![1.0, 3.0], vec![2.0, 4.0]]));
        let col = norm_with_order(&m, NormOrder::Matrix(MatrixNormOrder::One)).expect("1");
        assert!(approx_equal(col, 7.0, 1e-15));
        let row = norm_with_order(&m, NormOrder::Matrix(MatrixNormOrder::Inf)).expect("inf");
        assert!(approx_equal(row, 6.0, 1e-15));
        let min_col = norm_with_order(&m, NormOrder::from_token("-1", 2).expect("-1")).expect("-1");
        assert!(approx_equal(min_col, 3.0, 1e-15));
        let min_row =
            norm_with_order(&m, NormOrder::from_token("-inf", 2).expect("-inf")).expect("-inf");
        assert!(approx_equal(min_row, 4.0, 1e-15));
        let two = norm_with_order(&m, NormOrder::Matrix(MatrixNormOrder::Two)).expect("2");
        assert!(approx_equal(two, 5.464_985_704_219_042, 1e-12));
        let nuc = norm_with_order(&m, NormOrder::from_token("nuc", 2).expect("nuc")).expect("nuc");
        assert!(approx_equal(nuc, 5.464_985_704_219_042 + 0.365_966_190_626_257_8, 1e-12));

        let err = norm_with_order(&x, NormOrder::Matrix(MatrixNormOrder::Fro)).expect_err("rank");
        assert_eq!(err.kind(), ErrorKind::Value);
        let err = VectorNormOrder::from_token("fro").expect_err("token");
        assert_eq!(err.reason_code(), "linalg_norm_det_rank_policy_violation");
    }

    #[test]
    fn determinants_and_rank() {
        let x = array(Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
        assert!(approx_equal(det(&x).expect("det"), -2.0, 1e-12));
        let slog = slogdet(&x).expect("slogdet");
        assert_eq!(slog.sign, -1.0);
        assert!(approx_equal(slog.logabsdet, 2.0_f64.ln(), 1e-12));

        let singular = array(Nested::from(vec![vec![1.0, 1.0], vec![1.0, 1.0]]));
        assert_eq!(det(&singular).expect("det"), 0.0);
        let slog = slogdet(&singular).expect("slogdet");
        assert_eq!(slog.sign, 0.0);
        assert_eq!(slog.logabsdet, f64::NEG_INFINITY);

        assert_eq!(matrix_rank(&x).expect("rank"), 2);
        assert_eq!(matrix_rank(&singular).expect("rank"), 1);
        assert_eq!(
            matrix_rank(&NdArray::zeros(&[3]).expect("zeros")).expect("rank"),
            0
        );
    }

    #[test]
    fn column_dot_unrolls_over_rows() {
        let rows = 19;
        let columns = (0..3)
            .map(|c| (0..rows).map(|r| (r * 3 + c) as f64).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let frame = ColumnFrame::new(columns.clone()).expect("frame");
        let weights = [0.5, -1.0, 2.0];
        let out = dot_columns(&frame, &weights).expect("dot");
        assert_eq!(out.shape(), &[rows]);
        for (r, value) in out.values().into_iter().enumerate() {
            let expected: f64 = (0..3).map(|c| columns[c][r] * weights[c]).sum();
            assert!(approx_equal(value, expected, 1e-12), "row {r}");
        }

        let err = dot_columns(&frame, &[1.0]).expect_err("length");
        assert_eq!(err.kind(), ErrorKind::Shape);
        assert!(ColumnFrame::new(vec![vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
