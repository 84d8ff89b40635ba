#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Element types an array can carry. Each dtype has its own storage; booleans
/// interop as 0/1 under arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    I64,
    F64,
}

impl DType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I64 => "int64",
            Self::F64 => "float64",
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::I64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "bool" | "b1" => Some(Self::Bool),
            "i64" | "int64" | "int" => Some(Self::I64),
            "f64" | "float64" | "float" => Some(Self::F64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_bool(self) -> bool {
        matches!(self, Self::Bool)
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::I64)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Deterministic promotion: the wider kind wins (`bool < int64 < float64`).
#[must_use]
pub const fn promote(lhs: DType, rhs: DType) -> DType {
    use DType::*;

    match (lhs, rhs) {
        (F64, _) | (_, F64) => F64,
        (I64, _) | (_, I64) => I64,
        (Bool, Bool) => Bool,
    }
}

/// Promotion for `+ - * **`: booleans are lifted to integers first.
#[must_use]
pub const fn arithmetic_promote(lhs: DType, rhs: DType) -> DType {
    match promote(lhs, rhs) {
        DType::Bool => DType::I64,
        other => other,
    }
}

/// True division always produces floats.
#[must_use]
pub const fn promote_for_division(_lhs: DType, _rhs: DType) -> DType {
    DType::F64
}

#[must_use]
pub const fn can_cast_lossless(src: DType, dst: DType) -> bool {
    use DType::*;

    matches!(
        (src, dst),
        (Bool, Bool | I64 | F64) | (I64, I64 | F64) | (F64, F64)
    )
}

/// Result dtype across a list of dtypes; an empty list yields `float64`,
/// the dtype of an empty array literal.
#[must_use]
pub fn result_type(dtypes: &[DType]) -> DType {
    let mut iter = dtypes.iter().copied();
    match iter.next() {
        Some(first) => iter.fold(first, promote),
        None => DType::F64,
    }
}

/// A single host value. Serializes untagged so JSON `true`, `3` and `2.5`
/// map onto `Bool`, `Int` and `Float`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::I64,
            Self::Float(_) => DType::F64,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(value) => {
                if value {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    /// Integer view: booleans as 0/1, floats truncated toward zero and
    /// saturated at the `i64` range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Bool(value) => i64::from(value),
            Self::Int(value) => value,
            Self::Float(value) => value as i64,
        }
    }

    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(self.truthy()),
            DType::I64 => Self::Int(self.as_i64()),
            DType::F64 => Self::Float(self.as_f64()),
        }
    }

    /// Truthiness as the reference `all` sees it: zero and false are falsy,
    /// NaN and infinities are truthy.
    #[must_use]
    pub fn truthy(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::Int(value) => value != 0,
            Self::Float(value) => value != 0.0,
        }
    }

    #[must_use]
    pub fn is_nan(self) -> bool {
        matches!(self, Self::Float(value) if value.is_nan())
    }

    #[must_use]
    pub fn is_inf(self) -> bool {
        matches!(self, Self::Float(value) if value.is_infinite())
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        match self {
            Self::Bool(_) | Self::Int(_) => true,
            Self::Float(value) => value.is_finite(),
        }
    }

    /// Equality that treats two NaNs as equal and ignores the Int/Float tag
    /// when the numeric values agree.
    #[must_use]
    pub fn same_value(self, other: Self) -> bool {
        match (self, other) {
            (Self::Bool(lhs), Self::Bool(rhs)) => lhs == rhs,
            (Self::Int(lhs), Self::Int(rhs)) => lhs == rhs,
            _ => {
                let (lhs, rhs) = (self.as_f64(), other.as_f64());
                (lhs.is_nan() && rhs.is_nan()) || lhs == rhs
            }
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value:?}"),
        }
    }
}

/// Unifies the leaf dtypes found while walking a nested literal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DTypeInference {
    seen: Option<DType>,
}

impl DTypeInference {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, dtype: DType) {
        self.seen = Some(match self.seen {
            Some(current) => promote(current, dtype),
            None => dtype,
        });
    }

    #[must_use]
    pub fn finish(self) -> DType {
        self.seen.unwrap_or(DType::F64)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DType, DTypeInference, Scalar, arithmetic_promote, can_cast_lossless, promote,
        promote_for_division, result_type,
    };

    const ALL: [DType; 3] = [DType::Bool, DType::I64, DType::F64];

    #[test]
    fn promotion_is_commutative() {
        for &lhs in &ALL {
            for &rhs in &ALL {
                assert_eq!(promote(lhs, rhs), promote(rhs, lhs), "{lhs:?}/{rhs:?}");
            }
        }
    }

    #[test]
    fn promotion_expectations_hold() {
        assert_eq!(promote(DType::Bool, DType::I64), DType::I64);
        assert_eq!(promote(DType::I64, DType::F64), DType::F64);
        assert_eq!(promote(DType::Bool, DType::Bool), DType::Bool);
        assert_eq!(arithmetic_promote(DType::Bool, DType::Bool), DType::I64);
        assert_eq!(arithmetic_promote(DType::I64, DType::I64), DType::I64);
        assert_eq!(promote_for_division(DType::I64, DType::I64), DType::F64);
    }

    #[test]
    fn promotion_targets_are_lossless_casts() {
        for &lhs in &ALL {
            for &rhs in &ALL {
                let out = promote(lhs, rhs);
                assert!(can_cast_lossless(lhs, out), "{lhs:?}->{out:?}");
                assert!(can_cast_lossless(rhs, out), "{rhs:?}->{out:?}");
            }
        }
        assert!(!can_cast_lossless(DType::F64, DType::I64));
    }

    #[test]
    fn parse_accepts_canonical_and_short_names() {
        for dtype in ALL {
            assert_eq!(DType::parse(dtype.name()), Some(dtype));
        }
        assert_eq!(DType::parse("f64"), Some(DType::F64));
        assert_eq!(DType::parse("complex128"), None);
    }

    #[test]
    fn result_type_of_nothing_is_float() {
        assert_eq!(result_type(&[]), DType::F64);
        assert_eq!(result_type(&[DType::Bool, DType::I64]), DType::I64);
    }

    #[test]
    fn inference_unifies_leaf_types() {
        let mut inference = DTypeInference::new();
        assert_eq!(inference.finish(), DType::F64);
        inference.observe(DType::Bool);
        assert_eq!(inference.finish(), DType::Bool);
        inference.observe(DType::I64);
        assert_eq!(inference.finish(), DType::I64);
        inference.observe(DType::F64);
        inference.observe(DType::Bool);
        assert_eq!(inference.finish(), DType::F64);
    }

    #[test]
    fn truthiness_matches_reference_all() {
        assert!(Scalar::Int(1).truthy());
        assert!(Scalar::Float(2.0).truthy());
        assert!(!Scalar::Float(0.0).truthy());
        assert!(!Scalar::Float(-0.0).truthy());
        assert!(Scalar::Bool(true).truthy());
        assert!(!Scalar::Bool(false).truthy());
        assert!(Scalar::Float(f64::NAN).truthy());
        assert!(Scalar::Float(f64::INFINITY).truthy());
        assert!(Scalar::Float(f64::NEG_INFINITY).truthy());
    }

    #[test]
    fn ieee_predicates_follow_element_kind() {
        let nan = Scalar::Float(f64::NAN);
        let neg_nan = Scalar::Float(-f64::NAN);
        let inf = Scalar::Float(f64::INFINITY);
        assert!(nan.is_nan() && !nan.is_finite() && !nan.is_inf());
        assert!(neg_nan.is_nan());
        assert!(inf.is_inf() && !inf.is_finite() && !inf.is_nan());
        assert!(Scalar::Int(1).is_finite() && !Scalar::Int(1).is_nan());
        assert!(Scalar::Float(2.0).is_finite());
        assert!(Scalar::Bool(true).is_finite());
    }

    #[test]
    fn casts_follow_the_target_dtype() {
        assert_eq!(Scalar::Float(1.0).cast(DType::Bool), Scalar::Bool(true));
        assert_eq!(Scalar::Float(-7.9).cast(DType::I64), Scalar::Int(-7));
        assert_eq!(Scalar::Bool(true).cast(DType::F64), Scalar::Float(1.0));
        assert_eq!(Scalar::Int(3).cast(DType::F64), Scalar::Float(3.0));
        let big = Scalar::Int(9_007_199_254_740_993);
        assert_eq!(big.cast(DType::I64), big, "integer casts never pass through f64");
        assert_eq!(big.as_i64(), 9_007_199_254_740_993);
        assert!(!big.same_value(Scalar::Int(9_007_199_254_740_992)));
        assert!(Scalar::Int(3).same_value(Scalar::Float(3.0)));
        assert!(Scalar::Float(f64::NAN).same_value(Scalar::Float(f64::NAN)));
    }

    #[test]
    fn json_literals_map_onto_tags() {
        let parsed: Vec<Scalar> =
            serde_json::from_str("[true, 3, 2.5, -1, 1e300]").expect("valid scalars");
        assert_eq!(
            parsed,
            vec![
                Scalar::Bool(true),
                Scalar::Int(3),
                Scalar::Float(2.5),
                Scalar::Int(-1),
                Scalar::Float(1e300),
            ]
        );
        let rendered = serde_json::to_string(&Scalar::Float(2.0)).expect("serialize");
        assert_eq!(rendered, "2.0");
    }
}
