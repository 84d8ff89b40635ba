use crate::EngineError;
use pnp_dtype::Scalar;
use pnp_ndarray::{Element, NdArray, Nested};

/// Anything that crosses the evaluation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(NdArray),
    Scalar(Scalar),
    Tuple(Vec<Value>),
    Shape(Vec<usize>),
    /// Host nested sequence, e.g. the result of `tolist` or an unvalidated
    /// construction literal.
    List(Nested),
    /// Option word such as an `eigh` triangle (`"U"`) or a norm order (`"fro"`).
    Token(String),
}

impl Value {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Scalar(_) => "scalar",
            Self::Tuple(_) => "tuple",
            Self::Shape(_) => "shape",
            Self::List(_) => "list",
            Self::Token(_) => "token",
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Token(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn array_from_nested(nested: &Nested) -> Result<Self, EngineError> {
        Ok(Self::Array(NdArray::from_nested(nested)?))
    }
}

impl From<NdArray> for Value {
    fn from(array: NdArray) -> Self {
        Self::Array(array)
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Self::Scalar(value)
    }
}

impl From<Element> for Value {
    fn from(element: Element) -> Self {
        match element {
            Element::Scalar(value) => Self::Scalar(value),
            Element::Array(array) => Self::Array(array),
        }
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Tuple(items)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array(array) => write!(f, "{array}"),
            Self::Scalar(value) => write!(f, "{value}"),
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Shape(dims) => write!(f, "{}", pnp_ndarray::Shape::from(dims.as_slice())),
            Self::List(nested) => write!(f, "{nested}"),
            Self::Token(text) => write!(f, "'{text}'"),
        }
    }
}
