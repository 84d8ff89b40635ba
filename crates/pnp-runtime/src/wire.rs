//! In-process shipment format used between a caller and worker threads.
//!
//! Buffers travel as little-endian bytes in base64 with a sha256 digest:
//! eight bytes per `float64` or `int64` element, one per `bool`. Scalars
//! use the same encoding, so NaN, the infinities and every `int64` survive
//! the JSON framing.

use crate::{EngineError, Value};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pnp_dtype::{DType, Scalar};
use pnp_ndarray::{Elements, ErrorKind, NdArray, Nested};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub reason_code: String,
    pub message: String,
}

impl WireError {
    #[must_use]
    pub fn from_engine_error(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            reason_code: err.reason_code().to_string(),
            message: err.to_string(),
        }
    }

    fn codec(reason_code: &str, message: String) -> Self {
        Self {
            kind: ErrorKind::Remote,
            reason_code: reason_code.to_string(),
            message,
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.reason_code, self.kind.as_str(), self.message)
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayPayload {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub data_b64: String,
    pub data_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValuePayload {
    Array(ArrayPayload),
    Scalar { dtype: String, data_b64: String },
    Tuple { items: Vec<ValuePayload> },
    Shape { dims: Vec<usize> },
    List { items: Vec<ValuePayload> },
    Token { text: String },
}

/// Unit of work shipped to a worker: the job name plus encoded arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job: String,
    pub args: Vec<ValuePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyPayload {
    Ok { value: ValuePayload },
    Err { error: WireError },
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn encode_elements(elements: &Elements) -> Vec<u8> {
    match elements {
        Elements::Bool(values) => values.iter().map(|&flag| u8::from(flag)).collect(),
        Elements::I64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        Elements::F64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn words(bytes: &[u8]) -> impl Iterator<Item = [u8; 8]> + '_ {
    bytes.chunks_exact(8).map(|chunk| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        raw
    })
}

/// Callers check `bytes.len()` against the dtype's item size first.
fn decode_elements(dtype: DType, bytes: &[u8]) -> Elements {
    match dtype {
        DType::Bool => Elements::Bool(bytes.iter().map(|&byte| byte != 0).collect()),
        DType::I64 => Elements::I64(words(bytes).map(i64::from_le_bytes).collect()),
        DType::F64 => Elements::F64(words(bytes).map(f64::from_le_bytes).collect()),
    }
}

fn parse_dtype(name: &str) -> Result<DType, WireError> {
    DType::parse(name)
        .ok_or_else(|| WireError::codec("wire_unknown_dtype", format!("unknown dtype '{name}'")))
}

fn decode_b64(data: &str) -> Result<Vec<u8>, WireError> {
    BASE64
        .decode(data)
        .map_err(|err| WireError::codec("wire_base64_invalid", format!("base64 decode failed: {err}")))
}

fn encode_scalar(value: Scalar) -> ValuePayload {
    ValuePayload::Scalar {
        dtype: value.dtype().name().to_string(),
        data_b64: BASE64.encode(encode_elements(&Elements::from_scalars(
            value.dtype(),
            &[value],
        ))),
    }
}

fn encode_nested(nested: &Nested) -> ValuePayload {
    match nested {
        Nested::Scalar(value) => encode_scalar(*value),
        Nested::List(items) => ValuePayload::List {
            items: items.iter().map(encode_nested).collect(),
        },
    }
}

#[must_use]
pub fn encode_array(array: &NdArray) -> ArrayPayload {
    let bytes = encode_elements(&array.elements());
    ArrayPayload {
        shape: array.shape().to_vec(),
        dtype: array.dtype().name().to_string(),
        data_sha256: sha256_hex(&bytes),
        data_b64: BASE64.encode(&bytes),
    }
}

#[must_use]
pub fn encode_value(value: &Value) -> ValuePayload {
    match value {
        Value::Array(array) => ValuePayload::Array(encode_array(array)),
        Value::Scalar(scalar) => encode_scalar(*scalar),
        Value::Tuple(items) => ValuePayload::Tuple {
            items: items.iter().map(encode_value).collect(),
        },
        Value::Shape(dims) => ValuePayload::Shape { dims: dims.clone() },
        Value::List(nested) => encode_nested(nested),
        Value::Token(text) => ValuePayload::Token { text: text.clone() },
    }
}

pub fn decode_array(payload: &ArrayPayload, verify_digest: bool) -> Result<NdArray, WireError> {
    let dtype = parse_dtype(&payload.dtype)?;
    let bytes = decode_b64(&payload.data_b64)?;
    if verify_digest && sha256_hex(&bytes) != payload.data_sha256 {
        return Err(WireError::codec(
            "wire_digest_mismatch",
            "array payload digest does not match its data".to_string(),
        ));
    }
    let expected = payload
        .shape
        .iter()
        .try_fold(dtype.item_size(), |acc, &dim| acc.checked_mul(dim));
    if expected != Some(bytes.len()) {
        return Err(WireError::codec(
            "wire_length_mismatch",
            format!(
                "array payload holds {} bytes, shape {:?} needs {}",
                bytes.len(),
                payload.shape,
                expected.map_or_else(|| "overflow".to_string(), |n| n.to_string())
            ),
        ));
    }
    NdArray::from_elements(payload.shape.clone(), decode_elements(dtype, &bytes))
        .map_err(|err| WireError::codec("wire_array_invalid", err.to_string()))
}

fn decode_scalar(dtype: &str, data_b64: &str) -> Result<Scalar, WireError> {
    let dtype = parse_dtype(dtype)?;
    let bytes = decode_b64(data_b64)?;
    let length_mismatch = || {
        WireError::codec(
            "wire_length_mismatch",
            format!(
                "scalar payload holds {} bytes, expected {}",
                bytes.len(),
                dtype.item_size()
            ),
        )
    };
    if bytes.len() != dtype.item_size() {
        return Err(length_mismatch());
    }
    decode_elements(dtype, &bytes)
        .scalars()
        .first()
        .copied()
        .ok_or_else(length_mismatch)
}

fn decode_nested(payload: &ValuePayload) -> Result<Nested, WireError> {
    match payload {
        ValuePayload::Scalar { dtype, data_b64 } => {
            Ok(Nested::Scalar(decode_scalar(dtype, data_b64)?))
        }
        ValuePayload::List { items } => Ok(Nested::List(
            items.iter().map(decode_nested).collect::<Result<_, _>>()?,
        )),
        _ => Err(WireError::codec(
            "wire_list_invalid",
            "list payloads may only hold scalars and lists".to_string(),
        )),
    }
}

pub fn decode_value(payload: &ValuePayload, verify_digest: bool) -> Result<Value, WireError> {
    match payload {
        ValuePayload::Array(array) => decode_array(array, verify_digest).map(Value::Array),
        ValuePayload::Scalar { dtype, data_b64 } => {
            decode_scalar(dtype, data_b64).map(Value::Scalar)
        }
        ValuePayload::Tuple { items } => Ok(Value::Tuple(
            items
                .iter()
                .map(|item| decode_value(item, verify_digest))
                .collect::<Result<_, _>>()?,
        )),
        ValuePayload::Shape { dims } => Ok(Value::Shape(dims.clone())),
        ValuePayload::List { .. } => decode_nested(payload).map(Value::List),
        ValuePayload::Token { text } => Ok(Value::Token(text.clone())),
    }
}

pub fn encode_frame<T: Serialize>(payload: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(payload)
        .map_err(|err| WireError::codec("wire_frame_encode_failed", err.to_string()))
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes)
        .map_err(|err| WireError::codec("wire_frame_decode_failed", err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        ReplyPayload, TaskPayload, ValuePayload, WireError, decode_array, decode_frame,
        decode_value, encode_array, encode_frame, encode_value,
    };
    use crate::{EngineError, Value};
    use pnp_dtype::{DType, Scalar};
    use pnp_linalg::LinAlgError;
    use pnp_ndarray::{ErrorKind, NdArray, Nested};

    fn sample() -> NdArray {
        NdArray::from_nested(&Nested::from(vec![
            vec![1.0, f64::NAN],
            vec![f64::INFINITY, -0.0],
        ]))
        .expect("sample")
    }

    #[test]
    fn array_payload_survives_json_framing() {
        let value = Value::Tuple(vec![
            Value::Array(sample().transpose()),
            Value::Scalar(Scalar::Float(f64::NEG_INFINITY)),
            Value::Scalar(Scalar::Int(-7)),
            Value::Shape(vec![2, 9]),
            Value::List(Nested::from(vec![vec![true, false]])),
        ]);
        let frame = encode_frame(&encode_value(&value)).expect("encode");
        let payload: ValuePayload = decode_frame(&frame).expect("decode frame");
        let Value::Tuple(items) = decode_value(&payload, true).expect("decode value") else {
            panic!("tuple expected");
        };
        let array = items[0].as_array().expect("array");
        assert_eq!(array.shape(), &[2, 2]);
        let values = array.values();
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], f64::INFINITY);
        assert!(values[2].is_nan());
        assert!(values[3] == 0.0 && values[3].is_sign_negative());
        assert_eq!(items[1], Value::Scalar(Scalar::Float(f64::NEG_INFINITY)));
        assert_eq!(items[2], Value::Scalar(Scalar::Int(-7)));
        assert_eq!(items[3], Value::Shape(vec![2, 9]));
        assert_eq!(items[4], Value::List(Nested::from(vec![vec![true, false]])));
    }

    #[test]
    fn dtype_is_preserved() {
        let ints = NdArray::from_nested(&Nested::from(vec![1, 2, 3])).expect("ints");
        let payload = encode_array(&ints);
        assert_eq!(payload.dtype, "int64");
        let decoded = decode_array(&payload, true).expect("decode");
        assert_eq!(decoded.dtype(), DType::I64);
        assert_eq!(decoded, ints);

        let flags = NdArray::from_nested(&Nested::from(vec![true, false, true])).expect("bools");
        let payload = encode_array(&flags);
        assert_eq!(payload.dtype, "bool");
        assert_eq!(decode_array(&payload, true).expect("decode"), flags);
    }

    #[test]
    fn int64_survives_the_wire_exactly() {
        let big = 9_007_199_254_740_993_i64;
        let ints = NdArray::from_nested(&Nested::from(vec![big, i64::MAX, i64::MIN]))
            .expect("ints");
        let value = Value::Tuple(vec![
            Value::Array(ints.clone()),
            Value::Scalar(Scalar::Int(big)),
            Value::List(Nested::from(vec![i64::MAX])),
        ]);
        let frame = encode_frame(&encode_value(&value)).expect("encode");
        let payload: ValuePayload = decode_frame(&frame).expect("decode frame");
        let decoded = decode_value(&payload, true).expect("decode value");
        assert_eq!(decoded, value);
        let Value::Tuple(items) = decoded else {
            panic!("tuple expected");
        };
        assert_eq!(items[0].as_array().expect("array").ints(), ints.ints());
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let mut payload = encode_array(&sample());
        payload.data_sha256 = "0".repeat(64);
        let err = decode_array(&payload, true).expect_err("digest");
        assert_eq!(err.reason_code, "wire_digest_mismatch");
        assert_eq!(err.kind, ErrorKind::Remote);
        decode_array(&payload, false).expect("digest not checked in strict mode");

        let mut payload = encode_array(&sample());
        payload.shape = vec![3, 2];
        let err = decode_array(&payload, false).expect_err("length");
        assert_eq!(err.reason_code, "wire_length_mismatch");

        let mut payload = encode_array(&sample());
        payload.dtype = "complex128".to_string();
        let err = decode_array(&payload, false).expect_err("dtype");
        assert_eq!(err.reason_code, "wire_unknown_dtype");

        let mut payload = encode_array(&sample());
        payload.dtype = "bool".to_string();
        let err = decode_array(&payload, false).expect_err("item size");
        assert_eq!(err.reason_code, "wire_length_mismatch");
    }

    #[test]
    fn task_and_reply_frames_round_trip() {
        let task = TaskPayload {
            job: "inv".to_string(),
            args: vec![encode_value(&Value::Array(sample()))],
        };
        let decoded: TaskPayload = decode_frame(&encode_frame(&task).expect("encode")).expect("decode");
        assert_eq!(decoded, task);

        let error = WireError::from_engine_error(&EngineError::from(LinAlgError::SingularMatrix));
        let reply = ReplyPayload::Err { error };
        let bytes = encode_frame(&reply).expect("encode");
        let decoded: ReplyPayload = decode_frame(&bytes).expect("decode");
        let ReplyPayload::Err { error } = decoded else {
            panic!("error reply expected");
        };
        assert_eq!(error.kind, ErrorKind::SingularMatrix);
        assert_eq!(error.message, "matrix was singular");

        let err = decode_frame::<ReplyPayload>(b"{not json").expect_err("garbage");
        assert_eq!(err.reason_code, "wire_frame_decode_failed");
    }
}
