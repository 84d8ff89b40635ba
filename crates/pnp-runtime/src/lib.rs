#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod evaluator;
pub mod ledger;
pub mod operation;
pub mod value;
pub mod wire;

use pnp_linalg::LinAlgError;
use pnp_ndarray::{ArrayError, ErrorKind};
use pnp_ufunc::UFuncError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use config::RuntimeConfig;
pub use engine::{ExecutionEngine, LocalEngine, RemoteValue, WorkerPool};
pub use evaluator::{Equivalence, Evaluator, Outcome, values_equivalent};
pub use ledger::{
    EvaluationEvent, EvaluationLedger, EvaluationOutcome, EvaluationPath, MAX_RETAINED_EVENTS,
    set_evaluation_log_path,
};
pub use operation::{FnJob, Job, Operation};
pub use value::Value;
pub use wire::{ArrayPayload, ValuePayload, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Strict,
    Hardened,
}

impl RuntimeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "hardened" => Some(Self::Hardened),
            _ => None,
        }
    }
}

/// Every failure an engine-side evaluation can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Array(ArrayError),
    UFunc(UFuncError),
    LinAlg(LinAlgError),
    InvalidArguments {
        operation: String,
        detail: &'static str,
    },
    UnknownOperation(String),
    UnknownHandle(u64),
    Config(String),
    Transport(String),
    /// A failure raised on the far side of an execution engine, carrying
    /// the original kind and message.
    Remote(WireError),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Array(err) => err.kind(),
            Self::UFunc(err) => err.kind(),
            Self::LinAlg(err) => err.kind(),
            Self::InvalidArguments { .. } | Self::UnknownOperation(_) | Self::Config(_) => {
                ErrorKind::Value
            }
            Self::UnknownHandle(_) | Self::Transport(_) => ErrorKind::Remote,
            Self::Remote(err) => err.kind,
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Array(err) => err.reason_code(),
            Self::UFunc(err) => err.reason_code(),
            Self::LinAlg(err) => err.reason_code(),
            Self::InvalidArguments { .. } => "engine_invalid_arguments",
            Self::UnknownOperation(_) => "engine_unknown_operation",
            Self::UnknownHandle(_) => "engine_unknown_handle",
            Self::Config(_) => "engine_config_invalid",
            Self::Transport(_) => "engine_transport_failure",
            Self::Remote(err) => &err.reason_code,
        }
    }

    pub(crate) fn invalid(operation: &str, detail: &'static str) -> Self {
        Self::InvalidArguments {
            operation: operation.to_string(),
            detail,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array(err) => write!(f, "{err}"),
            Self::UFunc(err) => write!(f, "{err}"),
            Self::LinAlg(err) => write!(f, "{err}"),
            Self::InvalidArguments { operation, detail } => {
                write!(f, "{operation}: {detail}")
            }
            Self::UnknownOperation(name) => write!(f, "unknown operation '{name}'"),
            Self::UnknownHandle(id) => write!(f, "no result stored for handle {id}"),
            Self::Config(msg) => write!(f, "invalid runtime configuration: {msg}"),
            Self::Transport(msg) => write!(f, "execution engine transport failed: {msg}"),
            Self::Remote(err) => write!(f, "{}", err.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ArrayError> for EngineError {
    fn from(err: ArrayError) -> Self {
        Self::Array(err)
    }
}

impl From<UFuncError> for EngineError {
    fn from(err: UFuncError) -> Self {
        Self::UFunc(err)
    }
}

impl From<LinAlgError> for EngineError {
    fn from(err: LinAlgError) -> Self {
        Self::LinAlg(err)
    }
}

impl From<WireError> for EngineError {
    fn from(err: WireError) -> Self {
        Self::Remote(err)
    }
}

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}
