#![forbid(unsafe_code)]

use pnp_dtype::Scalar;
use pnp_linalg::{dot, inv};
use pnp_ndarray::{ErrorKind, NdArray, Nested};
use pnp_runtime::{
    Equivalence, Evaluator, Job, Operation, RuntimeConfig, RuntimeMode, Value, WorkerPool,
    values_equivalent,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const EQUIVALENCE_LOG_ENV: &str = "PNP_EQUIVALENCE_LOG_PATH";

const EQUIVALENCE_FIXTURE: &str = "equivalence_cases.json";
const ERROR_PARITY_FIXTURE: &str = "error_parity_cases.json";
const PROPERTY_FIXTURE: &str = "property_cases.json";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
    pub workers: usize,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
            workers: 2,
        }
    }

    #[must_use]
    pub fn mode(&self) -> RuntimeMode {
        if self.strict_mode {
            RuntimeMode::Strict
        } else {
            RuntimeMode::Hardened
        }
    }

    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default()
            .with_mode(self.mode())
            .with_workers(self.workers)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    pub pass_count: usize,
    pub failures: Vec<String>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }

    fn new(suite: &'static str, case_count: usize) -> Self {
        Self {
            suite,
            case_count,
            pass_count: 0,
            failures: Vec::new(),
        }
    }
}

/// Argument or expectation as written in a fixture, externally tagged:
/// `{"array": [[1, 2], [3, 4]]}`, `{"scalar": 2.5}`, `{"shape": [2, 3]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureValue {
    Array(Nested),
    Scalar(Scalar),
    Shape(Vec<usize>),
    List(Nested),
    Tuple(Vec<FixtureValue>),
    Token(String),
}

impl FixtureValue {
    pub fn to_value(&self) -> Result<Value, String> {
        Ok(match self {
            Self::Array(nested) => Value::Array(
                NdArray::from_nested(nested)
                    .map_err(|err| format!("fixture array rejected: {err}"))?,
            ),
            Self::Scalar(value) => Value::Scalar(*value),
            Self::Shape(dims) => Value::Shape(dims.clone()),
            Self::List(nested) => Value::List(nested.clone()),
            Self::Token(text) => Value::Token(text.clone()),
            Self::Tuple(items) => Value::Tuple(
                items
                    .iter()
                    .map(Self::to_value)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EquivalenceCase {
    id: String,
    op: String,
    args: Vec<FixtureValue>,
    expected: FixtureValue,
}

#[derive(Debug, Deserialize)]
struct ExpectedError {
    kind: ErrorKind,
    #[serde(default)]
    message_contains: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorParityCase {
    id: String,
    op: String,
    args: Vec<FixtureValue>,
    expected_error: ExpectedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Property {
    NestedRoundTrip,
    ReshapeIdentity,
    FlattenPreservesOrder,
    InverseIdentity,
}

#[derive(Debug, Deserialize)]
struct PropertyCase {
    id: String,
    property: Property,
    array: Nested,
}

#[derive(Debug, Serialize)]
struct EquivalenceLogEntry {
    suite: &'static str,
    fixture_id: String,
    op: String,
    mode: String,
    reason_code: String,
    passed: bool,
}

static EQUIVALENCE_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_equivalence_log_path(path: Option<PathBuf>) {
    let cell = EQUIVALENCE_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

fn load_cases<T: DeserializeOwned>(fixture_root: &Path, name: &str) -> Result<Vec<T>, String> {
    let path = fixture_root.join(name);
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid json in {name}: {err}"))
}

pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|entries| entries.flatten())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
    }
}

fn parse_job(op: &str) -> Result<Arc<dyn Job>, String> {
    Operation::parse(op)
        .map(|op| Arc::new(op) as Arc<dyn Job>)
        .map_err(|err| err.to_string())
}

fn parse_args(args: &[FixtureValue]) -> Result<Vec<Value>, String> {
    args.iter().map(FixtureValue::to_value).collect()
}

fn equivalence_reason(report: &Equivalence) -> String {
    match report {
        Equivalence::Values(_) => "ok".to_string(),
        Equivalence::Errors { kind, .. } => format!("error_{}", kind.as_str()),
        Equivalence::Diverged { .. } => "local_remote_divergence".to_string(),
    }
}

/// Every case runs locally and through a worker pool; both must agree with
/// each other and with the fixture's expected value.
pub fn run_equivalence_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let cases: Vec<EquivalenceCase> = load_cases(&config.fixture_root, EQUIVALENCE_FIXTURE)?;
    let evaluator = Evaluator::<WorkerPool>::from_config(config.runtime_config())
        .map_err(|err| err.to_string())?;
    let mut report = SuiteReport::new("equivalence", cases.len());

    for case in cases {
        let job = parse_job(&case.op)?;
        let args = parse_args(&case.args)?;
        let expected = case.expected.to_value()?;
        let outcome = evaluator.evaluate_both(job, &args);

        let failure = match &outcome {
            Equivalence::Values(actual) if values_equivalent(actual, &expected) => None,
            Equivalence::Values(actual) => Some(format!("expected {expected}, got {actual}")),
            Equivalence::Errors { kind, message } => {
                Some(format!("unexpected {} error: {message}", kind.as_str()))
            }
            Equivalence::Diverged { reason, .. } => Some(format!("paths diverged: {reason}")),
        };
        let passed = failure.is_none();
        if let Some(failure) = failure {
            report.failures.push(format!("{}: {failure}", case.id));
        } else {
            report.pass_count += 1;
        }

        maybe_append_equivalence_log(&EquivalenceLogEntry {
            suite: "equivalence",
            fixture_id: case.id,
            op: case.op,
            mode: config.mode().as_str().to_string(),
            reason_code: equivalence_reason(&outcome),
            passed,
        })?;
    }

    Ok(report)
}

/// Each case must fail identically on both paths with the fixture's kind.
pub fn run_error_parity_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let cases: Vec<ErrorParityCase> = load_cases(&config.fixture_root, ERROR_PARITY_FIXTURE)?;
    let evaluator = Evaluator::<WorkerPool>::from_config(config.runtime_config())
        .map_err(|err| err.to_string())?;
    let mut report = SuiteReport::new("error_parity", cases.len());

    for case in cases {
        let job = parse_job(&case.op)?;
        let args = parse_args(&case.args)?;
        let outcome = evaluator.evaluate_both(job, &args);

        let failure = match &outcome {
            Equivalence::Errors { kind, message } => {
                if *kind != case.expected_error.kind {
                    Some(format!(
                        "expected {} error, got {}: {message}",
                        case.expected_error.kind.as_str(),
                        kind.as_str()
                    ))
                } else {
                    case.expected_error
                        .message_contains
                        .as_deref()
                        .filter(|needle| !message.contains(needle))
                        .map(|needle| format!("message '{message}' lacks '{needle}'"))
                }
            }
            Equivalence::Values(value) => Some(format!("expected an error, got {value}")),
            Equivalence::Diverged { reason, .. } => Some(format!("paths diverged: {reason}")),
        };
        let passed = failure.is_none();
        if let Some(failure) = failure {
            report.failures.push(format!("{}: {failure}", case.id));
        } else {
            report.pass_count += 1;
        }

        maybe_append_equivalence_log(&EquivalenceLogEntry {
            suite: "error_parity",
            fixture_id: case.id,
            op: case.op,
            mode: config.mode().as_str().to_string(),
            reason_code: equivalence_reason(&outcome),
            passed,
        })?;
    }

    Ok(report)
}

fn check_property(property: Property, array: &NdArray, nested: &Nested) -> Result<(), String> {
    match property {
        Property::NestedRoundTrip => {
            if array.to_nested().same_value(nested) {
                Ok(())
            } else {
                Err(format!("to_nested gave {}", array.to_nested()))
            }
        }
        Property::ReshapeIdentity => {
            let reshaped = array.reshape(array.shape()).map_err(|err| err.to_string())?;
            if reshaped.to_nested().same_value(&array.to_nested()) {
                Ok(())
            } else {
                Err("reshape to own shape changed the data".to_string())
            }
        }
        Property::FlattenPreservesOrder => {
            let flat = array.flatten();
            if flat.size() == array.size() && flat.elements() == array.elements() {
                Ok(())
            } else {
                Err(format!("flatten gave {flat}"))
            }
        }
        Property::InverseIdentity => {
            let inverse = inv(array).map_err(|err| err.to_string())?;
            let product = dot(array, &inverse)
                .map_err(|err| err.to_string())?
                .into_array()
                .ok_or_else(|| "dot returned a scalar".to_string())?;
            let n = array.shape()[0];
            let identity = NdArray::eye(n, n).map_err(|err| err.to_string())?;
            if values_equivalent(&Value::Array(product.clone()), &Value::Array(identity)) {
                Ok(())
            } else {
                Err(format!("a . inv(a) = {product}"))
            }
        }
    }
}

/// Metamorphic checks over fixture arrays, run in-process.
pub fn run_property_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let cases: Vec<PropertyCase> = load_cases(&config.fixture_root, PROPERTY_FIXTURE)?;
    let mut report = SuiteReport::new("property", cases.len());

    for case in cases {
        let result = NdArray::from_nested(&case.array)
            .map_err(|err| err.to_string())
            .and_then(|array| check_property(case.property, &array, &case.array));
        let passed = result.is_ok();
        match result {
            Ok(()) => report.pass_count += 1,
            Err(failure) => report.failures.push(format!("{}: {failure}", case.id)),
        }

        maybe_append_equivalence_log(&EquivalenceLogEntry {
            suite: "property",
            fixture_id: case.id,
            op: format!("{:?}", case.property),
            mode: config.mode().as_str().to_string(),
            reason_code: if passed { "ok" } else { "property_violated" }.to_string(),
            passed,
        })?;
    }

    Ok(report)
}

pub fn run_all_core_suites(config: &HarnessConfig) -> Result<Vec<SuiteReport>, String> {
    Ok(vec![
        run_equivalence_suite(config)?,
        run_error_parity_suite(config)?,
        run_property_suite(config)?,
    ])
}

fn maybe_append_equivalence_log(entry: &EquivalenceLogEntry) -> Result<(), String> {
    let configured = EQUIVALENCE_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(EQUIVALENCE_LOG_ENV).map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing equivalence log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload).map_err(|err| {
        format!(
            "failed appending equivalence log {}: {err}",
            path.display()
        )
    })
}
