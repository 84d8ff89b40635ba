use crate::ledger::{EvaluationEvent, EvaluationLedger, EvaluationPath};
use crate::{EngineError, ExecutionEngine, Job, RuntimeConfig, Value, WorkerPool};
use pnp_dtype::Scalar;
use pnp_ndarray::{ErrorKind, NdArray, Nested};
use std::sync::Arc;

pub type Outcome = Result<Value, EngineError>;

pub const RELATIVE_TOLERANCE: f64 = 1e-5;
pub const ABSOLUTE_TOLERANCE: f64 = 1e-8;

/// Result of running one job down both paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Equivalence {
    /// Both paths produced equivalent values; the local one is kept.
    Values(Value),
    /// Both paths failed with the same kind and message.
    Errors { kind: ErrorKind, message: String },
    Diverged {
        local: Outcome,
        remote: Outcome,
        reason: String,
    },
}

impl Equivalence {
    #[must_use]
    pub fn is_equivalent(&self) -> bool {
        !matches!(self, Self::Diverged { .. })
    }
}

/// Observational equivalence of two values: exact for integer and boolean
/// data, within tolerance for floats, NaN matching NaN.
#[must_use]
pub fn values_equivalent(lhs: &Value, rhs: &Value) -> bool {
    divergence(lhs, rhs).is_none()
}

fn floats_close(lhs: f64, rhs: f64) -> bool {
    if lhs.is_nan() || rhs.is_nan() {
        return lhs.is_nan() && rhs.is_nan();
    }
    if lhs.is_infinite() || rhs.is_infinite() {
        return lhs == rhs;
    }
    (lhs - rhs).abs() <= ABSOLUTE_TOLERANCE + RELATIVE_TOLERANCE * rhs.abs()
}

fn scalars_equivalent(lhs: Scalar, rhs: Scalar) -> bool {
    match (lhs, rhs) {
        (Scalar::Float(a), Scalar::Float(b)) => floats_close(a, b),
        _ => lhs.same_value(rhs),
    }
}

fn array_divergence(lhs: &NdArray, rhs: &NdArray) -> Option<String> {
    if lhs.dtype() != rhs.dtype() {
        return Some(format!(
            "dtype {} != {}",
            lhs.dtype().name(),
            rhs.dtype().name()
        ));
    }
    if lhs.shape() != rhs.shape() {
        return Some(format!("shape {} != {}", lhs.layout(), rhs.layout()));
    }
    lhs.scalars()
        .into_iter()
        .zip(rhs.scalars())
        .position(|(a, b)| !scalars_equivalent(a, b))
        .map(|flat| format!("element {flat} differs"))
}

fn nested_equivalent(lhs: &Nested, rhs: &Nested) -> bool {
    match (lhs, rhs) {
        (Nested::Scalar(a), Nested::Scalar(b)) => scalars_equivalent(*a, *b),
        (Nested::List(a), Nested::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| nested_equivalent(x, y))
        }
        _ => false,
    }
}

fn divergence(lhs: &Value, rhs: &Value) -> Option<String> {
    match (lhs, rhs) {
        (Value::Array(a), Value::Array(b)) => array_divergence(a, b),
        (Value::Scalar(a), Value::Scalar(b)) => {
            (!scalars_equivalent(*a, *b)).then(|| format!("scalar {a} != {b}"))
        }
        (Value::Shape(a), Value::Shape(b)) => (a != b).then(|| format!("shape {a:?} != {b:?}")),
        (Value::Token(a), Value::Token(b)) => (a != b).then(|| format!("token {a} != {b}")),
        (Value::List(a), Value::List(b)) => {
            (!nested_equivalent(a, b)).then(|| "nested lists differ".to_string())
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            if a.len() != b.len() {
                return Some(format!("tuple arity {} != {}", a.len(), b.len()));
            }
            a.iter()
                .zip(b)
                .enumerate()
                .find_map(|(idx, (x, y))| divergence(x, y).map(|why| format!("item {idx}: {why}")))
        }
        _ => Some(format!("{} != {}", lhs.kind_name(), rhs.kind_name())),
    }
}

/// Runs jobs in-process and through an [`ExecutionEngine`], recording
/// every evaluation in its ledger.
#[derive(Debug)]
pub struct Evaluator<E> {
    engine: E,
    config: RuntimeConfig,
    ledger: EvaluationLedger,
}

impl Evaluator<WorkerPool> {
    pub fn from_config(config: RuntimeConfig) -> Result<Self, EngineError> {
        Ok(Self::new(WorkerPool::from_config(&config)?, config))
    }
}

impl<E: ExecutionEngine> Evaluator<E> {
    pub fn new(engine: E, config: RuntimeConfig) -> Self {
        Self {
            engine,
            config,
            ledger: EvaluationLedger::new(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &EvaluationLedger {
        &self.ledger
    }

    fn record(&self, job: &str, path: EvaluationPath, outcome: &Outcome) {
        self.ledger.record(EvaluationEvent::new(
            job,
            path,
            self.config.mode,
            outcome.as_ref().map(|_| ()),
        ));
    }

    pub fn evaluate_local(&self, job: &dyn Job, args: &[Value]) -> Outcome {
        let outcome = job.run(args);
        self.record(job.name(), EvaluationPath::Local, &outcome);
        outcome
    }

    pub fn evaluate_remote(&self, job: Arc<dyn Job>, args: &[Value]) -> Outcome {
        let name = job.name().to_string();
        let outcome = self
            .engine
            .submit(job, args)
            .and_then(|handle| self.engine.download(handle));
        self.record(&name, EvaluationPath::Remote, &outcome);
        outcome
    }

    pub fn evaluate_both(&self, job: Arc<dyn Job>, args: &[Value]) -> Equivalence {
        let local = self.evaluate_local(job.as_ref(), args);
        let remote = self.evaluate_remote(job, args);
        compare_outcomes(local, remote)
    }
}

/// Classifies a local/remote outcome pair.
#[must_use]
pub fn compare_outcomes(local: Outcome, remote: Outcome) -> Equivalence {
    match (local, remote) {
        (Ok(lhs), Ok(rhs)) => match divergence(&lhs, &rhs) {
            None => Equivalence::Values(lhs),
            Some(reason) => Equivalence::Diverged {
                local: Ok(lhs),
                remote: Ok(rhs),
                reason,
            },
        },
        (Err(lhs), Err(rhs)) => {
            let (lhs_message, rhs_message) = (lhs.to_string(), rhs.to_string());
            if lhs.kind() == rhs.kind() && lhs_message == rhs_message {
                return Equivalence::Errors {
                    kind: lhs.kind(),
                    message: lhs_message,
                };
            }
            let reason = format!(
                "local {}: {lhs_message} / remote {}: {rhs_message}",
                lhs.kind().as_str(),
                rhs.kind().as_str()
            );
            Equivalence::Diverged {
                local: Err(lhs),
                remote: Err(rhs),
                reason,
            }
        }
        (Ok(value), Err(err)) => Equivalence::Diverged {
            reason: format!("only remote failed: {}", err.reason_code()),
            local: Ok(value),
            remote: Err(err),
        },
        (Err(err), Ok(value)) => Equivalence::Diverged {
            reason: format!("only local failed: {}", err.reason_code()),
            local: Err(err),
            remote: Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{Equivalence, Evaluator, compare_outcomes, values_equivalent};
    use crate::ledger::{EvaluationOutcome, EvaluationPath};
    use crate::{EngineError, FnJob, Job, LocalEngine, Operation, RuntimeConfig, Value};
    use pnp_dtype::{DType, Scalar};
    use pnp_ndarray::{ErrorKind, NdArray, Nested};
    use pnp_ufunc::BinaryOp;
    use std::sync::Arc;

    fn array(nested: Nested) -> Value {
        Value::Array(NdArray::from_nested(&nested).expect("fixture"))
    }

    #[test]
    fn float_values_compare_within_tolerance() {
        let a = array(Nested::from(vec![1.0, f64::NAN, 1e9]));
        let b = array(Nested::from(vec![1.0 + 1e-9, f64::NAN, 1e9 + 1.0]));
        assert!(values_equivalent(&a, &b));
        let c = array(Nested::from(vec![1.001, f64::NAN, 1e9]));
        assert!(!values_equivalent(&a, &c));
    }

    #[test]
    fn integer_values_compare_exactly() {
        let a = array(Nested::from(vec![1, 2, 3]));
        let b = array(Nested::from(vec![1, 2, 4]));
        assert!(!values_equivalent(&a, &b));
        let floats = Value::Array(
            NdArray::from_values(vec![3], vec![1.0, 2.0, 3.0], DType::F64).expect("floats"),
        );
        assert!(!values_equivalent(&a, &floats), "dtype must match");
        assert!(!values_equivalent(
            &Value::Scalar(Scalar::Int(2)),
            &Value::Shape(vec![2])
        ));

        let big = array(Nested::from(vec![9_007_199_254_740_993_i64]));
        let neighbour = array(Nested::from(vec![9_007_199_254_740_992_i64]));
        assert!(!values_equivalent(&big, &neighbour));
        assert!(values_equivalent(&big, &big.clone()));
    }

    #[test]
    fn matching_errors_are_equivalent() {
        let local: Result<Value, EngineError> =
            Err(pnp_linalg::LinAlgError::SingularMatrix.into());
        let remote = Err(EngineError::Remote(crate::WireError::from_engine_error(
            local.as_ref().expect_err("local error"),
        )));
        let report = compare_outcomes(local, remote);
        assert_eq!(
            report,
            Equivalence::Errors {
                kind: ErrorKind::SingularMatrix,
                message: "matrix was singular".to_string(),
            }
        );
        assert!(report.is_equivalent());
    }

    #[test]
    fn one_sided_failure_diverges() {
        let report = compare_outcomes(
            Ok(Value::Scalar(Scalar::Int(1))),
            Err(EngineError::Transport("closed".into())),
        );
        let Equivalence::Diverged { reason, .. } = &report else {
            panic!("diverged expected");
        };
        assert!(reason.contains("engine_transport_failure"));
        assert!(!report.is_equivalent());
    }

    #[test]
    fn worker_pool_evaluation_matches_local() {
        let evaluator = Evaluator::from_config(RuntimeConfig::default()).expect("pool");
        let x = array(Nested::from(vec![vec![2.0, 1.0], vec![1.0, 1.0]]));
        for op in [Operation::Eigh, Operation::Pinv, Operation::Norm] {
            let report = evaluator.evaluate_both(Arc::new(op), std::slice::from_ref(&x));
            assert!(matches!(report, Equivalence::Values(_)), "{op}: {report:?}");
        }
        let report = evaluator.evaluate_both(
            Arc::new(Operation::Binary(BinaryOp::Power)),
            &[array(Nested::from(vec![2, 3])), Value::Scalar(Scalar::Int(-1))],
        );
        assert!(matches!(
            report,
            Equivalence::Errors {
                kind: ErrorKind::Value,
                ..
            }
        ));
        assert_eq!(evaluator.ledger().len(), 8);
    }

    #[test]
    fn ledger_records_both_paths() {
        let evaluator = Evaluator::new(LocalEngine::new(), RuntimeConfig::default());
        let job: Arc<dyn Job> = Arc::new(FnJob::new("fail", |_args: &[Value]| {
            Err(EngineError::UnknownOperation("fail".into()))
        }));
        let report = evaluator.evaluate_both(job, &[]);
        assert!(report.is_equivalent());
        let events = evaluator.ledger().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, EvaluationPath::Local);
        assert_eq!(events[1].path, EvaluationPath::Remote);
        assert!(events.iter().all(|e| e.outcome == EvaluationOutcome::Fail));
        assert!(events.iter().all(|e| e.reason_code == "engine_unknown_operation"));
    }
}
